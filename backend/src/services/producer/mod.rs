//! Archive producers: turn a data source into a single archive file.

pub mod database;
pub mod files;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::models::SourceKind;

pub use database::{DatabaseDumper, DatabaseProducer, PgDumper};
pub use files::{FileProducer, PathFilter};

/// Inputs for one producer run.
pub struct ProduceContext<'a> {
    pub artifact_id: Uuid,
    /// Scratch directory owned by the caller.
    pub work_dir: &'a Path,
    pub compress: bool,
    pub cancel: &'a CancellationToken,
}

/// A finished archive on local disk.
#[derive(Debug, Clone)]
pub struct ProducedArchive {
    pub path: PathBuf,
    /// Key extension, e.g. `sql.gz` or `tar`.
    pub extension: &'static str,
    /// Tables or relative file paths captured.
    pub sources: Vec<String>,
    /// Size before compression.
    pub size_bytes: u64,
    pub compressed: bool,
}

/// Where a restore writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// Overwrite the live sources the archive was taken from.
    Live,
    /// Unpack into a scratch directory. Database dumps are written there as plain SQL.
    Directory(PathBuf),
    /// Load a database dump into another database.
    Database(String),
}

#[async_trait]
pub trait ArchiveProducer: Send + Sync {
    fn source_kind(&self) -> SourceKind;

    /// Build an archive under `ctx.work_dir`.
    ///
    /// Failures of the dump or archive step are reported as
    /// `AppError::BackupFailed`; partial output is removed.
    async fn produce(&self, ctx: &ProduceContext<'_>) -> Result<ProducedArchive>;

    /// Inverse of `produce` for an archive already verified by the caller.
    async fn restore(&self, archive: &Path, compressed: bool, target: &RestoreTarget)
        -> Result<()>;
}

/// Best-effort removal of partial output.
pub(crate) async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "Failed to remove partial archive: {}", e);
        }
    }
}
