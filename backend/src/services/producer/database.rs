//! Database dump producer.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{discard, ArchiveProducer, ProduceContext, ProducedArchive, RestoreTarget};
use crate::error::{AppError, Result};
use crate::models::SourceKind;

/// The external dump tool, behind a seam so tests can script failures.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Tables included in a dump, schema-qualified.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Write a plain SQL dump of the live database to `out`.
    async fn dump(&self, out: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Load a plain SQL dump. `target_url` of `None` means the live database.
    async fn restore(&self, sql: &Path, target_url: Option<&str>) -> Result<()>;
}

/// `pg_dump` / `psql` driven through child processes.
pub struct PgDumper {
    pool: PgPool,
    database_url: String,
    pg_dump_path: String,
    psql_path: String,
}

impl PgDumper {
    pub fn new(
        pool: PgPool,
        database_url: impl Into<String>,
        pg_dump_path: impl Into<String>,
        psql_path: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            database_url: database_url.into(),
            pg_dump_path: pg_dump_path.into(),
            psql_path: psql_path.into(),
        }
    }
}

/// Run a child process to completion, killing it if `cancel` fires first.
async fn run_tool(
    mut command: tokio::process::Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<Output> {
    let child = command
        .kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| AppError::BackupFailed(format!("Failed to execute {}: {}", program, e)))?;

    let output = tokio::select! {
        out = child.wait_with_output() => out
            .map_err(|e| AppError::BackupFailed(format!("{} did not complete: {}", program, e)))?,
        _ = cancel.cancelled() => {
            return Err(AppError::BackupFailed(format!("{} cancelled", program)));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::BackupFailed(format!(
            "{} failed (exit {}): {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(output)
}

#[async_trait]
impl DatabaseDumper for PgDumper {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT schemaname || '.' || tablename
            FROM pg_tables
            WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn dump(&self, out: &Path, cancel: &CancellationToken) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.pg_dump_path);
        command
            .arg("--dbname")
            .arg(&self.database_url)
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--clean")
            .arg("--if-exists")
            .arg("--file")
            .arg(out);
        run_tool(command, "pg_dump", cancel).await?;
        Ok(())
    }

    async fn restore(&self, sql: &Path, target_url: Option<&str>) -> Result<()> {
        let url = target_url.unwrap_or(&self.database_url);
        let mut command = tokio::process::Command::new(&self.psql_path);
        command
            .arg("--dbname")
            .arg(url)
            .arg("--single-transaction")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--quiet")
            .arg("--file")
            .arg(sql);
        // A restore is never abandoned halfway.
        run_tool(command, "psql", &CancellationToken::new())
            .await
            .map_err(|e| match e {
                AppError::BackupFailed(msg) => AppError::Internal(format!("Restore failed: {}", msg)),
                other => other,
            })?;
        Ok(())
    }
}

/// Produces `*.sql` / `*.sql.gz` archives via a [`DatabaseDumper`].
pub struct DatabaseProducer {
    dumper: Arc<dyn DatabaseDumper>,
}

impl DatabaseProducer {
    pub fn new(dumper: Arc<dyn DatabaseDumper>) -> Self {
        Self { dumper }
    }
}

fn gzip_file(source: PathBuf, dest: PathBuf) -> std::io::Result<()> {
    let mut input = std::fs::File::open(&source)?;
    let output = std::fs::File::create(&dest)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    Ok(())
}

fn gunzip_file(source: PathBuf, dest: PathBuf) -> std::io::Result<()> {
    let input = std::fs::File::open(&source)?;
    let mut decoder = GzDecoder::new(input);
    let mut output = std::fs::File::create(&dest)?;
    std::io::copy(&mut decoder, &mut output)?;
    Ok(())
}

async fn blocking_io<F>(f: F) -> Result<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
        .map_err(AppError::from)
}

#[async_trait]
impl ArchiveProducer for DatabaseProducer {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Database
    }

    async fn produce(&self, ctx: &ProduceContext<'_>) -> Result<ProducedArchive> {
        let tables = self
            .dumper
            .list_tables()
            .await
            .map_err(|e| AppError::BackupFailed(format!("Failed to enumerate tables: {}", e)))?;

        let plain = ctx.work_dir.join(format!("{}.sql", ctx.artifact_id));
        if let Err(e) = self.dumper.dump(&plain, ctx.cancel).await {
            discard(&plain).await;
            return Err(match e {
                AppError::BackupFailed(_) => e,
                other => AppError::BackupFailed(other.to_string()),
            });
        }

        let size_bytes = tokio::fs::metadata(&plain).await?.len();
        tracing::debug!(
            artifact_id = %ctx.artifact_id,
            tables = tables.len(),
            size_bytes,
            "Database dump written"
        );

        if !ctx.compress {
            return Ok(ProducedArchive {
                path: plain,
                extension: "sql",
                sources: tables,
                size_bytes,
                compressed: false,
            });
        }

        if ctx.cancel.is_cancelled() {
            discard(&plain).await;
            return Err(AppError::BackupFailed("Backup cancelled".into()));
        }

        let gz = ctx.work_dir.join(format!("{}.sql.gz", ctx.artifact_id));
        let result = blocking_io({
            let (plain, gz) = (plain.clone(), gz.clone());
            move || gzip_file(plain, gz)
        })
        .await;
        discard(&plain).await;
        if let Err(e) = result {
            discard(&gz).await;
            return Err(AppError::BackupFailed(format!("Compression failed: {}", e)));
        }

        Ok(ProducedArchive {
            path: gz,
            extension: "sql.gz",
            sources: tables,
            size_bytes,
            compressed: true,
        })
    }

    async fn restore(
        &self,
        archive: &Path,
        compressed: bool,
        target: &RestoreTarget,
    ) -> Result<()> {
        let scratch = std::env::temp_dir().join(format!("restore-{}.sql", Uuid::new_v4()));

        let sql: PathBuf = if compressed {
            if let Err(e) = blocking_io({
                let (src, dst) = (archive.to_path_buf(), scratch.clone());
                move || gunzip_file(src, dst)
            })
            .await
            {
                discard(&scratch).await;
                return Err(e);
            }
            scratch.clone()
        } else {
            archive.to_path_buf()
        };

        let result = match target {
            RestoreTarget::Live => self.dumper.restore(&sql, None).await,
            RestoreTarget::Database(url) => self.dumper.restore(&sql, Some(url)).await,
            RestoreTarget::Directory(dir) => async {
                tokio::fs::create_dir_all(dir).await?;
                tokio::fs::copy(&sql, dir.join("dump.sql")).await?;
                Ok::<(), AppError>(())
            }
            .await,
        };

        if compressed {
            discard(&scratch).await;
        }
        result
    }
}
