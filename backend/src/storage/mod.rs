//! Storage backends for backup archives.

pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;

pub use filesystem::FilesystemBackend;
pub use s3::{S3Backend, S3Config};

/// Storage backend trait
///
/// Keys are relative, `/`-separated paths such as
/// `backups/database/<artifact-id>.sql.gz`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store content with the given key
    async fn put(&self, key: &str, content: Bytes) -> Result<()>;

    /// Store a finished local file under `key`.
    ///
    /// The default reads the file and calls `put`; the local file is left
    /// in place for the caller to remove.
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let content = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(content)).await
    }

    /// Retrieve content by key
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete content by key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys under an optional prefix
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Get content size without fetching full content
    async fn size(&self, key: &str) -> Result<u64>;

    /// Whether objects leave the local machine.
    fn is_remote(&self) -> bool;

    /// Opaque locator recorded on artifacts (`file://...`, `s3://...`).
    fn locator(&self, key: &str) -> String;
}
