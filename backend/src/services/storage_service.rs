//! Storage service - facade over storage backends.
//!
//! Names archive keys deterministically from the artifact id, hashes
//! archives and accounts storage usage against the configured quota.

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::models::SourceKind;
use crate::storage::{FilesystemBackend, S3Backend, S3Config, StorageBackend};

/// Root prefix of every archive key.
pub const BACKUP_PREFIX: &str = "backups";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub object_count: usize,
    pub quota_bytes: Option<u64>,
    /// `used / quota * 100`, absent without a quota.
    pub percent_used: Option<f64>,
}

/// Storage service facade
pub struct StorageService {
    backend: Arc<dyn StorageBackend>,
    quota_bytes: Option<u64>,
}

impl StorageService {
    /// Create storage service from config
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match config {
            StorageConfig::Local { path, .. } => {
                fs::create_dir_all(path).await?;
                Arc::new(FilesystemBackend::new(path.clone()))
            }
            StorageConfig::S3 {
                bucket,
                region,
                endpoint,
                prefix,
                access_key,
                secret_key,
                ..
            } => {
                let mut s3 = S3Config::new(
                    bucket.clone(),
                    region.clone(),
                    endpoint.clone(),
                    prefix.clone(),
                );
                s3.access_key = access_key.clone();
                s3.secret_key = secret_key.clone();
                Arc::new(S3Backend::new(s3)?)
            }
        };

        Ok(Self::new(backend, config.quota_bytes()))
    }

    /// Create with a specific backend (for testing)
    pub fn new(backend: Arc<dyn StorageBackend>, quota_bytes: Option<u64>) -> Self {
        Self {
            backend,
            quota_bytes,
        }
    }

    /// Calculate SHA-256 hash of content
    pub fn calculate_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }

    /// Stream a file through SHA-256. Returns the hex digest and byte count.
    pub async fn hash_file(path: &Path) -> Result<(String, u64)> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((format!("{:x}", hasher.finalize()), total))
    }

    /// `backups/{kind}/{artifact_id}.{extension}`
    pub fn archive_key(kind: SourceKind, artifact_id: Uuid, extension: &str) -> String {
        format!("{}/{}/{}.{}", BACKUP_PREFIX, kind, artifact_id, extension)
    }

    /// Hand a finished local archive to the backend and return its locator.
    ///
    /// The local file is gone afterwards: the filesystem backend moves it,
    /// remote backends upload it and the intermediate is deleted here.
    pub async fn store_archive(&self, key: &str, local: &Path) -> Result<String> {
        self.backend.put_file(key, local).await?;

        if self.backend.is_remote() {
            if let Err(e) = fs::remove_file(local).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %local.display(), "Failed to remove local intermediate: {}", e);
                }
            }
        }

        Ok(self.backend.locator(key))
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        self.backend.get(key).await
    }

    pub async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        self.backend.put(key, content).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        self.backend.list(prefix).await
    }

    /// Sum of archive sizes under the backup prefix.
    pub async fn usage(&self) -> Result<StorageUsage> {
        let keys = self.backend.list(Some(BACKUP_PREFIX)).await?;
        let mut used_bytes = 0u64;
        for key in &keys {
            used_bytes += self.backend.size(key).await?;
        }

        let percent_used = self
            .quota_bytes
            .filter(|q| *q > 0)
            .map(|q| used_bytes as f64 / q as f64 * 100.0);

        Ok(StorageUsage {
            used_bytes,
            object_count: keys.len(),
            quota_bytes: self.quota_bytes,
            percent_used,
        })
    }

    /// Get underlying backend for direct access
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage(quota: Option<u64>) -> (StorageService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(FilesystemBackend::new(temp_dir.path().to_path_buf()));
        (StorageService::new(backend, quota), temp_dir)
    }

    #[test]
    fn test_archive_key_is_deterministic() {
        let id = Uuid::nil();
        assert_eq!(
            StorageService::archive_key(SourceKind::Database, id, "sql.gz"),
            "backups/database/00000000-0000-0000-0000-000000000000.sql.gz"
        );
    }

    #[test]
    fn test_calculate_hash() {
        assert_eq!(
            StorageService::calculate_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_hash_file_matches_in_memory_hash() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        let (hash, size) = StorageService::hash_file(&path).await.unwrap();
        assert_eq!(size, 200_000);
        assert_eq!(hash, StorageService::calculate_hash(&data));
    }

    #[tokio::test]
    async fn test_store_archive_returns_locator() {
        let (storage, _temp) = create_test_storage(None);
        let work = TempDir::new().unwrap();
        let local = work.path().join("x.tar");
        std::fs::write(&local, b"archive").unwrap();

        let locator = storage
            .store_archive("backups/files/x.tar", &local)
            .await
            .unwrap();
        assert!(locator.starts_with("file://"));
        assert!(!local.exists());
        assert_eq!(storage.get("backups/files/x.tar").await.unwrap(), "archive");
    }

    #[tokio::test]
    async fn test_usage_against_quota() {
        let (storage, _temp) = create_test_storage(Some(100));
        storage
            .put("backups/files/a", Bytes::from(vec![0u8; 60]))
            .await
            .unwrap();
        storage
            .put("backups/database/b", Bytes::from(vec![0u8; 36]))
            .await
            .unwrap();
        // Outside the backup prefix, not counted
        storage.put("scratch/c", Bytes::from(vec![0u8; 50])).await.unwrap();

        let usage = storage.usage().await.unwrap();
        assert_eq!(usage.used_bytes, 96);
        assert_eq!(usage.object_count, 2);
        assert_eq!(usage.percent_used, Some(96.0));
    }

    #[tokio::test]
    async fn test_usage_without_quota_has_no_percentage() {
        let (storage, _temp) = create_test_storage(None);
        let usage = storage.usage().await.unwrap();
        assert_eq!(usage.used_bytes, 0);
        assert!(usage.percent_used.is_none());
    }
}
