//! Filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::StorageBackend;
use crate::error::{AppError, Result};

/// Filesystem-based storage backend
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create new filesystem storage
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn not_found_or_storage(key: &str, e: std::io::Error) -> AppError {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("Storage key not found: {}", key))
        } else {
            AppError::Storage(format!("{}: {}", key, e))
        }
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let path = self.key_to_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically via temp file
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    /// Moves the file into place; falls back to copy + remove across devices.
    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let path = self.key_to_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::rename(source, &path).await.is_err() {
            fs::copy(source, &path).await?;
            fs::remove_file(source).await?;
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let content = fs::read(self.key_to_path(key))
            .await
            .map_err(|e| Self::not_found_or_storage(key, e))?;
        Ok(Bytes::from(content))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.key_to_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Failed to delete {}: {}", key, e))),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let search_path = match prefix {
            Some(p) => self.key_to_path(p),
            None => self.base_path.clone(),
        };

        let mut keys = Vec::new();
        let mut stack = vec![search_path];

        while let Some(current) = stack.pop() {
            if !fs::try_exists(&current).await? {
                continue;
            }

            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base_path) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if !key.ends_with(".tmp") {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let metadata = fs::metadata(self.key_to_path(key))
            .await
            .map_err(|e| Self::not_found_or_storage(key, e))?;
        Ok(metadata.len())
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn locator(&self, key: &str) -> String {
        format!("file://{}", self.key_to_path(key).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path());

        backend
            .put("backups/files/a.tar", Bytes::from("data"))
            .await
            .unwrap();
        assert!(backend.exists("backups/files/a.tar").await.unwrap());
        assert_eq!(backend.get("backups/files/a.tar").await.unwrap(), "data");
        assert_eq!(backend.size("backups/files/a.tar").await.unwrap(), 4);

        backend.delete("backups/files/a.tar").await.unwrap();
        assert!(!backend.exists("backups/files/a.tar").await.unwrap());
        // Second delete is a no-op
        backend.delete("backups/files/a.tar").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path());
        let err = backend.get("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_put_file_moves_source() {
        let temp = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path());

        let source = work.path().join("dump.sql");
        std::fs::write(&source, b"SELECT 1;").unwrap();

        backend.put_file("backups/database/x.sql", &source).await.unwrap();
        assert!(!source.exists());
        assert_eq!(
            backend.get("backups/database/x.sql").await.unwrap(),
            "SELECT 1;"
        );
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path());

        backend.put("backups/database/1", Bytes::from("1")).await.unwrap();
        backend.put("backups/database/2", Bytes::from("2")).await.unwrap();
        backend.put("backups/files/3", Bytes::from("3")).await.unwrap();

        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        assert_eq!(
            backend.list(Some("backups/database")).await.unwrap(),
            vec!["backups/database/1", "backups/database/2"]
        );
        assert!(backend.list(Some("missing")).await.unwrap().is_empty());
    }

    #[test]
    fn test_locator_is_file_url() {
        let backend = FilesystemBackend::new("/var/backups");
        assert_eq!(
            backend.locator("backups/files/x.tar.gz"),
            "file:///var/backups/backups/files/x.tar.gz"
        );
        assert!(!backend.is_remote());
    }
}
