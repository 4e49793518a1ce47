//! S3 storage backend using rust-s3 crate.
//!
//! Supports AWS S3 and S3-compatible services (MinIO, etc.).
//! Configuration via environment variables:
//! - S3_BUCKET: Bucket name (required)
//! - S3_REGION: AWS region (default: us-east-1)
//! - S3_ENDPOINT: Custom endpoint URL for S3-compatible services
//! - S3_PREFIX: Optional key prefix for every backup object
//! - S3_ACCESS_KEY_ID / S3_SECRET_ACCESS_KEY: Explicit credentials
//!   (falls back to the default AWS credential chain)

use async_trait::async_trait;
use bytes::Bytes;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;

use crate::error::{AppError, Result};

/// S3 storage backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO compatibility)
    pub endpoint: Option<String>,
    /// Optional key prefix for all objects
    pub prefix: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl S3Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let bucket =
            std::env::var("S3_BUCKET").map_err(|_| AppError::Config("S3_BUCKET not set".into()))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());

        Ok(Self {
            bucket,
            region,
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            prefix: std::env::var("S3_PREFIX").ok(),
            access_key: std::env::var("S3_ACCESS_KEY_ID").ok(),
            secret_key: std::env::var("S3_SECRET_ACCESS_KEY").ok(),
        })
    }

    /// Create config with explicit values
    pub fn new(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Self {
        Self {
            bucket,
            region,
            endpoint,
            prefix,
            access_key: None,
            secret_key: None,
        }
    }
}

/// S3-compatible storage backend
pub struct S3Backend {
    bucket: Box<Bucket>,
    prefix: Option<String>,
}

impl S3Backend {
    /// Create new S3 backend from configuration
    pub fn new(config: S3Config) -> Result<Self> {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(ak), Some(sk)) => {
                Credentials::new(Some(ak), Some(sk), None, None, None).map_err(|e| {
                    AppError::Config(format!("Invalid S3 credentials: {}", e))
                })?
            }
            // env vars -> ~/.aws/credentials -> container credentials -> instance metadata
            _ => Credentials::default()
                .map_err(|e| AppError::Config(format!("Failed to load AWS credentials: {}", e)))?,
        };

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid S3 region: {}", config.region)))?,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| AppError::Config(format!("Failed to create S3 bucket: {}", e)))?;

        // Path-style access for MinIO and friends
        let bucket = if config.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        tracing::info!(
            bucket = %config.bucket,
            prefix = ?config.prefix,
            custom_endpoint = config.endpoint.is_some(),
            "S3 backup storage configured"
        );

        Ok(Self {
            bucket,
            prefix: config.prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        join_prefix(self.prefix.as_deref(), key)
    }

    fn strip_prefix(&self, key: &str) -> String {
        strip_key_prefix(self.prefix.as_deref(), key)
    }
}

fn join_prefix(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_string(),
    }
}

fn strip_key_prefix(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => {
            let prefix_with_slash = format!("{}/", prefix.trim_end_matches('/'));
            key.strip_prefix(&prefix_with_slash)
                .unwrap_or(key)
                .to_string()
        }
        None => key.to_string(),
    }
}

fn is_not_found(err: &str) -> bool {
    err.contains("404") || err.contains("NoSuchKey") || err.contains("Not Found")
}

#[async_trait]
impl super::StorageBackend for S3Backend {
    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let full_key = self.full_key(key);

        self.bucket
            .put_object(&full_key, &content)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to put object '{}': {}", key, e)))?;

        tracing::debug!(key = %key, size = content.len(), "S3 put object successful");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full_key = self.full_key(key);

        let response = self.bucket.get_object(&full_key).await.map_err(|e| {
            let err_str = e.to_string();
            if is_not_found(&err_str) {
                AppError::NotFound(format!("Storage key not found: {}", key))
            } else {
                AppError::Storage(format!("Failed to get object '{}': {}", key, e))
            }
        })?;

        tracing::debug!(key = %key, size = response.bytes().len(), "S3 get object successful");
        Ok(Bytes::from(response.to_vec()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);

        match self.bucket.head_object(&full_key).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e.to_string()) => Ok(false),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to check existence of '{}': {}",
                key, e
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);

        match self.bucket.delete_object(&full_key).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e.to_string()) => {}
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to delete object '{}': {}",
                    key, e
                )))
            }
        }

        tracing::debug!(key = %key, "S3 delete object successful");
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let search_prefix = match (&self.prefix, prefix) {
            (Some(base), Some(p)) => format!("{}/{}", base.trim_end_matches('/'), p),
            (Some(base), None) => format!("{}/", base.trim_end_matches('/')),
            (None, Some(p)) => p.to_string(),
            (None, None) => String::new(),
        };

        let results = self
            .bucket
            .list(search_prefix, None)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to list objects: {}", e)))?;

        let keys: Vec<String> = results
            .into_iter()
            .flat_map(|result| result.contents)
            .map(|obj| self.strip_prefix(&obj.key))
            .collect();

        tracing::debug!(prefix = ?prefix, count = keys.len(), "S3 list objects successful");
        Ok(keys)
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let full_key = self.full_key(key);

        let (head, _) = self.bucket.head_object(&full_key).await.map_err(|e| {
            if is_not_found(&e.to_string()) {
                AppError::NotFound(format!("Storage key not found: {}", key))
            } else {
                AppError::Storage(format!("Failed to get object metadata '{}': {}", key, e))
            }
        })?;

        Ok(head.content_length.unwrap_or(0).max(0) as u64)
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn locator(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket.name(), self.full_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_key_with_prefix() {
        assert_eq!(
            join_prefix(Some("nightly/"), "backups/files/a.tar.gz"),
            "nightly/backups/files/a.tar.gz"
        );
    }

    #[test]
    fn test_full_key_without_prefix() {
        assert_eq!(join_prefix(None, "backups/files/a.tar"), "backups/files/a.tar");
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(
            strip_key_prefix(Some("nightly"), "nightly/backups/database/x.sql"),
            "backups/database/x.sql"
        );
        // Keys outside the prefix are returned untouched
        assert_eq!(strip_key_prefix(Some("nightly"), "other/x"), "other/x");
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("Got HTTP 404 with content 'NoSuchKey'"));
        assert!(!is_not_found("Got HTTP 500"));
    }

    #[test]
    fn test_s3_config_new() {
        let config = S3Config::new(
            "backups".to_string(),
            "us-west-2".to_string(),
            Some("http://localhost:9000".to_string()),
            Some("prefix".to_string()),
        );

        assert_eq!(config.bucket, "backups");
        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert!(config.access_key.is_none());
    }

    #[test]
    fn test_backend_with_explicit_credentials() {
        let mut config = S3Config::new(
            "backups".to_string(),
            "us-east-1".to_string(),
            Some("http://localhost:9000".to_string()),
            None,
        );
        config.access_key = Some("minio".into());
        config.secret_key = Some("minio123".into());

        let backend = S3Backend::new(config).unwrap();
        use super::super::StorageBackend;
        assert!(backend.is_remote());
        assert_eq!(
            backend.locator("backups/files/a.tar"),
            "s3://backups/backups/files/a.tar"
        );
    }
}
