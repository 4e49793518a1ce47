//! Backup and restore service.
//!
//! Drives archive producers, records artifact metadata, verifies checksums
//! before any restore, and applies retention.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{BackupConfig, RetentionPolicy};
use crate::error::{AppError, Result};
use crate::models::{Artifact, ArtifactStatus, BackupKind, SourceKind};
use crate::services::metrics_service;
use crate::services::producer::{ArchiveProducer, ProduceContext, RestoreTarget};
use crate::services::retention;
use crate::services::storage_service::StorageService;
use crate::store::MetadataStore;

/// Result of a checksum-only verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub artifact_id: Uuid,
    pub checksum: String,
    pub size_bytes: u64,
}

/// Result of a retention run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<Uuid>,
    pub kept: usize,
}

/// Backup service
pub struct BackupService {
    store: Arc<dyn MetadataStore>,
    storage: Arc<StorageService>,
    producers: HashMap<SourceKind, Arc<dyn ArchiveProducer>>,
    work_dir: PathBuf,
    compression: bool,
    retention: RetentionPolicy,
    /// Serializes restore, verify and delete per artifact id.
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl BackupService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: Arc<StorageService>,
        config: &BackupConfig,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            storage,
            producers: HashMap::new(),
            work_dir: config.work_dir.clone(),
            compression: config.compression,
            retention,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Register the producer for its source kind.
    pub fn with_producer(mut self, producer: Arc<dyn ArchiveProducer>) -> Self {
        self.producers.insert(producer.source_kind(), producer);
        self
    }

    pub fn storage(&self) -> &Arc<StorageService> {
        &self.storage
    }

    fn producer(&self, kind: SourceKind) -> Result<&Arc<dyn ArchiveProducer>> {
        self.producers
            .get(&kind)
            .ok_or_else(|| AppError::Config(format!("No producer configured for {} backups", kind)))
    }

    fn artifact_lock(&self, id: Uuid) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| AppError::Internal("artifact lock table poisoned".into()))?;
        Ok(locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone())
    }

    fn forget_lock(&self, id: Uuid) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&id);
        }
    }

    /// Produce, hash and store one archive.
    ///
    /// Producer and upload failures are recorded on a `failed` artifact and
    /// returned as `Ok`; only metadata persistence errors are returned as `Err`.
    pub async fn create_backup(
        &self,
        kind: SourceKind,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let started = Instant::now();
        let mut artifact = Artifact {
            id: Uuid::new_v4(),
            job_id,
            kind,
            created_at: Utc::now(),
            sources: Vec::new(),
            size_bytes: 0,
            compressed_size_bytes: 0,
            compressed: self.compression,
            duration_ms: 0,
            status: ArtifactStatus::InProgress,
            storage_key: String::new(),
            location: String::new(),
            checksum: String::new(),
            error: None,
        };
        self.store.upsert_artifact(&artifact).await?;

        info!(artifact_id = %artifact.id, job_id = %job_id, kind = %kind, "Starting backup");

        match self.produce_and_store(&mut artifact, cancel).await {
            Ok(()) => {
                artifact.status = ArtifactStatus::Success;
                info!(
                    artifact_id = %artifact.id,
                    size_bytes = artifact.size_bytes,
                    stored_bytes = artifact.compressed_size_bytes,
                    location = %artifact.location,
                    "Backup completed"
                );
            }
            Err(e) => {
                warn!(artifact_id = %artifact.id, kind = %kind, "Backup failed: {}", e);
                artifact.status = ArtifactStatus::Failed;
                artifact.error = Some(e.to_string());
                artifact.storage_key.clear();
                artifact.location.clear();
                artifact.checksum.clear();
            }
        }

        artifact.duration_ms = started.elapsed().as_millis() as u64;
        self.store.upsert_artifact(&artifact).await?;

        metrics_service::record_backup(
            &kind.to_string(),
            artifact.status == ArtifactStatus::Success,
            started.elapsed().as_secs_f64(),
            artifact.compressed_size_bytes,
        );

        Ok(artifact)
    }

    async fn produce_and_store(
        &self,
        artifact: &mut Artifact,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let producer = self.producer(artifact.kind)?.clone();
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let ctx = ProduceContext {
            artifact_id: artifact.id,
            work_dir: &self.work_dir,
            compress: self.compression,
            cancel,
        };
        let archive = producer.produce(&ctx).await?;

        let stored = async {
            let (checksum, stored_bytes) = StorageService::hash_file(&archive.path).await?;
            if cancel.is_cancelled() {
                return Err(AppError::BackupFailed("Backup cancelled".into()));
            }
            let key = StorageService::archive_key(artifact.kind, artifact.id, archive.extension);
            let location = self.storage.store_archive(&key, &archive.path).await?;
            Ok((checksum, stored_bytes, key, location))
        }
        .await;

        let (checksum, stored_bytes, key, location) = match stored {
            Ok(v) => v,
            Err(e) => {
                crate::services::producer::discard(&archive.path).await;
                return Err(e);
            }
        };

        artifact.sources = archive.sources;
        artifact.size_bytes = archive.size_bytes;
        artifact.compressed = archive.compressed;
        artifact.compressed_size_bytes = stored_bytes;
        artifact.checksum = checksum;
        artifact.storage_key = key;
        artifact.location = location;
        Ok(())
    }

    /// Run every source of a backup kind; `full` yields a database and a files artifact.
    pub async fn run_backup(
        &self,
        kind: BackupKind,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::with_capacity(kind.sources().len());
        for source in kind.sources() {
            let artifact = self.create_backup(*source, job_id, cancel).await?;
            let failed = artifact.status != ArtifactStatus::Success;
            artifacts.push(artifact);
            if failed {
                break;
            }
        }
        Ok(artifacts)
    }

    /// Download, verify and restore an artifact.
    ///
    /// A checksum mismatch aborts before the producer sees any data.
    pub async fn restore_from_backup(&self, artifact_id: Uuid, target: &RestoreTarget) -> Result<()> {
        let lock = self.artifact_lock(artifact_id)?;
        let _guard = lock.lock().await;

        let artifact = self.restorable(artifact_id).await?;
        let content = match self.fetch_verified(&artifact).await {
            Ok(c) => c,
            Err(e) => {
                metrics_service::record_restore(&artifact.kind.to_string(), false);
                return Err(e);
            }
        };

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let local = self
            .work_dir
            .join(format!("restore-{}-{}", artifact.id, Uuid::new_v4()));
        tokio::fs::write(&local, &content).await?;

        let result = self
            .producer(artifact.kind)?
            .restore(&local, artifact.compressed, target)
            .await;
        crate::services::producer::discard(&local).await;

        metrics_service::record_restore(&artifact.kind.to_string(), result.is_ok());
        match &result {
            Ok(()) => info!(artifact_id = %artifact.id, target = ?target, "Restore completed"),
            Err(e) => error!(artifact_id = %artifact.id, "Restore failed: {}", e),
        }
        result
    }

    /// Recompute the checksum of a stored artifact without restoring it.
    pub async fn verify_artifact(&self, artifact_id: Uuid) -> Result<VerifyReport> {
        let lock = self.artifact_lock(artifact_id)?;
        let _guard = lock.lock().await;

        let artifact = self.restorable(artifact_id).await?;
        let content = self.fetch_verified(&artifact).await?;
        Ok(VerifyReport {
            artifact_id,
            checksum: artifact.checksum,
            size_bytes: content.len() as u64,
        })
    }

    async fn restorable(&self, artifact_id: Uuid) -> Result<Artifact> {
        let artifact = self
            .store
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Backup {} not found", artifact_id)))?;
        if !artifact.is_restorable() {
            return Err(AppError::Validation(format!(
                "Backup {} is {:?} and cannot be restored",
                artifact_id, artifact.status
            )));
        }
        Ok(artifact)
    }

    async fn fetch_verified(&self, artifact: &Artifact) -> Result<bytes::Bytes> {
        let content = self.storage.get(&artifact.storage_key).await?;
        let actual = StorageService::calculate_hash(&content);
        if actual != artifact.checksum {
            error!(
                artifact_id = %artifact.id,
                expected = %artifact.checksum,
                actual = %actual,
                location = %artifact.location,
                "Backup integrity check failed, refusing to restore"
            );
            metrics_service::record_integrity_failure(&artifact.kind.to_string());
            return Err(AppError::Integrity {
                artifact_id: artifact.id,
                expected: artifact.checksum.clone(),
                actual,
            });
        }
        Ok(content)
    }

    /// Delete artifacts the retention policy no longer covers.
    pub async fn cleanup_old_backups(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let artifacts = self.store.list_artifacts().await?;
        let doomed = retention::plan_deletions(&artifacts, &self.retention, now);

        let mut report = CleanupReport {
            deleted: Vec::with_capacity(doomed.len()),
            kept: artifacts.len() - doomed.len(),
        };
        for id in doomed {
            match self.delete_backup(id).await {
                Ok(()) => report.deleted.push(id),
                // Removed concurrently
                Err(AppError::NotFound(_)) => {}
                Err(e) => {
                    warn!(artifact_id = %id, "Retention delete failed: {}", e);
                    report.kept += 1;
                }
            }
        }

        if !report.deleted.is_empty() {
            info!(
                deleted = report.deleted.len(),
                kept = report.kept,
                "Retention cleanup completed"
            );
        }
        metrics_service::record_retention_deletions(report.deleted.len() as u64);
        Ok(report)
    }

    /// Remove an artifact from storage and metadata.
    pub async fn delete_backup(&self, artifact_id: Uuid) -> Result<()> {
        let lock = self.artifact_lock(artifact_id)?;
        {
            let _guard = lock.lock().await;

            let artifact = self
                .store
                .get_artifact(artifact_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Backup {} not found", artifact_id)))?;
            if artifact.status == ArtifactStatus::InProgress {
                return Err(AppError::Conflict(format!(
                    "Backup {} is still in progress",
                    artifact_id
                )));
            }

            if !artifact.storage_key.is_empty() {
                self.storage.delete(&artifact.storage_key).await?;
            }
            self.store.delete_artifact(artifact_id).await?;
        }
        self.forget_lock(artifact_id);
        info!(artifact_id = %artifact_id, "Backup deleted");
        Ok(())
    }

    pub async fn list_backups(&self) -> Result<Vec<Artifact>> {
        self.store.list_artifacts().await
    }

    pub async fn get_backup(&self, artifact_id: Uuid) -> Result<Artifact> {
        self.store
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Backup {} not found", artifact_id)))
    }

    /// Most recent restorable artifact of a kind.
    pub async fn latest_successful(&self, kind: SourceKind) -> Result<Option<Artifact>> {
        Ok(self
            .store
            .list_artifacts()
            .await?
            .into_iter()
            .find(|a| a.kind == kind && a.is_restorable()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::producer::{FileProducer, PathFilter};
    use crate::storage::FilesystemBackend;
    use crate::store::InMemoryStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        service: BackupService,
        store: Arc<InMemoryStore>,
        storage: Arc<StorageService>,
        root: PathBuf,
        _dirs: Vec<TempDir>,
    }

    fn fixture() -> Fixture {
        let src = TempDir::new().unwrap();
        let archives = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let root = src.path().join("uploads");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("a.txt"), "alpha").unwrap();
        std::fs::write(root.join("nested/b.txt"), "bravo").unwrap();

        let store = Arc::new(InMemoryStore::new());
        let storage = Arc::new(StorageService::new(
            Arc::new(FilesystemBackend::new(archives.path())),
            None,
        ));
        let config = BackupConfig {
            work_dir: work.path().to_path_buf(),
            ..BackupConfig::default()
        };
        let service = BackupService::new(
            store.clone(),
            storage.clone(),
            &config,
            RetentionPolicy::default(),
        )
        .with_producer(Arc::new(FileProducer::new(
            vec![root.clone()],
            PathFilter::default(),
        )));

        Fixture {
            service,
            store,
            storage,
            root,
            _dirs: vec![src, archives, work],
        }
    }

    #[tokio::test]
    async fn test_create_backup_records_success() {
        let f = fixture();
        let artifact = f
            .service
            .create_backup(SourceKind::Files, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.status, ArtifactStatus::Success);
        assert!(artifact.is_restorable());
        assert_eq!(artifact.size_bytes, 10);
        assert!(artifact.storage_key.starts_with("backups/files/"));
        assert!(artifact.storage_key.ends_with(".tar.gz"));
        assert!(f.storage.exists(&artifact.storage_key).await.unwrap());
        assert_eq!(f.store.get_artifact(artifact.id).await.unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn test_missing_producer_yields_failed_artifact() {
        let f = fixture();
        let artifact = f
            .service
            .create_backup(SourceKind::Database, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Failed);
        assert!(artifact.error.is_some());
        assert!(artifact.checksum.is_empty());
    }

    #[tokio::test]
    async fn test_full_backup_stops_after_first_failure() {
        let f = fixture();
        let artifacts = f
            .service
            .run_backup(BackupKind::Full, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();
        // Database producer is not registered, so the run stops there.
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, SourceKind::Database);
        assert_eq!(artifacts[0].status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let f = fixture();
        let artifact = f
            .service
            .create_backup(SourceKind::Files, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();

        std::fs::remove_dir_all(&f.root).unwrap();
        f.service
            .restore_from_backup(artifact.id, &RestoreTarget::Live)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(f.root.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            std::fs::read_to_string(f.root.join("nested/b.txt")).unwrap(),
            "bravo"
        );
    }

    #[tokio::test]
    async fn test_corrupted_archive_is_never_restored() {
        let f = fixture();
        let artifact = f
            .service
            .create_backup(SourceKind::Files, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();

        f.storage
            .put(&artifact.storage_key, Bytes::from_static(b"tampered"))
            .await
            .unwrap();
        std::fs::write(f.root.join("a.txt"), "changed").unwrap();

        let err = f
            .service
            .restore_from_backup(artifact.id, &RestoreTarget::Live)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Integrity { .. }));
        assert_eq!(std::fs::read_to_string(f.root.join("a.txt")).unwrap(), "changed");

        let err = f.service.verify_artifact(artifact.id).await.unwrap_err();
        assert!(matches!(err, AppError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_delete_backup_removes_object_and_record() {
        let f = fixture();
        let artifact = f
            .service
            .create_backup(SourceKind::Files, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();

        f.service.delete_backup(artifact.id).await.unwrap();
        assert!(!f.storage.exists(&artifact.storage_key).await.unwrap());
        assert!(matches!(
            f.service.get_backup(artifact.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            f.service.delete_backup(artifact.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_latest_successful_skips_failed() {
        let f = fixture();
        let ok = f
            .service
            .create_backup(SourceKind::Files, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();
        let latest = f.service.latest_successful(SourceKind::Files).await.unwrap();
        assert_eq!(latest.map(|a| a.id), Some(ok.id));
        assert!(f
            .service
            .latest_successful(SourceKind::Database)
            .await
            .unwrap()
            .is_none());
    }
}
