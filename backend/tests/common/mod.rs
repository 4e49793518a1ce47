//! Shared harness for integration tests.
//!
//! Wires the real services over the in-memory metadata store, a filesystem
//! storage backend in a temporary directory, a scripted database dumper and
//! a file producer over a temporary source tree.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use backup_keeper_backend::config::{
    BackupConfig, MonitorConfig, RecoveryConfig, RetentionPolicy,
};
use backup_keeper_backend::error::{AppError, Result};
use backup_keeper_backend::services::alert_service::AlertService;
use backup_keeper_backend::services::backup_service::BackupService;
use backup_keeper_backend::services::command_registry::CommandRegistry;
use backup_keeper_backend::services::health_monitor_service::BackupMonitor;
use backup_keeper_backend::services::notification_service::{
    Notification, NotificationService, Notifier,
};
use backup_keeper_backend::services::producer::{
    DatabaseDumper, DatabaseProducer, FileProducer, PathFilter,
};
use backup_keeper_backend::services::recovery_service::RecoveryController;
use backup_keeper_backend::services::scheduler_service::BackupScheduler;
use backup_keeper_backend::services::storage_service::StorageService;
use backup_keeper_backend::storage::FilesystemBackend;
use backup_keeper_backend::store::{InMemoryStore, MetadataStore};

pub const DUMP_SQL: &str = "CREATE TABLE accounts (id int);\nINSERT INTO accounts VALUES (1);\n";

/// Dumper that fails a configured number of times before succeeding and
/// records every restore.
#[derive(Default)]
pub struct ScriptedDumper {
    failures_left: AtomicUsize,
    pub dumps: AtomicUsize,
    pub restored: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedDumper {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DatabaseDumper for ScriptedDumper {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(vec!["public.accounts".into()])
    }

    async fn dump(&self, out: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::BackupFailed("pg_dump failed (exit 1): connection refused".into()));
        }
        tokio::fs::write(out, DUMP_SQL).await?;
        Ok(())
    }

    async fn restore(&self, sql: &Path, target_url: Option<&str>) -> Result<()> {
        let body = tokio::fs::read_to_string(sql).await?;
        self.restored
            .lock()
            .unwrap()
            .push((body, target_url.map(String::from)));
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Default)]
pub struct CollectingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for CollectingNotifier {
    fn name(&self) -> &'static str {
        "collecting"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub source_root: PathBuf,
    pub store: Arc<InMemoryStore>,
    pub storage: Arc<StorageService>,
    pub dumper: Arc<ScriptedDumper>,
    pub backups: Arc<BackupService>,
    pub notifier: Arc<CollectingNotifier>,
    pub notifications: Arc<NotificationService>,
    pub alerts: Arc<AlertService>,
    pub scheduler: Arc<BackupScheduler>,
}

pub struct HarnessOptions {
    pub dump_failures: usize,
    pub quota_bytes: Option<u64>,
    pub retention: RetentionPolicy,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            dump_failures: 0,
            quota_bytes: None,
            retention: RetentionPolicy::default(),
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let source_root = dir.path().join("appdata");
        write_file(&source_root, "config/app.toml", "port = 8080\n");
        write_file(&source_root, "uploads/a.txt", "alpha");
        write_file(&source_root, "cache/tmp.bin", "scratch");

        let store = Arc::new(InMemoryStore::new());
        let store_dyn: Arc<dyn MetadataStore> = store.clone();
        let storage = Arc::new(StorageService::new(
            Arc::new(FilesystemBackend::new(dir.path().join("archives"))),
            options.quota_bytes,
        ));
        let dumper = Arc::new(ScriptedDumper::failing(options.dump_failures));

        let backup_config = BackupConfig {
            work_dir: dir.path().join("work"),
            ..Default::default()
        };
        let filter = PathFilter::new(&[], &["cache/**".to_string()]).unwrap();
        let backups = Arc::new(
            BackupService::new(
                store_dyn.clone(),
                storage.clone(),
                &backup_config,
                options.retention,
            )
            .with_producer(Arc::new(DatabaseProducer::new(dumper.clone())))
            .with_producer(Arc::new(FileProducer::new(vec![source_root.clone()], filter))),
        );

        let notifier = Arc::new(CollectingNotifier::default());
        let notifications = Arc::new(NotificationService::new(vec![notifier.clone()]));
        let alerts = Arc::new(AlertService::new(
            store_dyn.clone(),
            notifications.clone(),
            chrono::Duration::hours(4),
        ));
        let scheduler = Arc::new(BackupScheduler::new(store_dyn, backups.clone()));

        Self {
            dir,
            source_root,
            store,
            storage,
            dumper,
            backups,
            notifier,
            notifications,
            alerts,
            scheduler,
        }
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// A fresh scheduler over the same store and services, as after a
    /// process restart.
    pub fn restarted_scheduler(&self) -> Arc<BackupScheduler> {
        Arc::new(BackupScheduler::new(self.store(), self.backups.clone()))
    }

    pub fn monitor(&self, config: MonitorConfig) -> BackupMonitor {
        BackupMonitor::new(self.store(), self.alerts.clone(), self.storage.clone(), config)
            .unwrap()
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            test_restore_dir: self.dir.path().join("dr-test"),
            ..Default::default()
        }
    }

    pub async fn recovery(&self) -> Arc<RecoveryController> {
        let config = self.recovery_config();
        let registry = Arc::new(CommandRegistry::with_builtins(
            self.backups.clone(),
            &config,
            None,
            std::time::Duration::from_secs(1),
        )
        .unwrap());
        let controller = Arc::new(RecoveryController::new(
            self.store(),
            registry,
            self.alerts.clone(),
            self.notifications.clone(),
            config,
        ));
        controller.seed_procedures().await.unwrap();
        controller
    }

    pub fn sent_titles(&self) -> Vec<String> {
        self.notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.title.clone())
            .collect()
    }
}

pub fn write_file(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}
