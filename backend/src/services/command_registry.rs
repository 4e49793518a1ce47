//! Allowlisted commands for automated and verification recovery steps.
//!
//! Recovery procedures reference commands by id only. Each id maps to a
//! handler compiled into the binary; there is no shell execution.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::{AppError, Result};
use crate::models::{ArtifactStatus, BackupKind, SourceKind};
use crate::services::backup_service::BackupService;
use crate::services::producer::RestoreTarget;

pub const RESTORE_LATEST_DATABASE: &str = "restore_latest_database";
pub const RESTORE_LATEST_FILES: &str = "restore_latest_files";
pub const VERIFY_LATEST_BACKUPS: &str = "verify_latest_backups";
pub const RUN_FULL_BACKUP: &str = "run_full_backup";
pub const CHECK_SERVICE_HEALTH: &str = "check_service_health";
pub const CHECK_STORAGE: &str = "check_storage";

/// Whether a command may touch production state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    Production,
    /// Dry run against an isolated environment.
    Test { environment: String },
}

impl ExecutionMode {
    pub fn is_test(&self) -> bool {
        matches!(self, ExecutionMode::Test { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub message: String,
    /// Problems worth fixing that did not fail the command.
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl CommandOutput {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn description(&self) -> &str;

    /// Run the command. In test mode implementations must not mutate
    /// production state.
    async fn run(&self, mode: &ExecutionMode) -> Result<CommandOutput>;
}

#[derive(Default)]
pub struct CommandRegistry {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command.
    pub fn with_builtins(
        backups: Arc<BackupService>,
        config: &RecoveryConfig,
        health_check_url: Option<String>,
        health_check_timeout: Duration,
    ) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(
            RESTORE_LATEST_DATABASE,
            Arc::new(RestoreLatestBackup {
                backups: backups.clone(),
                kind: SourceKind::Database,
                test_database_url: config.test_database_url.clone(),
                test_restore_dir: config.test_restore_dir.clone(),
            }),
        );
        registry.register(
            RESTORE_LATEST_FILES,
            Arc::new(RestoreLatestBackup {
                backups: backups.clone(),
                kind: SourceKind::Files,
                test_database_url: None,
                test_restore_dir: config.test_restore_dir.clone(),
            }),
        );
        registry.register(
            VERIFY_LATEST_BACKUPS,
            Arc::new(VerifyLatestBackups {
                backups: backups.clone(),
            }),
        );
        registry.register(
            RUN_FULL_BACKUP,
            Arc::new(RunBackup {
                backups: backups.clone(),
                kind: BackupKind::Full,
            }),
        );
        registry.register(CHECK_STORAGE, Arc::new(CheckStorage { backups }));
        registry.register(
            CHECK_SERVICE_HEALTH,
            Arc::new(HttpProbe::new(health_check_url, health_check_timeout)?),
        );
        Ok(registry)
    }

    pub fn register(&mut self, id: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(id.to_string(), handler);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Run a command for the named step. Both unknown ids and handler
    /// failures come back as `RecoveryStep`.
    pub async fn run(&self, step: &str, id: &str, mode: &ExecutionMode) -> Result<CommandOutput> {
        let handler = self.handlers.get(id).ok_or_else(|| AppError::RecoveryStep {
            step: step.to_string(),
            message: format!("command '{}' is not registered", id),
        })?;
        info!(step, command = id, test_mode = mode.is_test(), "Running recovery command");
        handler.run(mode).await.map_err(|e| match e {
            AppError::RecoveryStep { .. } => e,
            other => AppError::RecoveryStep {
                step: step.to_string(),
                message: other.to_string(),
            },
        })
    }
}

/// Restore the newest successful artifact of one kind. In test mode the
/// restore goes to the isolated database or a scratch directory.
struct RestoreLatestBackup {
    backups: Arc<BackupService>,
    kind: SourceKind,
    test_database_url: Option<String>,
    test_restore_dir: PathBuf,
}

#[async_trait]
impl CommandHandler for RestoreLatestBackup {
    fn description(&self) -> &str {
        match self.kind {
            SourceKind::Database => "Restore the latest database backup",
            SourceKind::Files => "Restore the latest file backup",
        }
    }

    async fn run(&self, mode: &ExecutionMode) -> Result<CommandOutput> {
        let artifact = self
            .backups
            .latest_successful(self.kind)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No successful {} backup", self.kind)))?;

        let target = match mode {
            ExecutionMode::Production => RestoreTarget::Live,
            ExecutionMode::Test { environment } => match (&self.test_database_url, self.kind) {
                (Some(url), SourceKind::Database) => RestoreTarget::Database(url.clone()),
                _ => RestoreTarget::Directory(
                    self.test_restore_dir
                        .join(environment)
                        .join(artifact.id.to_string()),
                ),
            },
        };

        self.backups.restore_from_backup(artifact.id, &target).await?;

        let mut output = CommandOutput::message(format!(
            "Restored {} backup {} from {}",
            self.kind, artifact.id, artifact.created_at
        ));
        if mode.is_test() && self.kind == SourceKind::Database && self.test_database_url.is_none() {
            output.recommendations.push(
                "Configure RECOVERY_TEST_DATABASE_URL so database restores are exercised end to end"
                    .into(),
            );
        }
        Ok(output)
    }
}

struct VerifyLatestBackups {
    backups: Arc<BackupService>,
}

#[async_trait]
impl CommandHandler for VerifyLatestBackups {
    fn description(&self) -> &str {
        "Verify checksums of the latest backups"
    }

    async fn run(&self, _mode: &ExecutionMode) -> Result<CommandOutput> {
        let mut verified = Vec::new();
        let mut output = CommandOutput::default();
        for kind in [SourceKind::Database, SourceKind::Files] {
            match self.backups.latest_successful(kind).await? {
                Some(artifact) => {
                    let report = self.backups.verify_artifact(artifact.id).await?;
                    verified.push(format!("{} {}", kind, report.artifact_id));
                }
                None => output.issues.push(format!("No successful {} backup exists", kind)),
            }
        }
        if verified.is_empty() {
            return Err(AppError::NotFound("No backups to verify".into()));
        }
        output.message = format!("Checksums verified: {}", verified.join(", "));
        Ok(output)
    }
}

/// Take a fresh backup. Skipped in test mode since it writes to the
/// production backup set.
struct RunBackup {
    backups: Arc<BackupService>,
    kind: BackupKind,
}

#[async_trait]
impl CommandHandler for RunBackup {
    fn description(&self) -> &str {
        "Run an ad-hoc backup"
    }

    async fn run(&self, mode: &ExecutionMode) -> Result<CommandOutput> {
        if mode.is_test() {
            return Ok(CommandOutput::message(format!(
                "Skipped {} backup in test mode",
                self.kind
            )));
        }

        // DR-initiated backups are not owned by a scheduled job.
        let run_id = Uuid::new_v4();
        let artifacts = self
            .backups
            .run_backup(self.kind, run_id, &CancellationToken::new())
            .await?;
        if let Some(failed) = artifacts.iter().find(|a| a.status != ArtifactStatus::Success) {
            return Err(AppError::BackupFailed(
                failed
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} backup failed", failed.kind)),
            ));
        }
        Ok(CommandOutput::message(format!(
            "Created {} artifact(s) for run {}",
            artifacts.len(),
            run_id
        )))
    }
}

struct CheckStorage {
    backups: Arc<BackupService>,
}

#[async_trait]
impl CommandHandler for CheckStorage {
    fn description(&self) -> &str {
        "Check backup storage is reachable"
    }

    async fn run(&self, _mode: &ExecutionMode) -> Result<CommandOutput> {
        let usage = self.backups.storage().usage().await?;
        let mut output = CommandOutput::message(format!(
            "{} archives, {} bytes",
            usage.object_count, usage.used_bytes
        ));
        if usage.object_count == 0 {
            output.issues.push("Backup storage holds no archives".into());
        }
        Ok(output)
    }
}

struct HttpProbe {
    client: Client,
    url: Option<String>,
}

impl HttpProbe {
    fn new(url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl CommandHandler for HttpProbe {
    fn description(&self) -> &str {
        "Probe the service health endpoint"
    }

    async fn run(&self, _mode: &ExecutionMode) -> Result<CommandOutput> {
        let Some(url) = &self.url else {
            let mut output = CommandOutput::message("No health endpoint configured");
            output
                .recommendations
                .push("Set HEALTH_CHECK_URL so recovery can confirm service health".into());
            return Ok(output);
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::HealthCheck(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(AppError::HealthCheck(format!(
                "{} returned HTTP {}",
                url,
                resp.status()
            )));
        }
        Ok(CommandOutput::message(format!("{} is healthy", url)))
    }
}
