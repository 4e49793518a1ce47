//! Application configuration loaded from environment variables.

use chrono::Weekday;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::{DisasterSeverity, DisasterType};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// OTLP collector endpoint (optional)
    pub otel_endpoint: Option<String>,

    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub retention: RetentionPolicy,
    pub monitor: MonitorConfig,
    pub notifications: NotificationConfig,
    pub recovery: RecoveryConfig,
}

/// Where archives are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        path: PathBuf,
        quota_bytes: Option<u64>,
    },
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
        prefix: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        quota_bytes: Option<u64>,
    },
}

impl StorageConfig {
    pub fn quota_bytes(&self) -> Option<u64> {
        match self {
            StorageConfig::Local { quota_bytes, .. } | StorageConfig::S3 { quota_bytes, .. } => {
                *quota_bytes
            }
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            path: PathBuf::from("/var/lib/backup-keeper/archives"),
            quota_bytes: None,
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Scratch directory for dumps and archives before upload.
    pub work_dir: PathBuf,
    pub compression: bool,
    /// Roots captured by file backups.
    pub file_roots: Vec<PathBuf>,
    /// Glob patterns relative to each root; empty means everything.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Path to `pg_dump` (default: found on `PATH`).
    pub pg_dump_path: String,
    pub psql_path: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            work_dir: env::temp_dir().join("backup-keeper"),
            compression: true,
            file_roots: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            pg_dump_path: "pg_dump".into(),
            psql_path: "psql".into(),
        }
    }
}

/// Three-tier retention windows.
///
/// `daily` is a number of calendar days including the day of the cleanup run,
/// so `daily = 7` keeps today and the six days before it. `weekly` counts
/// calendar weeks and `monthly` calendar months back from that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub weekly_anchor: Weekday,
    pub monthly_anchor_day: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
            weekly_anchor: Weekday::Mon,
            monthly_anchor_day: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub health_check_url: Option<String>,
    pub health_check_timeout: Duration,
    pub expected_status: u16,
    /// Consecutive health-check failures before a service outage is reported.
    pub outage_threshold: u32,
    pub missed_backup_hours: i64,
    pub failure_rate_percent: f64,
    pub max_backup_age_hours: i64,
    pub storage_percent: f64,
    pub reminder_interval: chrono::Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            health_check_url: None,
            health_check_timeout: Duration::from_secs(10),
            expected_status: 200,
            outage_threshold: 3,
            missed_backup_hours: 1,
            failure_rate_percent: 20.0,
            max_backup_age_hours: 48,
            storage_percent: 90.0,
            reminder_interval: chrono::Duration::hours(4),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub email_to: Vec<String>,
    /// HTTP mail relay accepting `{to, subject, body}` JSON.
    pub email_api_url: Option<String>,
    pub chat_webhook: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub rto_minutes: i64,
    pub rpo_minutes: i64,
    /// `(type, severity)` pairs that start their plan without approval.
    pub auto_execute: Vec<(DisasterType, DisasterSeverity)>,
    /// Isolated database used when testing procedures.
    pub test_database_url: Option<String>,
    /// Directory restores are unpacked into when testing procedures.
    pub test_restore_dir: PathBuf,
    /// Procedures not tested within this many days count as overdue.
    pub testing_interval_days: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            rto_minutes: 240,
            rpo_minutes: 1440,
            auto_execute: vec![
                (DisasterType::DatabaseFailure, DisasterSeverity::Critical),
                (DisasterType::DataCorruption, DisasterSeverity::Critical),
            ],
            test_database_url: None,
            test_restore_dir: env::temp_dir().join("backup-keeper-dr-test"),
            testing_interval_days: 90,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", key, v))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let quota_bytes = env::var("BACKUP_STORAGE_QUOTA_BYTES")
            .ok()
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    AppError::Config(format!("BACKUP_STORAGE_QUOTA_BYTES is invalid: {}", v))
                })
            })
            .transpose()?;

        let storage = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".into())
            .as_str()
        {
            "local" | "filesystem" => StorageConfig::Local {
                path: env::var("STORAGE_PATH")
                    .unwrap_or_else(|_| "/var/lib/backup-keeper/archives".into())
                    .into(),
                quota_bytes,
            },
            "s3" => StorageConfig::S3 {
                bucket: env::var("S3_BUCKET")
                    .map_err(|_| AppError::Config("S3_BUCKET not set".into()))?,
                region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
                endpoint: env::var("S3_ENDPOINT").ok(),
                prefix: env::var("S3_PREFIX").ok(),
                access_key: env::var("S3_ACCESS_KEY_ID").ok(),
                secret_key: env::var("S3_SECRET_ACCESS_KEY").ok(),
                quota_bytes,
            },
            other => {
                return Err(AppError::Config(format!(
                    "Unknown STORAGE_BACKEND '{}' (expected local or s3)",
                    other
                )))
            }
        };

        let backup_defaults = BackupConfig::default();
        let backup = BackupConfig {
            work_dir: env::var("BACKUP_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(backup_defaults.work_dir),
            compression: env_bool("BACKUP_COMPRESSION", true),
            file_roots: env_list("BACKUP_FILE_ROOTS")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            include: env_list("BACKUP_INCLUDE"),
            exclude: env_list("BACKUP_EXCLUDE"),
            pg_dump_path: env::var("PG_DUMP_PATH").unwrap_or(backup_defaults.pg_dump_path),
            psql_path: env::var("PSQL_PATH").unwrap_or(backup_defaults.psql_path),
        };

        let retention_defaults = RetentionPolicy::default();
        let retention = RetentionPolicy {
            daily: env_parse("RETENTION_DAILY", retention_defaults.daily)?,
            weekly: env_parse("RETENTION_WEEKLY", retention_defaults.weekly)?,
            monthly: env_parse("RETENTION_MONTHLY", retention_defaults.monthly)?,
            weekly_anchor: match env::var("RETENTION_WEEKLY_ANCHOR") {
                Ok(v) => v.parse::<Weekday>().map_err(|_| {
                    AppError::Config(format!("RETENTION_WEEKLY_ANCHOR is invalid: {}", v))
                })?,
                Err(_) => retention_defaults.weekly_anchor,
            },
            monthly_anchor_day: env_parse(
                "RETENTION_MONTHLY_ANCHOR_DAY",
                retention_defaults.monthly_anchor_day,
            )?,
        };
        if !(1..=28).contains(&retention.monthly_anchor_day) {
            return Err(AppError::Config(
                "RETENTION_MONTHLY_ANCHOR_DAY must be between 1 and 28".into(),
            ));
        }

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            poll_interval: Duration::from_secs(env_parse("MONITOR_POLL_INTERVAL_SECS", 300)?),
            health_check_url: env::var("HEALTH_CHECK_URL").ok(),
            health_check_timeout: Duration::from_secs(env_parse(
                "HEALTH_CHECK_TIMEOUT_SECS",
                10,
            )?),
            expected_status: env_parse("HEALTH_CHECK_EXPECTED_STATUS", 200)?,
            missed_backup_hours: env_parse(
                "ALERT_MISSED_BACKUP_HOURS",
                monitor_defaults.missed_backup_hours,
            )?,
            failure_rate_percent: env_parse(
                "ALERT_FAILURE_RATE_PERCENT",
                monitor_defaults.failure_rate_percent,
            )?,
            max_backup_age_hours: env_parse(
                "ALERT_MAX_BACKUP_AGE_HOURS",
                monitor_defaults.max_backup_age_hours,
            )?,
            storage_percent: env_parse("ALERT_STORAGE_PERCENT", monitor_defaults.storage_percent)?,
            ..monitor_defaults
        };

        let notifications = NotificationConfig {
            email_to: env_list("NOTIFY_EMAIL_TO"),
            email_api_url: env::var("NOTIFY_EMAIL_API_URL").ok(),
            chat_webhook: env::var("NOTIFY_CHAT_WEBHOOK").ok(),
            webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
        };

        let recovery_defaults = RecoveryConfig::default();
        let recovery = RecoveryConfig {
            rto_minutes: env_parse("RECOVERY_RTO_MINUTES", recovery_defaults.rto_minutes)?,
            rpo_minutes: env_parse("RECOVERY_RPO_MINUTES", recovery_defaults.rpo_minutes)?,
            test_database_url: env::var("RECOVERY_TEST_DATABASE_URL").ok(),
            test_restore_dir: env::var("RECOVERY_TEST_RESTORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(recovery_defaults.test_restore_dir.clone()),
            ..recovery_defaults
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            storage,
            backup,
            retention,
            monitor,
            notifications,
            recovery,
        })
    }
}
