//! Alert model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BackupFailure,
    MissedBackup,
    StorageFull,
    OldBackup,
    SystemError,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertType::BackupFailure => "backup_failure",
            AlertType::MissedBackup => "missed_backup",
            AlertType::StorageFull => "storage_full",
            AlertType::OldBackup => "old_backup",
            AlertType::SystemError => "system_error",
        };
        f.write_str(s)
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// An alert raised by the monitor or the recovery controller.
///
/// Alerts are never deleted; they are resolved. `scope` identifies the
/// condition (a schedule id, `storage`, a health endpoint) so that at most
/// one unresolved alert exists per `(alert_type, scope)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub scope: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Input for raising an alert.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub scope: String,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}
