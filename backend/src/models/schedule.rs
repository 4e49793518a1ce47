//! Backup schedule model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// What a schedule (and the jobs it spawns) backs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Database,
    Files,
    /// Database and files, producing one artifact each.
    Full,
}

impl BackupKind {
    /// Source kinds a job of this kind has to produce.
    pub fn sources(self) -> &'static [SourceKind] {
        match self {
            BackupKind::Database => &[SourceKind::Database],
            BackupKind::Files => &[SourceKind::Files],
            BackupKind::Full => &[SourceKind::Database, SourceKind::Files],
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Database => write!(f, "database"),
            BackupKind::Files => write!(f, "files"),
            BackupKind::Full => write!(f, "full"),
        }
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(BackupKind::Database),
            "files" | "file" => Ok(BackupKind::Files),
            "full" => Ok(BackupKind::Full),
            other => Err(format!("unknown backup kind '{}'", other)),
        }
    }
}

/// A single producer input: one artifact is produced per source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Database,
    Files,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Database => write!(f, "database"),
            SourceKind::Files => write!(f, "files"),
        }
    }
}

/// Backup schedule entity.
///
/// Schedules define recurring backup jobs using cron expressions. They are
/// never removed while jobs reference them; deletion sets `deleted_at` and
/// disables the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub kind: BackupKind,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    /// Moving average over successful jobs only.
    pub average_duration_ms: f64,
    pub max_retries: u32,
    pub retry_delay_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Total attempts a job of this schedule may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Fold a successful job into the counters.
    ///
    /// `avg' = (avg * (n - 1) + duration) / n` where `n` is the new success count.
    pub fn record_success(&mut self, duration_ms: u64, finished_at: DateTime<Utc>) {
        self.success_count += 1;
        let n = self.success_count as f64;
        self.average_duration_ms = (self.average_duration_ms * (n - 1.0) + duration_ms as f64) / n;
        self.last_run_at = Some(finished_at);
        self.last_success_at = Some(finished_at);
        self.updated_at = finished_at;
    }

    /// Fold a terminally failed job into the counters.
    pub fn record_failure(&mut self, finished_at: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_run_at = Some(finished_at);
        self.updated_at = finished_at;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Enabled and not deleted.
    pub fn is_live(&self) -> bool {
        self.enabled && !self.is_deleted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> Schedule {
        let now = Utc::now();
        Schedule {
            id: Uuid::new_v4(),
            name: "Daily DB".into(),
            kind: BackupKind::Database,
            cron_expression: "0 2 * * *".into(),
            enabled: true,
            last_run_at: None,
            last_success_at: None,
            next_run_at: None,
            success_count: 0,
            failure_count: 0,
            average_duration_ms: 0.0,
            max_retries: 2,
            retry_delay_minutes: 5,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_moving_average_duration() {
        let mut s = schedule();
        let now = Utc::now();
        s.record_success(100, now);
        assert_eq!(s.average_duration_ms, 100.0);
        s.record_success(200, now);
        assert_eq!(s.average_duration_ms, 150.0);
        s.record_success(600, now);
        assert_eq!(s.average_duration_ms, 300.0);
        assert_eq!(s.success_count, 3);
    }

    #[test]
    fn test_failure_does_not_touch_average() {
        let mut s = schedule();
        let now = Utc::now();
        s.record_success(100, now);
        s.record_failure(now);
        assert_eq!(s.average_duration_ms, 100.0);
        assert_eq!(s.failure_count, 1);
        assert_eq!(s.last_success_at, Some(now));
    }

    #[test]
    fn test_full_kind_expands_to_both_sources() {
        assert_eq!(
            BackupKind::Full.sources(),
            &[SourceKind::Database, SourceKind::Files]
        );
        assert_eq!(BackupKind::Files.sources(), &[SourceKind::Files]);
    }

    #[test]
    fn test_backup_kind_parse() {
        assert_eq!("database".parse::<BackupKind>().unwrap(), BackupKind::Database);
        assert_eq!("FULL".parse::<BackupKind>().unwrap(), BackupKind::Full);
        assert!("incremental".parse::<BackupKind>().is_err());
    }
}
