//! Metadata persistence for schedules, jobs, artifacts, alerts and DR records.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Alert, AlertType, Artifact, DisasterEvent, Job, RecoveryProcedure, Schedule, TestResult,
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Metadata store trait.
///
/// Implementations must make each `upsert_*` atomic per record id; callers
/// serialize read-modify-write cycles themselves.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>>;
    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    async fn upsert_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    /// Newest first by creation time.
    async fn list_jobs(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Job>>;
    /// Jobs not yet `success` or `failed`, oldest first.
    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>>;
    /// Jobs created within `[from, to)`.
    async fn list_jobs_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<()>;
    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>>;
    /// Newest first by creation time.
    async fn list_artifacts(&self) -> Result<Vec<Artifact>>;
    /// Returns true if a record was removed.
    async fn delete_artifact(&self, id: Uuid) -> Result<bool>;

    async fn upsert_alert(&self, alert: &Alert) -> Result<()>;
    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>>;
    /// Newest first by creation time.
    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>>;
    async fn find_open_alert(&self, alert_type: AlertType, scope: &str) -> Result<Option<Alert>>;

    async fn upsert_disaster_event(&self, event: &DisasterEvent) -> Result<()>;
    async fn get_disaster_event(&self, id: Uuid) -> Result<Option<DisasterEvent>>;
    /// Newest first by detection time.
    async fn list_disaster_events(&self) -> Result<Vec<DisasterEvent>>;

    async fn upsert_procedure(&self, procedure: &RecoveryProcedure) -> Result<()>;
    async fn get_procedure(&self, id: &str) -> Result<Option<RecoveryProcedure>>;
    async fn list_procedures(&self) -> Result<Vec<RecoveryProcedure>>;
    /// Append to the procedure's test history and bump `last_tested_at`.
    async fn append_test_result(&self, procedure_id: &str, result: &TestResult) -> Result<()>;
}
