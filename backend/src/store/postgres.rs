//! PostgreSQL metadata store.
//!
//! Each record is stored as JSONB alongside the columns used for filtering
//! and ordering. Schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::MetadataStore;
use crate::error::{AppError, Result};
use crate::models::{
    Alert, AlertType, Artifact, ArtifactStatus, DisasterEvent, Job, RecoveryProcedure, Schedule,
    TestResult,
};

fn status_label(status: ArtifactStatus) -> &'static str {
    match status {
        ArtifactStatus::InProgress => "in_progress",
        ArtifactStatus::Success => "success",
        ArtifactStatus::Failed => "failed",
    }
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_schedules (id, created_at, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.created_at)
        .bind(Json(schedule))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query_scalar::<_, Json<Schedule>>(
            "SELECT record FROM backup_schedules WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_scalar::<_, Json<Schedule>>(
            "SELECT record FROM backup_schedules ORDER BY created_at ASC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_jobs (id, schedule_id, created_at, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(job.id)
        .bind(job.schedule_id)
        .bind(job.created_at)
        .bind(Json(job))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_scalar::<_, Json<Job>>("SELECT record FROM backup_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_jobs(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_scalar::<_, Json<Job>>(
            r#"
            SELECT record FROM backup_jobs
            WHERE ($1::UUID IS NULL OR schedule_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(schedule_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_scalar::<_, Json<Job>>(
            r#"
            SELECT record FROM backup_jobs
            WHERE record->>'status' IN ('pending', 'running', 'retrying')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn list_jobs_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_scalar::<_, Json<Job>>(
            r#"
            SELECT record FROM backup_jobs
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_artifacts (id, job_id, created_at, status, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, record = EXCLUDED.record
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.job_id)
        .bind(artifact.created_at)
        .bind(status_label(artifact.status))
        .bind(Json(artifact))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        let row = sqlx::query_scalar::<_, Json<Artifact>>(
            "SELECT record FROM backup_artifacts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_scalar::<_, Json<Artifact>>(
            "SELECT record FROM backup_artifacts ORDER BY created_at DESC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_artifacts WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_alerts (id, alert_type, scope, resolved, created_at, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET resolved = EXCLUDED.resolved, record = EXCLUDED.record
            "#,
        )
        .bind(alert.id)
        .bind(alert.alert_type.to_string())
        .bind(&alert.scope)
        .bind(alert.resolved)
        .bind(alert.created_at)
        .bind(Json(alert))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query_scalar::<_, Json<Alert>>("SELECT record FROM backup_alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>> {
        let rows = sqlx::query_scalar::<_, Json<Alert>>(
            r#"
            SELECT record FROM backup_alerts
            WHERE ($1 = false OR resolved = false)
            ORDER BY created_at DESC
            "#,
        )
        .bind(unresolved_only)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn find_open_alert(&self, alert_type: AlertType, scope: &str) -> Result<Option<Alert>> {
        let row = sqlx::query_scalar::<_, Json<Alert>>(
            r#"
            SELECT record FROM backup_alerts
            WHERE alert_type = $1 AND scope = $2 AND resolved = false
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(alert_type.to_string())
        .bind(scope)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn upsert_disaster_event(&self, event: &DisasterEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO disaster_events (id, detected_at, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(Json(event))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_disaster_event(&self, id: Uuid) -> Result<Option<DisasterEvent>> {
        let row = sqlx::query_scalar::<_, Json<DisasterEvent>>(
            "SELECT record FROM disaster_events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_disaster_events(&self) -> Result<Vec<DisasterEvent>> {
        let rows = sqlx::query_scalar::<_, Json<DisasterEvent>>(
            "SELECT record FROM disaster_events ORDER BY detected_at DESC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn upsert_procedure(&self, procedure: &RecoveryProcedure) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recovery_procedures (id, record)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(&procedure.id)
        .bind(Json(procedure))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_procedure(&self, id: &str) -> Result<Option<RecoveryProcedure>> {
        let row = sqlx::query_scalar::<_, Json<RecoveryProcedure>>(
            "SELECT record FROM recovery_procedures WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_procedures(&self) -> Result<Vec<RecoveryProcedure>> {
        let rows = sqlx::query_scalar::<_, Json<RecoveryProcedure>>(
            "SELECT record FROM recovery_procedures ORDER BY id ASC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn append_test_result(&self, procedure_id: &str, result: &TestResult) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let mut procedure = sqlx::query_scalar::<_, Json<RecoveryProcedure>>(
            "SELECT record FROM recovery_procedures WHERE id = $1 FOR UPDATE",
        )
        .bind(procedure_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Procedure {} not found", procedure_id)))?
        .0;

        procedure.last_tested_at = Some(result.tested_at);
        procedure.test_results.push(result.clone());

        sqlx::query("UPDATE recovery_procedures SET record = $2 WHERE id = $1")
            .bind(procedure_id)
            .bind(Json(&procedure))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupKind, Schedule};

    /// Requires a PostgreSQL database.
    /// Run with: DATABASE_URL=postgres://... cargo test pg_store -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_pg_store_schedule_roundtrip() {
        let url = match std::env::var("DATABASE_URL") {
            Ok(u) => u,
            Err(_) => return,
        };
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PgStore::new(pool);
        store.migrate().await.unwrap();

        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "pg roundtrip".into(),
            kind: BackupKind::Full,
            cron_expression: "0 3 * * *".into(),
            enabled: false,
            last_run_at: None,
            last_success_at: None,
            next_run_at: None,
            success_count: 4,
            failure_count: 1,
            average_duration_ms: 12.5,
            max_retries: 2,
            retry_delay_minutes: 10,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.upsert_schedule(&schedule).await.unwrap();
        let loaded = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, schedule.name);
        assert_eq!(loaded.success_count, 4);
    }
}
