//! In-memory metadata store.
//!
//! Intended for tests and single-node development; state is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::MetadataStore;
use crate::error::{AppError, Result};
use crate::models::{
    Alert, AlertType, Artifact, DisasterEvent, Job, RecoveryProcedure, Schedule, TestResult,
};

#[derive(Debug, Default)]
struct Tables {
    schedules: HashMap<Uuid, Schedule>,
    jobs: HashMap<Uuid, Job>,
    artifacts: HashMap<Uuid, Artifact>,
    alerts: HashMap<Uuid, Alert>,
    events: HashMap<Uuid, DisasterEvent>,
    procedures: HashMap<String, RecoveryProcedure>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| AppError::Internal("metadata store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| AppError::Internal("metadata store lock poisoned".into()))
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.write()?.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.read()?.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut out: Vec<_> = self.read()?.schedules.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        self.write()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Job>> {
        let mut out: Vec<_> = self
            .read()?
            .jobs
            .values()
            .filter(|j| schedule_id.map_or(true, |id| j.schedule_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        let mut out: Vec<_> = self
            .read()?
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn list_jobs_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut out: Vec<_> = self
            .read()?
            .jobs
            .values()
            .filter(|j| j.created_at >= from && j.created_at < to)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.write()?.artifacts.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        Ok(self.read()?.artifacts.get(&id).cloned())
    }

    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let mut out: Vec<_> = self.read()?.artifacts.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<bool> {
        Ok(self.write()?.artifacts.remove(&id).is_some())
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        self.write()?.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        Ok(self.read()?.alerts.get(&id).cloned())
    }

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>> {
        let mut out: Vec<_> = self
            .read()?
            .alerts
            .values()
            .filter(|a| !unresolved_only || !a.resolved)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn find_open_alert(&self, alert_type: AlertType, scope: &str) -> Result<Option<Alert>> {
        Ok(self
            .read()?
            .alerts
            .values()
            .find(|a| !a.resolved && a.alert_type == alert_type && a.scope == scope)
            .cloned())
    }

    async fn upsert_disaster_event(&self, event: &DisasterEvent) -> Result<()> {
        self.write()?.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_disaster_event(&self, id: Uuid) -> Result<Option<DisasterEvent>> {
        Ok(self.read()?.events.get(&id).cloned())
    }

    async fn list_disaster_events(&self) -> Result<Vec<DisasterEvent>> {
        let mut out: Vec<_> = self.read()?.events.values().cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    async fn upsert_procedure(&self, procedure: &RecoveryProcedure) -> Result<()> {
        self.write()?
            .procedures
            .insert(procedure.id.clone(), procedure.clone());
        Ok(())
    }

    async fn get_procedure(&self, id: &str) -> Result<Option<RecoveryProcedure>> {
        Ok(self.read()?.procedures.get(id).cloned())
    }

    async fn list_procedures(&self) -> Result<Vec<RecoveryProcedure>> {
        let mut out: Vec<_> = self.read()?.procedures.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn append_test_result(&self, procedure_id: &str, result: &TestResult) -> Result<()> {
        let mut tables = self.write()?;
        let procedure = tables
            .procedures
            .get_mut(procedure_id)
            .ok_or_else(|| AppError::NotFound(format!("Procedure {} not found", procedure_id)))?;
        procedure.last_tested_at = Some(result.tested_at);
        procedure.test_results.push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertSeverity, ArtifactStatus, BackupKind, SourceKind};
    use chrono::Duration;

    fn artifact(created_at: DateTime<Utc>) -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            kind: SourceKind::Files,
            created_at,
            sources: vec!["a.txt".into()],
            size_bytes: 10,
            compressed_size_bytes: 5,
            compressed: true,
            duration_ms: 1,
            status: ArtifactStatus::Success,
            storage_key: "backups/files/x.tar.gz".into(),
            location: "file:///tmp/x".into(),
            checksum: "abc".into(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_artifacts_listed_newest_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let old = artifact(now - Duration::days(2));
        let new = artifact(now);
        store.upsert_artifact(&old).await.unwrap();
        store.upsert_artifact(&new).await.unwrap();

        let listed = store.list_artifacts().await.unwrap();
        assert_eq!(listed[0].id, new.id);
        assert_eq!(listed[1].id, old.id);

        assert!(store.delete_artifact(old.id).await.unwrap());
        assert!(!store.delete_artifact(old.id).await.unwrap());
        assert_eq!(store.list_artifacts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_jobs_exclude_terminal() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let schedule_id = Uuid::new_v4();

        let mut done = Job::new(schedule_id, BackupKind::Files, 1, now - Duration::hours(2));
        done.start_attempt(now);
        done.succeed(vec![], 5, now);
        let mut retrying = Job::new(schedule_id, BackupKind::Files, 3, now - Duration::hours(1));
        retrying.start_attempt(now);
        retrying.schedule_retry("tar exited with 2".into(), vec![], now);
        let pending = Job::new(schedule_id, BackupKind::Files, 3, now);
        for job in [&done, &retrying, &pending] {
            store.upsert_job(job).await.unwrap();
        }

        let ids: Vec<_> = store
            .list_unfinished_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![retrying.id, pending.id]);
    }

    #[tokio::test]
    async fn test_find_open_alert_ignores_resolved() {
        let store = InMemoryStore::new();
        let mut alert = Alert {
            id: Uuid::new_v4(),
            alert_type: AlertType::StorageFull,
            severity: AlertSeverity::Critical,
            scope: "storage".into(),
            title: "t".into(),
            message: "m".into(),
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            last_notified_at: None,
            metadata: serde_json::Value::Null,
        };
        store.upsert_alert(&alert).await.unwrap();
        assert!(store
            .find_open_alert(AlertType::StorageFull, "storage")
            .await
            .unwrap()
            .is_some());

        alert.resolved = true;
        store.upsert_alert(&alert).await.unwrap();
        assert!(store
            .find_open_alert(AlertType::StorageFull, "storage")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_alerts(false).await.unwrap().len(), 1);
        assert!(store.list_alerts(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_test_result_requires_procedure() {
        let store = InMemoryStore::new();
        let result = TestResult {
            id: Uuid::new_v4(),
            procedure_id: "missing".into(),
            tested_at: Utc::now(),
            environment: "test".into(),
            success: true,
            duration_ms: 0,
            steps_passed: 0,
            steps_total: 0,
            issues: vec![],
            recommendations: vec![],
        };
        let err = store.append_test_result("missing", &result).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
