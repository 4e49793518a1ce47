//! Disaster recovery controller.
//!
//! Turns disaster reports into events, picks a recovery plan and runs its
//! steps in order. A failed step parks the event in `investigating` and is
//! never retried without an operator. Manual steps pause the run until
//! confirmed. Test runs execute the same steps in [`ExecutionMode::Test`]
//! and record a [`TestResult`] instead of touching events.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::{AppError, Result};
use crate::models::{
    AlertSeverity, AlertType, DisasterEvent, DisasterSeverity, DisasterStatus, DisasterType,
    NewAlert, RecoveryProcedure, RecoveryStep, StepOutcome, StepType, TestResult,
};
use crate::services::alert_service::AlertService;
use crate::services::command_registry::{CommandRegistry, ExecutionMode};
use crate::services::health_monitor_service::DisasterReporter;
use crate::services::metrics_service;
use crate::services::notification_service::{Notification, NotificationService};
use crate::services::recovery_plans;
use crate::store::MetadataStore;

/// A detected disaster, from the monitor or an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterReport {
    pub disaster_type: DisasterType,
    pub severity: DisasterSeverity,
    pub description: String,
    #[serde(default)]
    pub affected_systems: Vec<String>,
}

/// Removes an event from the executing set on drop.
struct ExecutionGuard<'a> {
    executing: &'a StdMutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.executing.lock() {
            set.remove(&self.id);
        }
    }
}

pub struct RecoveryController {
    store: Arc<dyn MetadataStore>,
    registry: Arc<CommandRegistry>,
    alerts: Arc<AlertService>,
    notifications: Arc<NotificationService>,
    config: RecoveryConfig,
    /// Held while checking for overlapping events and moving one to `responding`.
    admission: Mutex<()>,
    executing: StdMutex<HashSet<Uuid>>,
}

impl RecoveryController {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        registry: Arc<CommandRegistry>,
        alerts: Arc<AlertService>,
        notifications: Arc<NotificationService>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            alerts,
            notifications,
            config,
            admission: Mutex::new(()),
            executing: StdMutex::new(HashSet::new()),
        }
    }

    /// Store the built-in procedures that are not already present. Existing
    /// procedures keep their test history.
    pub async fn seed_procedures(&self) -> Result<usize> {
        let mut seeded = 0;
        for procedure in recovery_plans::builtin_procedures() {
            if self.store.get_procedure(&procedure.id).await?.is_none() {
                self.store.upsert_procedure(&procedure).await?;
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!(seeded, "Recovery procedures seeded");
        }
        Ok(seeded)
    }

    fn auto_executes(&self, disaster_type: DisasterType, severity: DisasterSeverity) -> bool {
        self.config
            .auto_execute
            .iter()
            .any(|(t, s)| *t == disaster_type && *s == severity)
    }

    /// Record a disaster and either start its recovery plan or ask for an
    /// operator, depending on the auto-execute allowlist.
    pub async fn handle_disaster_event(
        &self,
        report: DisasterReport,
        now: DateTime<Utc>,
    ) -> Result<DisasterEvent> {
        if report.description.trim().is_empty() {
            return Err(AppError::Validation("Disaster description is required".into()));
        }

        let plan_id = recovery_plans::select_plan(report.disaster_type, report.severity);
        let procedure = self.procedure(plan_id).await?;

        let event = DisasterEvent {
            id: Uuid::new_v4(),
            disaster_type: report.disaster_type,
            severity: report.severity,
            timestamp: now,
            description: report.description,
            affected_systems: report.affected_systems,
            recovery_plan: plan_id.to_string(),
            status: DisasterStatus::Detected,
            estimated_recovery_at: now
                + Duration::minutes(procedure.estimated_duration_minutes() as i64),
            actual_recovery_at: None,
            post_mortem_required: report.severity >= DisasterSeverity::High,
            next_step: 0,
            awaiting_confirmation: None,
            step_log: Vec::new(),
        };
        self.store.upsert_disaster_event(&event).await?;

        warn!(
            event_id = %event.id,
            disaster_type = %event.disaster_type,
            severity = %event.severity,
            plan = %event.recovery_plan,
            "Disaster event detected: {}",
            event.description
        );

        if self.auto_executes(event.disaster_type, event.severity) {
            match self.start_recovery_procedure(event.id).await {
                Ok(event) => return Ok(event),
                Err(AppError::Conflict(reason)) => {
                    warn!(event_id = %event.id, "Automatic recovery not started: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }

        self.notifications
            .notify(&Notification {
                title: format!("Manual intervention required: {}", event.disaster_type),
                message: format!(
                    "{} ({} severity). Recovery plan '{}' is waiting for approval.",
                    event.description, event.severity, event.recovery_plan
                ),
                severity: event_alert_severity(event.severity),
                alert_type: None,
                reminder: false,
                metadata: serde_json::json!({
                    "event_id": event.id,
                    "affected_systems": event.affected_systems,
                }),
            })
            .await;
        Ok(event)
    }

    /// Move a detected event to `responding` and run its plan.
    pub async fn start_recovery_procedure(&self, event_id: Uuid) -> Result<DisasterEvent> {
        let event = self.admit(event_id, DisasterStatus::Detected).await?;
        info!(event_id = %event_id, plan = %event.recovery_plan, "Recovery procedure started");
        self.execute(event).await
    }

    /// Resume an `investigating` event at the step that failed.
    pub async fn retry_recovery(&self, event_id: Uuid) -> Result<DisasterEvent> {
        let event = self.admit(event_id, DisasterStatus::Investigating).await?;
        info!(event_id = %event_id, step = event.next_step, "Recovery procedure resumed");
        self.execute(event).await
    }

    /// Confirm the manual step an event is waiting on and continue.
    pub async fn confirm_manual_step(
        &self,
        event_id: Uuid,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<DisasterEvent> {
        let event = {
            let _guard = self.admission.lock().await;
            let mut event = self.get_event(event_id).await?;
            let Some(step) = event.awaiting_confirmation.take() else {
                return Err(AppError::Conflict(format!(
                    "Event {} is not waiting for confirmation",
                    event_id
                )));
            };
            if event.status != DisasterStatus::Responding {
                return Err(AppError::Conflict(format!(
                    "Event {} is {:?}",
                    event_id, event.status
                )));
            }

            event.step_log.push(StepOutcome {
                step,
                success: true,
                message: format!("Confirmed by {}", operator),
                at: now,
            });
            event.next_step += 1;
            self.store.upsert_disaster_event(&event).await?;
            event
        };
        self.execute(event).await
    }

    /// Check the expected status and that no other active event shares an
    /// affected system, then move the event to `responding`. An event parked
    /// in `investigating` still owns its systems until it recovers.
    async fn admit(&self, event_id: Uuid, expected: DisasterStatus) -> Result<DisasterEvent> {
        let _guard = self.admission.lock().await;
        let mut event = self.get_event(event_id).await?;
        if event.status != expected {
            return Err(AppError::Conflict(format!(
                "Event {} is {:?}, expected {:?}",
                event_id, event.status, expected
            )));
        }

        let systems: HashSet<&str> = event.affected_systems.iter().map(String::as_str).collect();
        let overlapping = self
            .store
            .list_disaster_events()
            .await?
            .into_iter()
            .filter(|e| {
                e.id != event_id
                    && matches!(
                        e.status,
                        DisasterStatus::Responding | DisasterStatus::Investigating
                    )
            })
            .find(|e| e.affected_systems.iter().any(|s| systems.contains(s.as_str())));
        if let Some(other) = overlapping {
            return Err(AppError::Conflict(format!(
                "Event {} overlaps {:?} event {} on {:?}",
                event_id, other.status, other.id, other.affected_systems
            )));
        }

        event.transition(DisasterStatus::Responding);
        self.store.upsert_disaster_event(&event).await?;
        Ok(event)
    }

    fn begin_execution(&self, id: Uuid) -> Result<ExecutionGuard<'_>> {
        let mut set = self
            .executing
            .lock()
            .map_err(|_| AppError::Internal("recovery state poisoned".into()))?;
        if !set.insert(id) {
            return Err(AppError::Conflict(format!("Recovery for event {} is already running", id)));
        }
        Ok(ExecutionGuard {
            executing: &self.executing,
            id,
        })
    }

    /// Run steps from `event.next_step` until the plan finishes, a manual
    /// step needs confirmation, or a step fails.
    async fn execute(&self, mut event: DisasterEvent) -> Result<DisasterEvent> {
        let _running = self.begin_execution(event.id)?;
        let procedure = self.procedure(&event.recovery_plan).await?;

        while let Some(step) = procedure.steps.get(event.next_step) {
            if step.step_type == StepType::Manual {
                event.awaiting_confirmation = Some(step.name.clone());
                self.store.upsert_disaster_event(&event).await?;
                info!(event_id = %event.id, step = %step.name, "Recovery paused for manual step");
                self.notifications
                    .notify(&Notification {
                        title: format!("Recovery step needs an operator: {}", step.name),
                        message: format!(
                            "Event {} ({}) is waiting for confirmation of '{}'",
                            event.id, event.disaster_type, step.name
                        ),
                        severity: event_alert_severity(event.severity),
                        alert_type: None,
                        reminder: false,
                        metadata: serde_json::json!({ "event_id": event.id, "step": step.name }),
                    })
                    .await;
                return Ok(event);
            }

            match self.run_step(step, &ExecutionMode::Production).await {
                Ok(message) => {
                    event.step_log.push(StepOutcome {
                        step: step.name.clone(),
                        success: true,
                        message,
                        at: Utc::now(),
                    });
                    event.next_step += 1;
                    self.store.upsert_disaster_event(&event).await?;
                }
                Err(e) => {
                    return self.park(event, step, e).await;
                }
            }
        }

        let at = Utc::now();
        event.transition(DisasterStatus::Recovered);
        event.actual_recovery_at = Some(at);
        self.store.upsert_disaster_event(&event).await?;
        metrics_service::record_recovery_run(&event.recovery_plan, false, true);

        info!(
            event_id = %event.id,
            minutes = (at - event.timestamp).num_minutes(),
            post_mortem = event.post_mortem_required,
            "Recovery completed"
        );
        self.notifications
            .notify(&Notification {
                title: format!("Recovered from {}", event.disaster_type),
                message: format!(
                    "Plan '{}' completed{}",
                    event.recovery_plan,
                    if event.post_mortem_required {
                        "; a post-mortem is required"
                    } else {
                        ""
                    }
                ),
                severity: AlertSeverity::Info,
                alert_type: None,
                reminder: false,
                metadata: serde_json::json!({ "event_id": event.id }),
            })
            .await;
        Ok(event)
    }

    /// Record a failed step, move the event to `investigating` and alert.
    async fn park(&self, mut event: DisasterEvent, step: &RecoveryStep, err: AppError) -> Result<DisasterEvent> {
        let at = Utc::now();
        error!(event_id = %event.id, step = %step.name, "Recovery step failed: {}", err);
        event.step_log.push(StepOutcome {
            step: step.name.clone(),
            success: false,
            message: err.to_string(),
            at,
        });
        event.transition(DisasterStatus::Investigating);
        self.store.upsert_disaster_event(&event).await?;
        metrics_service::record_recovery_run(&event.recovery_plan, false, false);

        let rollback = if step.rollback.is_empty() {
            String::new()
        } else {
            format!(" Rollback: {}.", step.rollback.join("; "))
        };
        self.alerts
            .raise(
                NewAlert {
                    alert_type: AlertType::SystemError,
                    severity: AlertSeverity::Critical,
                    scope: format!("disaster:{}", event.id),
                    title: format!("Recovery step '{}' failed", step.name),
                    message: format!("{}.{}", err, rollback),
                    metadata: serde_json::json!({
                        "event_id": event.id,
                        "plan": event.recovery_plan,
                        "step": step.name,
                    }),
                },
                at,
            )
            .await?;
        Ok(event)
    }

    async fn run_step(&self, step: &RecoveryStep, mode: &ExecutionMode) -> Result<String> {
        let command = step.command.as_deref().ok_or_else(|| AppError::RecoveryStep {
            step: step.name.clone(),
            message: "step has no command".into(),
        })?;
        let output = self.registry.run(&step.name, command, mode).await?;
        Ok(output.message)
    }

    /// Dry-run a procedure against the isolated test environment.
    ///
    /// Manual steps are counted as walked through. A failing critical step
    /// stops the run; the remaining steps count as not passed.
    pub async fn test_recovery_procedure(
        &self,
        procedure_id: &str,
        environment: &str,
        now: DateTime<Utc>,
    ) -> Result<TestResult> {
        let procedure = self.procedure(procedure_id).await?;
        let mode = ExecutionMode::Test {
            environment: environment.to_string(),
        };
        let started = Instant::now();

        let mut passed = 0;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        for step in &procedure.steps {
            if step.step_type == StepType::Manual {
                passed += 1;
                continue;
            }
            match step.command.as_deref() {
                Some(command) => match self.registry.run(&step.name, command, &mode).await {
                    Ok(output) => {
                        passed += 1;
                        issues.extend(output.issues);
                        recommendations.extend(output.recommendations);
                    }
                    Err(e) => {
                        issues.push(e.to_string());
                        if step.critical {
                            recommendations.push(format!(
                                "Fix '{}' before relying on {}",
                                step.name, procedure.name
                            ));
                            break;
                        }
                    }
                },
                None => issues.push(format!("Step '{}' has no command", step.name)),
            }
        }

        let estimated = procedure.estimated_duration_minutes() as i64;
        if estimated > self.config.rto_minutes {
            recommendations.push(format!(
                "Estimated duration of {} minutes exceeds the {} minute RTO",
                estimated, self.config.rto_minutes
            ));
        }
        let manual_steps = procedure
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Manual)
            .count();
        if manual_steps > 0 {
            recommendations.push(format!(
                "{} manual step(s) were not exercised; rehearse them with the on-call team",
                manual_steps
            ));
        }
        recommendations.dedup();

        let result = TestResult {
            id: Uuid::new_v4(),
            procedure_id: procedure.id.clone(),
            tested_at: now,
            environment: environment.to_string(),
            success: passed == procedure.steps.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            steps_passed: passed,
            steps_total: procedure.steps.len(),
            issues,
            recommendations,
        };
        self.store.append_test_result(&procedure.id, &result).await?;
        metrics_service::record_recovery_run(&procedure.id, true, result.success);

        info!(
            procedure = %procedure.id,
            environment,
            success = result.success,
            passed = result.steps_passed,
            total = result.steps_total,
            "Recovery procedure tested"
        );
        Ok(result)
    }

    async fn procedure(&self, id: &str) -> Result<RecoveryProcedure> {
        self.store
            .get_procedure(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Recovery procedure {} not found", id)))
    }

    pub async fn get_procedure(&self, id: &str) -> Result<RecoveryProcedure> {
        self.procedure(id).await
    }

    pub async fn list_procedures(&self) -> Result<Vec<RecoveryProcedure>> {
        self.store.list_procedures().await
    }

    pub async fn get_event(&self, id: Uuid) -> Result<DisasterEvent> {
        self.store
            .get_disaster_event(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Disaster event {} not found", id)))
    }

    pub async fn list_events(&self) -> Result<Vec<DisasterEvent>> {
        self.store.list_disaster_events().await
    }
}

#[async_trait]
impl DisasterReporter for RecoveryController {
    async fn report_disaster(&self, report: DisasterReport, now: DateTime<Utc>) -> Result<()> {
        self.handle_disaster_event(report, now).await.map(|_| ())
    }
}

fn event_alert_severity(severity: DisasterSeverity) -> AlertSeverity {
    match severity {
        DisasterSeverity::Low => AlertSeverity::Info,
        DisasterSeverity::Medium => AlertSeverity::Warning,
        DisasterSeverity::High => AlertSeverity::Error,
        DisasterSeverity::Critical => AlertSeverity::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::command_registry::{CommandHandler, CommandOutput};
    use crate::services::notification_service::LogNotifier;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts runs; fails while `failures` is above zero.
    #[derive(Default)]
    struct Scripted {
        runs: AtomicUsize,
        test_runs: AtomicUsize,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Scripted {
        fn description(&self) -> &str {
            "scripted"
        }

        async fn run(&self, mode: &ExecutionMode) -> Result<CommandOutput> {
            if mode.is_test() {
                self.test_runs.fetch_add(1, Ordering::SeqCst);
            } else {
                self.runs.fetch_add(1, Ordering::SeqCst);
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::BackupFailed("psql exited with 3".into()));
            }
            Ok(CommandOutput::default())
        }
    }

    struct Fixture {
        controller: RecoveryController,
        store: Arc<InMemoryStore>,
        alerts: Arc<AlertService>,
        handler: Arc<Scripted>,
    }

    async fn fixture(failures: usize) -> Fixture {
        use crate::services::command_registry::*;

        let store = Arc::new(InMemoryStore::new());
        let notifications = Arc::new(NotificationService::new(vec![Arc::new(LogNotifier)]));
        let alerts = Arc::new(AlertService::new(
            store.clone(),
            notifications.clone(),
            Duration::hours(4),
        ));
        let handler = Arc::new(Scripted::default());
        handler.failures.store(failures, Ordering::SeqCst);

        let mut registry = CommandRegistry::new();
        for id in [
            RESTORE_LATEST_DATABASE,
            RESTORE_LATEST_FILES,
            VERIFY_LATEST_BACKUPS,
            RUN_FULL_BACKUP,
            CHECK_SERVICE_HEALTH,
            CHECK_STORAGE,
        ] {
            registry.register(id, handler.clone());
        }

        let controller = RecoveryController::new(
            store.clone(),
            Arc::new(registry),
            alerts.clone(),
            notifications,
            RecoveryConfig::default(),
        );
        controller.seed_procedures().await.unwrap();
        Fixture {
            controller,
            store,
            alerts,
            handler,
        }
    }

    fn report(t: DisasterType, s: DisasterSeverity, systems: &[&str]) -> DisasterReport {
        DisasterReport {
            disaster_type: t,
            severity: s,
            description: "primary database unreachable".into(),
            affected_systems: systems.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_critical_database_failure_auto_recovers() {
        let f = fixture(0).await;
        let now = Utc::now();
        let event = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Critical, &["db"]),
                now,
            )
            .await
            .unwrap();

        assert_eq!(event.status, DisasterStatus::Recovered);
        assert_eq!(event.recovery_plan, recovery_plans::DATABASE_RECOVERY);
        assert_eq!(event.step_log.len(), 3);
        assert!(event.actual_recovery_at.is_some());
        assert!(event.post_mortem_required);
        assert_eq!(event.estimated_recovery_at, now + Duration::minutes(40));
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_allowlisted_event_waits_for_operator() {
        let f = fixture(0).await;
        let event = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Medium, &["db"]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(event.status, DisasterStatus::Detected);
        assert!(!event.post_mortem_required);
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 0);

        let started = f
            .controller
            .start_recovery_procedure(event.id)
            .await
            .unwrap();
        assert_eq!(started.status, DisasterStatus::Recovered);
    }

    #[tokio::test]
    async fn test_failed_step_parks_event_and_retry_resumes() {
        let f = fixture(2).await;
        let event = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Critical, &["db"]),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(event.status, DisasterStatus::Investigating);
        assert_eq!(event.next_step, 0);
        // No automatic retry.
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 1);
        let alert = f
            .alerts
            .open_alert(AlertType::SystemError, &format!("disaster:{}", event.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);

        let retried = f.controller.retry_recovery(event.id).await.unwrap();
        assert_eq!(retried.status, DisasterStatus::Investigating);

        let recovered = f.controller.retry_recovery(event.id).await.unwrap();
        assert_eq!(recovered.status, DisasterStatus::Recovered);
        assert_eq!(recovered.step_log.iter().filter(|s| !s.success).count(), 2);
    }

    #[tokio::test]
    async fn test_manual_step_pauses_until_confirmed() {
        let f = fixture(0).await;
        let event = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DataCorruption, DisasterSeverity::Critical, &["db", "uploads"]),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(event.status, DisasterStatus::Responding);
        assert!(event.awaiting_confirmation.is_some());
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 0);

        let done = f
            .controller
            .confirm_manual_step(event.id, "alice", Utc::now())
            .await
            .unwrap();
        assert_eq!(done.status, DisasterStatus::Recovered);
        assert_eq!(done.step_log[0].message, "Confirmed by alice");
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 4);

        let err = f
            .controller
            .confirm_manual_step(event.id, "alice", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_overlapping_events_are_serialized() {
        let f = fixture(0).await;
        // Paused on its manual step, so it stays responding.
        let first = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DataCorruption, DisasterSeverity::Critical, &["db"]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(first.status, DisasterStatus::Responding);

        let second = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Critical, &["db"]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(second.status, DisasterStatus::Detected);

        let disjoint = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Critical, &["analytics-db"]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(disjoint.status, DisasterStatus::Recovered);
    }

    #[tokio::test]
    async fn test_investigating_event_blocks_overlapping_event() {
        let f = fixture(1).await;
        let first = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Critical, &["db"]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(first.status, DisasterStatus::Investigating);

        let second = f
            .controller
            .handle_disaster_event(
                report(DisasterType::DatabaseFailure, DisasterSeverity::Critical, &["db"]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(second.status, DisasterStatus::Detected);
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 1);

        let err = f
            .controller
            .start_recovery_procedure(second.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Resuming the parked event is not blocked by itself.
        let resumed = f.controller.retry_recovery(first.id).await.unwrap();
        assert_eq!(resumed.status, DisasterStatus::Recovered);

        let started = f
            .controller
            .start_recovery_procedure(second.id)
            .await
            .unwrap();
        assert_eq!(started.status, DisasterStatus::Recovered);
    }

    #[tokio::test]
    async fn test_dry_run_records_result_without_events() {
        let f = fixture(0).await;
        let result = f
            .controller
            .test_recovery_procedure(recovery_plans::DATA_CORRUPTION_RECOVERY, "staging", Utc::now())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.steps_passed, 5);
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 0);
        assert_eq!(f.handler.test_runs.load(Ordering::SeqCst), 4);
        assert!(f.controller.list_events().await.unwrap().is_empty());

        let stored = f
            .store
            .get_procedure(recovery_plans::DATA_CORRUPTION_RECOVERY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.test_results.len(), 1);
        assert!(stored.last_tested_at.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_stops_at_critical_failure() {
        let f = fixture(1).await;
        let result = f
            .controller
            .test_recovery_procedure(recovery_plans::DATABASE_RECOVERY, "staging", Utc::now())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.steps_passed, 0);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(f.handler.test_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_seed_keeps_existing_history() {
        let f = fixture(0).await;
        f.controller
            .test_recovery_procedure(recovery_plans::SERVICE_RESTART, "staging", Utc::now())
            .await
            .unwrap();
        assert_eq!(f.controller.seed_procedures().await.unwrap(), 0);
        let p = f
            .controller
            .get_procedure(recovery_plans::SERVICE_RESTART)
            .await
            .unwrap();
        assert_eq!(p.test_results.len(), 1);
    }
}
