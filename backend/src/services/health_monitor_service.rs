//! Backup monitor.
//!
//! Polls schedule, job and storage state, derives a health status per
//! component and raises typed alerts when thresholds are crossed. The monitor
//! only reads scheduler state; it never mutates schedules or jobs.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{AppError, Result};
use crate::models::{
    AlertSeverity, AlertType, DisasterSeverity, DisasterType, JobStatus, NewAlert, Schedule,
};
use crate::services::alert_service::AlertService;
use crate::services::metrics_service;
use crate::services::recovery_service::DisasterReport;
use crate::services::storage_service::{StorageService, StorageUsage};
use crate::store::MetadataStore;

/// Terminal jobs needed before a failure rate is meaningful.
const MIN_FAILURE_SAMPLE: usize = 10;
/// Most recent terminal jobs considered for the failure rate.
const FAILURE_WINDOW: usize = 20;
/// Storage utilisation above which a storage alert is critical.
const STORAGE_CRITICAL_PERCENT: f64 = 95.0;
/// Hours late after which a missed backup is critical.
const MISSED_CRITICAL_HOURS: i64 = 24;

const AUTO_RESOLVER: &str = "monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// `>= 95` healthy, `>= 80` degraded, otherwise unhealthy.
    pub fn from_success_rate(percent: f64) -> Self {
        if percent >= 95.0 {
            HealthStatus::Healthy
        } else if percent >= 80.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    /// Success rate or utilisation backing the status, when there is one.
    pub value: Option<f64>,
    pub detail: String,
}

impl ComponentHealth {
    fn new(name: impl Into<String>, status: HealthStatus, value: Option<f64>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            value,
            detail: detail.into(),
        }
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub checked_at: DateTime<Utc>,
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub storage: Option<StorageUsage>,
    pub alerts_raised: usize,
    pub alerts_resolved: usize,
    pub reminders_sent: usize,
}

/// Source of storage utilisation figures.
#[async_trait]
pub trait StorageUsageProbe: Send + Sync {
    async fn usage(&self) -> Result<StorageUsage>;
}

#[async_trait]
impl StorageUsageProbe for StorageService {
    async fn usage(&self) -> Result<StorageUsage> {
        StorageService::usage(self).await
    }
}

/// Receives disaster reports detected by the monitor.
#[async_trait]
pub trait DisasterReporter: Send + Sync {
    async fn report_disaster(&self, report: DisasterReport, now: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Default)]
struct EndpointState {
    consecutive_failures: u32,
    outage_reported: bool,
}

#[derive(Default)]
struct PollTally {
    raised: usize,
    resolved: usize,
}

pub struct BackupMonitor {
    store: Arc<dyn MetadataStore>,
    alerts: Arc<AlertService>,
    storage: Arc<dyn StorageUsageProbe>,
    reporter: Option<Arc<dyn DisasterReporter>>,
    config: MonitorConfig,
    http_client: Client,
    endpoint: StdMutex<EndpointState>,
    last: RwLock<Option<MonitorSnapshot>>,
}

impl BackupMonitor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        alerts: Arc<AlertService>,
        storage: Arc<dyn StorageUsageProbe>,
        config: MonitorConfig,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.health_check_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            store,
            alerts,
            storage,
            reporter: None,
            config,
            http_client,
            endpoint: StdMutex::new(EndpointState::default()),
            last: RwLock::new(None),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn DisasterReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Snapshot of the most recent poll.
    pub fn last_snapshot(&self) -> Option<MonitorSnapshot> {
        self.last.read().ok().and_then(|s| s.clone())
    }

    /// Run one monitoring cycle. Individual check failures become alerts or
    /// unhealthy components; they never abort the cycle.
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<MonitorSnapshot> {
        let mut tally = PollTally::default();
        let mut components = Vec::new();

        if let Some(url) = self.config.health_check_url.clone() {
            components.push(self.check_endpoint(&url, now, &mut tally).await);
        }

        match self.store.list_schedules().await {
            Ok(schedules) => {
                for schedule in schedules.iter().filter(|s| s.is_live()) {
                    match self.check_schedule(schedule, now, &mut tally).await {
                        Ok(component) => components.push(component),
                        Err(e) => {
                            warn!(schedule_id = %schedule.id, "Schedule check failed: {}", e);
                            components.push(ComponentHealth::new(
                                format!("schedule:{}", schedule.name),
                                HealthStatus::Unhealthy,
                                None,
                                e.to_string(),
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                error!("Monitor could not read schedules: {}", e);
                components.push(ComponentHealth::new(
                    "metadata_store",
                    HealthStatus::Unhealthy,
                    None,
                    e.to_string(),
                ));
            }
        }

        let (storage_component, storage) = self.check_storage(now, &mut tally).await;
        components.push(storage_component);

        let reminders_sent = match self.alerts.send_reminders(now).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Sending alert reminders failed: {}", e);
                0
            }
        };

        let overall = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        let snapshot = MonitorSnapshot {
            checked_at: now,
            overall,
            components,
            storage,
            alerts_raised: tally.raised,
            alerts_resolved: tally.resolved,
            reminders_sent,
        };

        debug!(overall = ?snapshot.overall, raised = tally.raised, resolved = tally.resolved, "Monitor poll complete");
        if let Ok(mut last) = self.last.write() {
            *last = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    async fn raise(&self, alert: NewAlert, now: DateTime<Utc>, tally: &mut PollTally) {
        match self.alerts.raise(alert, now).await {
            Ok(raised) if raised.created => tally.raised += 1,
            Ok(_) => {}
            Err(e) => error!("Failed to raise alert: {}", e),
        }
    }

    /// Probe the configured endpoint once.
    pub async fn probe_endpoint(&self, url: &str) -> Result<()> {
        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::HealthCheck(format!("{}: {}", url, e)))?;
        let status = resp.status().as_u16();
        if status != self.config.expected_status {
            return Err(AppError::HealthCheck(format!(
                "{} returned HTTP {}, expected {}",
                url, status, self.config.expected_status
            )));
        }
        Ok(())
    }

    async fn check_endpoint(&self, url: &str, now: DateTime<Utc>, tally: &mut PollTally) -> ComponentHealth {
        let result = self.probe_endpoint(url).await;

        let (failures, report_outage) = {
            let Ok(mut state) = self.endpoint.lock() else {
                return ComponentHealth::new("health_check", HealthStatus::Unhealthy, None, "monitor state poisoned");
            };
            if result.is_ok() {
                if state.consecutive_failures > 0 {
                    info!(url, failures = state.consecutive_failures, "Health check recovered");
                }
                *state = EndpointState::default();
                (0, false)
            } else {
                state.consecutive_failures += 1;
                let report = state.consecutive_failures >= self.config.outage_threshold
                    && !state.outage_reported;
                if report {
                    state.outage_reported = true;
                }
                (state.consecutive_failures, report)
            }
        };

        let Err(e) = result else {
            return ComponentHealth::new("health_check", HealthStatus::Healthy, None, "ok");
        };

        warn!(url, consecutive_failures = failures, "Health check failed: {}", e);
        let severity = if failures >= self.config.outage_threshold {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Error
        };
        self.raise(
            NewAlert {
                alert_type: AlertType::SystemError,
                severity,
                scope: format!("health:{}", url),
                title: "Health check failed".into(),
                message: e.to_string(),
                metadata: serde_json::json!({ "url": url, "consecutive_failures": failures }),
            },
            now,
            tally,
        )
        .await;

        if report_outage {
            if let Some(reporter) = &self.reporter {
                let report = DisasterReport {
                    disaster_type: DisasterType::ServiceOutage,
                    severity: DisasterSeverity::High,
                    description: format!(
                        "Health check {} failed {} consecutive times: {}",
                        url, failures, e
                    ),
                    affected_systems: vec!["application".into()],
                };
                if let Err(e) = reporter.report_disaster(report, now).await {
                    error!("Failed to report service outage: {}", e);
                }
            }
        }

        let status = if failures >= self.config.outage_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        ComponentHealth::new("health_check", status, None, e.to_string())
    }

    async fn check_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        tally: &mut PollTally,
    ) -> Result<ComponentHealth> {
        let scope = schedule.id.to_string();

        // Auto-resolve once the schedule has run after the alert was raised.
        if let Some(alert) = self.alerts.open_alert(AlertType::MissedBackup, &scope).await? {
            if schedule.last_run_at.is_some_and(|run| run > alert.created_at) {
                self.alerts.resolve(alert.id, AUTO_RESOLVER, now).await?;
                tally.resolved += 1;
            }
        }

        if let Some(next_run) = schedule.next_run_at {
            let late = now - next_run;
            if late > ChronoDuration::hours(self.config.missed_backup_hours) {
                let severity = if late > ChronoDuration::hours(MISSED_CRITICAL_HOURS) {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                self.raise(
                    NewAlert {
                        alert_type: AlertType::MissedBackup,
                        severity,
                        scope: scope.clone(),
                        title: format!("Backup '{}' missed", schedule.name),
                        message: format!(
                            "Scheduled run at {} is {} minutes overdue",
                            next_run,
                            late.num_minutes()
                        ),
                        metadata: serde_json::json!({
                            "schedule_id": schedule.id,
                            "next_run_at": next_run,
                            "minutes_late": late.num_minutes(),
                        }),
                    },
                    now,
                    tally,
                )
                .await;
            }
        }

        let jobs = self.store.list_jobs(Some(schedule.id), FAILURE_WINDOW * 3).await?;
        let terminal: Vec<_> = jobs
            .iter()
            .filter(|j| j.status.is_terminal())
            .take(FAILURE_WINDOW)
            .collect();
        let failed = terminal.iter().filter(|j| j.status == JobStatus::Failed).count();
        let success_rate = if terminal.is_empty() {
            None
        } else {
            Some((terminal.len() - failed) as f64 / terminal.len() as f64 * 100.0)
        };

        if let Some(rate) = success_rate {
            let failure_rate = 100.0 - rate;
            if terminal.len() >= MIN_FAILURE_SAMPLE && failure_rate > self.config.failure_rate_percent {
                self.raise(
                    NewAlert {
                        alert_type: AlertType::BackupFailure,
                        severity: AlertSeverity::Error,
                        scope: scope.clone(),
                        title: format!("Backup '{}' failing", schedule.name),
                        message: format!(
                            "{} of the last {} jobs failed ({:.1}%)",
                            failed,
                            terminal.len(),
                            failure_rate
                        ),
                        metadata: serde_json::json!({
                            "schedule_id": schedule.id,
                            "failure_rate_percent": failure_rate,
                            "sample": terminal.len(),
                        }),
                    },
                    now,
                    tally,
                )
                .await;
            }
        }

        let last_good = schedule.last_success_at.unwrap_or(schedule.created_at);
        let age = now - last_good;
        if age > ChronoDuration::hours(self.config.max_backup_age_hours) {
            self.raise(
                NewAlert {
                    alert_type: AlertType::OldBackup,
                    severity: AlertSeverity::Warning,
                    scope: scope.clone(),
                    title: format!("Backup '{}' is stale", schedule.name),
                    message: format!("Last successful backup is {} hours old", age.num_hours()),
                    metadata: serde_json::json!({
                        "schedule_id": schedule.id,
                        "last_success_at": schedule.last_success_at,
                        "age_hours": age.num_hours(),
                    }),
                },
                now,
                tally,
            )
            .await;
        }

        let (status, detail) = match success_rate {
            Some(rate) => (
                HealthStatus::from_success_rate(rate),
                format!("{} of {} recent jobs succeeded", terminal.len() - failed, terminal.len()),
            ),
            None => (HealthStatus::Healthy, "no completed jobs yet".to_string()),
        };
        Ok(ComponentHealth::new(
            format!("schedule:{}", schedule.name),
            status,
            success_rate,
            detail,
        ))
    }

    async fn check_storage(
        &self,
        now: DateTime<Utc>,
        tally: &mut PollTally,
    ) -> (ComponentHealth, Option<StorageUsage>) {
        let usage = match self.storage.usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Storage usage probe failed: {}", e);
                self.raise(
                    NewAlert {
                        alert_type: AlertType::SystemError,
                        severity: AlertSeverity::Error,
                        scope: "storage".into(),
                        title: "Backup storage unavailable".into(),
                        message: e.to_string(),
                        metadata: serde_json::Value::Null,
                    },
                    now,
                    tally,
                )
                .await;
                return (
                    ComponentHealth::new("storage", HealthStatus::Unhealthy, None, e.to_string()),
                    None,
                );
            }
        };

        metrics_service::set_storage_usage(usage.used_bytes, usage.percent_used);

        let Some(percent) = usage.percent_used else {
            return (
                ComponentHealth::new(
                    "storage",
                    HealthStatus::Healthy,
                    None,
                    format!("{} bytes used, no quota", usage.used_bytes),
                ),
                Some(usage),
            );
        };

        let status = if percent > STORAGE_CRITICAL_PERCENT {
            HealthStatus::Unhealthy
        } else if percent >= self.config.storage_percent {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if percent >= self.config.storage_percent {
            let severity = if percent > STORAGE_CRITICAL_PERCENT {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            self.raise(
                NewAlert {
                    alert_type: AlertType::StorageFull,
                    severity,
                    scope: "storage".into(),
                    title: "Backup storage nearly full".into(),
                    message: format!("Storage is {:.1}% full", percent),
                    metadata: serde_json::json!({
                        "percent_used": percent,
                        "used_bytes": usage.used_bytes,
                        "quota_bytes": usage.quota_bytes,
                    }),
                },
                now,
                tally,
            )
            .await;
        }

        (
            ComponentHealth::new("storage", status, Some(percent), format!("{:.1}% used", percent)),
            Some(usage),
        )
    }

    /// Poll on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(Utc::now()).await {
                        error!("Monitor poll failed: {}", e);
                    }
                }
            }
        }
        info!("Backup monitor stopped");
    }
}
