//! Compliance and operations reporting over a time range.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RecoveryConfig;
use crate::error::{AppError, Result};
use crate::models::{
    AlertSeverity, Artifact, ArtifactStatus, DisasterEvent, DisasterStatus, Job, JobStatus,
    RecoveryProcedure,
};
use crate::store::MetadataStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs still pending, running or waiting on a retry.
    pub in_flight: usize,
    /// Terminal jobs that needed more than one attempt.
    pub retried: usize,
    pub success_rate_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArtifactStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Stored bytes of successful artifacts.
    pub stored_bytes: u64,
    pub by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub unresolved: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DisasterStats {
    pub total: usize,
    pub recovered: usize,
    pub investigating: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub jobs: JobStats,
    pub artifacts: ArtifactStats,
    pub alerts: AlertStats,
    pub disasters: DisasterStats,
    pub mttr_minutes: Option<f64>,
    pub mtbf_hours: Option<f64>,
    pub rto_compliance_percent: Option<f64>,
    pub rpo_compliance_percent: Option<f64>,
    pub storage_growth_bytes_per_day: f64,
    pub testing_compliance_percent: Option<f64>,
    pub recommendations: Vec<String>,
}

pub struct ReportService {
    store: Arc<dyn MetadataStore>,
    config: RecoveryConfig,
}

fn percent(part: usize, whole: usize) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64 * 100.0)
}

fn within(at: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    at >= from && at < to
}

impl ReportService {
    pub fn new(store: Arc<dyn MetadataStore>, config: RecoveryConfig) -> Self {
        Self { store, config }
    }

    pub async fn generate(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BackupReport> {
        if from >= to {
            return Err(AppError::Validation("Report range must end after it starts".into()));
        }

        let jobs = self.store.list_jobs_between(from, to).await?;
        let artifacts: Vec<Artifact> = self
            .store
            .list_artifacts()
            .await?
            .into_iter()
            .filter(|a| within(a.created_at, from, to))
            .collect();
        let alerts: Vec<_> = self
            .store
            .list_alerts(false)
            .await?
            .into_iter()
            .filter(|a| within(a.created_at, from, to))
            .collect();
        let events: Vec<DisasterEvent> = self
            .store
            .list_disaster_events()
            .await?
            .into_iter()
            .filter(|e| within(e.timestamp, from, to))
            .collect();
        let procedures = self.store.list_procedures().await?;

        let job_stats = job_stats(&jobs);

        let mut artifact_stats = ArtifactStats::default();
        for a in &artifacts {
            artifact_stats.total += 1;
            *artifact_stats.by_kind.entry(a.kind.to_string()).or_default() += 1;
            match a.status {
                ArtifactStatus::Success => {
                    artifact_stats.successful += 1;
                    artifact_stats.stored_bytes += a.compressed_size_bytes;
                }
                ArtifactStatus::Failed => artifact_stats.failed += 1,
                ArtifactStatus::InProgress => {}
            }
        }

        let mut alert_stats = AlertStats::default();
        for a in &alerts {
            alert_stats.total += 1;
            if !a.resolved {
                alert_stats.unresolved += 1;
            }
            *alert_stats.by_severity.entry(a.severity.to_string()).or_default() += 1;
            *alert_stats.by_type.entry(a.alert_type.to_string()).or_default() += 1;
        }
        let open_critical = alerts
            .iter()
            .filter(|a| !a.resolved && a.severity == AlertSeverity::Critical)
            .count();

        let recovered: Vec<&DisasterEvent> = events
            .iter()
            .filter(|e| e.status == DisasterStatus::Recovered)
            .collect();
        let disaster_stats = DisasterStats {
            total: events.len(),
            recovered: recovered.len(),
            investigating: events
                .iter()
                .filter(|e| e.status == DisasterStatus::Investigating)
                .count(),
        };

        let recovery_minutes: Vec<f64> = recovered
            .iter()
            .filter_map(|e| e.actual_recovery_at.map(|at| (at - e.timestamp).num_seconds() as f64 / 60.0))
            .collect();
        let mttr_minutes = (!recovery_minutes.is_empty())
            .then(|| recovery_minutes.iter().sum::<f64>() / recovery_minutes.len() as f64);
        let rto_compliance_percent = percent(
            recovery_minutes
                .iter()
                .filter(|m| **m <= self.config.rto_minutes as f64)
                .count(),
            recovery_minutes.len(),
        );

        let failures = job_stats.failed + events.len();
        let range_hours = (to - from).num_seconds() as f64 / 3600.0;
        let mtbf_hours = (failures > 0).then(|| range_hours / failures as f64);

        let rpo_compliance_percent = rpo_compliance(&artifacts, Duration::minutes(self.config.rpo_minutes));
        let storage_growth_bytes_per_day = artifact_stats.stored_bytes as f64 / (range_hours / 24.0);

        let overdue = overdue_procedures(&procedures, to, Duration::days(self.config.testing_interval_days));
        let testing_compliance_percent = percent(procedures.len() - overdue.len(), procedures.len());

        let mut recommendations = Vec::new();
        if artifact_stats.successful == 0 {
            recommendations.push("No successful backups were produced in this period".to_string());
        }
        if let Some(rate) = job_stats.success_rate_percent.filter(|r| *r < 95.0) {
            recommendations.push(format!(
                "Backup success rate is {:.1}%; investigate failing schedules",
                rate
            ));
        }
        if rpo_compliance_percent.is_some_and(|p| p < 100.0) {
            recommendations.push(format!(
                "Gaps between backups exceeded the {} minute RPO; schedule backups more often",
                self.config.rpo_minutes
            ));
        }
        if rto_compliance_percent.is_some_and(|p| p < 100.0) {
            recommendations.push(format!(
                "Recoveries exceeded the {} minute RTO; review recovery procedures",
                self.config.rto_minutes
            ));
        }
        if !overdue.is_empty() {
            recommendations.push(format!(
                "Recovery procedures not tested in {} days: {}",
                self.config.testing_interval_days,
                overdue.join(", ")
            ));
        }
        if open_critical > 0 {
            recommendations.push(format!("Resolve {} open critical alert(s)", open_critical));
        }
        if disaster_stats.investigating > 0 {
            recommendations.push(format!(
                "{} disaster event(s) still under investigation",
                disaster_stats.investigating
            ));
        }
        let post_mortems = events
            .iter()
            .filter(|e| e.post_mortem_required && e.status == DisasterStatus::Recovered)
            .count();
        if post_mortems > 0 {
            recommendations.push(format!("Write post-mortems for {} recovered event(s)", post_mortems));
        }

        Ok(BackupReport {
            from,
            to,
            jobs: job_stats,
            artifacts: artifact_stats,
            alerts: alert_stats,
            disasters: disaster_stats,
            mttr_minutes,
            mtbf_hours,
            rto_compliance_percent,
            rpo_compliance_percent,
            storage_growth_bytes_per_day,
            testing_compliance_percent,
            recommendations,
        })
    }
}

fn job_stats(jobs: &[Job]) -> JobStats {
    let mut stats = JobStats {
        total: jobs.len(),
        ..Default::default()
    };
    for job in jobs {
        match job.status {
            JobStatus::Success => stats.succeeded += 1,
            JobStatus::Failed => stats.failed += 1,
            _ => stats.in_flight += 1,
        }
        if job.status.is_terminal() && job.attempt > 1 {
            stats.retried += 1;
        }
    }
    stats.success_rate_percent = percent(stats.succeeded, stats.succeeded + stats.failed);
    stats
}

/// Share of gaps between consecutive successful artifacts of the same kind
/// that stay within the RPO.
fn rpo_compliance(artifacts: &[Artifact], rpo: Duration) -> Option<f64> {
    let mut by_kind: BTreeMap<String, Vec<DateTime<Utc>>> = BTreeMap::new();
    for a in artifacts.iter().filter(|a| a.status == ArtifactStatus::Success) {
        by_kind.entry(a.kind.to_string()).or_default().push(a.created_at);
    }

    let mut gaps = 0;
    let mut compliant = 0;
    for times in by_kind.values_mut() {
        times.sort();
        for pair in times.windows(2) {
            gaps += 1;
            if pair[1] - pair[0] <= rpo {
                compliant += 1;
            }
        }
    }
    percent(compliant, gaps)
}

fn overdue_procedures(procedures: &[RecoveryProcedure], at: DateTime<Utc>, interval: Duration) -> Vec<String> {
    procedures
        .iter()
        .filter(|p| !p.last_tested_at.is_some_and(|t| at - t <= interval))
        .map(|p| p.id.clone())
        .collect()
}
