//! API module - HTTP handlers for the operator surface.

pub mod handlers;
pub mod routes;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::alert_service::AlertService;
use crate::services::backup_service::BackupService;
use crate::services::health_monitor_service::BackupMonitor;
use crate::services::recovery_service::RecoveryController;
use crate::services::report_service::ReportService;
use crate::services::scheduler_service::BackupScheduler;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<BackupScheduler>,
    pub backups: Arc<BackupService>,
    pub alerts: Arc<AlertService>,
    pub monitor: Arc<BackupMonitor>,
    pub recovery: Arc<RecoveryController>,
    pub reports: Arc<ReportService>,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<BackupScheduler>,
        backups: Arc<BackupService>,
        alerts: Arc<AlertService>,
        monitor: Arc<BackupMonitor>,
        recovery: Arc<RecoveryController>,
        reports: Arc<ReportService>,
    ) -> Self {
        Self {
            scheduler,
            backups,
            alerts,
            monitor,
            recovery,
            reports,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle for rendering /metrics output.
    pub fn set_metrics_handle(&mut self, handle: PrometheusHandle) {
        self.metrics_handle = Some(Arc::new(handle));
    }
}

pub type SharedState = Arc<AppState>;
