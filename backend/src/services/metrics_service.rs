//! Prometheus metrics collection and HTTP request instrumentation.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};

use crate::error::{AppError, Result};
use crate::models::AlertSeverity;

/// Initialize the Prometheus metrics recorder and return the handle for rendering.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(format!("Failed to install Prometheus recorder: {}", e)))
}

/// Axum middleware that records HTTP request metrics.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let normalized = normalize_path(request.uri().path());

    let start = Instant::now();
    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    histogram!("bk_http_request_duration_seconds", "method" => method.clone(), "path" => normalized.clone(), "status" => status.clone()).record(duration);
    counter!("bk_http_responses_total", "method" => method, "path" => normalized, "status" => status).increment(1);

    response
}

/// Replace UUIDs and numeric ids in paths to keep label cardinality low.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":id"
            } else if !seg.is_empty() && seg.parse::<i64>().is_ok() {
                ":id"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Record one producer run.
pub fn record_backup(kind: &str, success: bool, duration_secs: f64, stored_bytes: u64) {
    counter!("bk_backup_runs_total", "kind" => kind.to_string(), "status" => outcome(success)).increment(1);
    histogram!("bk_backup_duration_seconds", "kind" => kind.to_string()).record(duration_secs);
    if success {
        histogram!("bk_backup_size_bytes", "kind" => kind.to_string()).record(stored_bytes as f64);
    }
}

/// Record a job attempt that will be retried.
pub fn record_job_retry(kind: &str) {
    counter!("bk_job_retries_total", "kind" => kind.to_string()).increment(1);
}

/// Record a terminal job outcome.
pub fn record_job_finished(kind: &str, success: bool) {
    counter!("bk_jobs_total", "kind" => kind.to_string(), "status" => outcome(success)).increment(1);
}

pub fn record_restore(kind: &str, success: bool) {
    counter!("bk_restores_total", "kind" => kind.to_string(), "status" => outcome(success)).increment(1);
}

pub fn record_integrity_failure(kind: &str) {
    counter!("bk_integrity_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record artifacts removed by retention.
pub fn record_retention_deletions(count: u64) {
    counter!("bk_retention_deleted_total").increment(count);
}

pub fn set_open_alerts(severity: AlertSeverity, count: usize) {
    gauge!("bk_open_alerts", "severity" => severity.to_string()).set(count as f64);
}

pub fn set_storage_usage(used_bytes: u64, percent_used: Option<f64>) {
    gauge!("bk_storage_used_bytes").set(used_bytes as f64);
    if let Some(p) = percent_used {
        gauge!("bk_storage_used_percent").set(p);
    }
}

pub fn record_recovery_run(procedure: &str, test_mode: bool, success: bool) {
    let mode = if test_mode { "test" } else { "production" };
    counter!("bk_recovery_runs_total", "procedure" => procedure.to_string(), "mode" => mode, "status" => outcome(success)).increment(1);
}

/// Update database connection pool gauge metrics.
pub fn set_db_pool_gauges(pool: &sqlx::PgPool) {
    let size = pool.size() as f64;
    let idle = pool.num_idle() as f64;
    gauge!("bk_db_pool_connections_active").set(size - idle);
    gauge!("bk_db_pool_connections_idle").set(idle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/backups/550e8400-e29b-41d4-a716-446655440000/restore";
        assert_eq!(normalize_path(path), "/api/v1/backups/:id/restore");
    }

    #[test]
    fn test_normalize_path_numeric() {
        assert_eq!(normalize_path("/api/v1/jobs/123"), "/api/v1/jobs/:id");
    }

    #[test]
    fn test_normalize_path_no_change() {
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_backup("database", true, 1.5, 1024);
        record_job_retry("files");
        record_integrity_failure("files");
        set_open_alerts(AlertSeverity::Critical, 2);
    }
}
