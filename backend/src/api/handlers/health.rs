//! Health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::SharedState;
use crate::services::health_monitor_service::{HealthStatus, MonitorSnapshot};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Absent until the monitor has completed its first poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSnapshot>,
}

/// Health check endpoint - reports the monitor's last snapshot
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.monitor.last_snapshot();

    let (status, status_code) = match snapshot.as_ref().map(|s| s.overall) {
        None => ("starting", StatusCode::OK),
        Some(HealthStatus::Healthy) => ("healthy", StatusCode::OK),
        Some(HealthStatus::Degraded) => ("degraded", StatusCode::OK),
        Some(HealthStatus::Unhealthy) => ("unhealthy", StatusCode::SERVICE_UNAVAILABLE),
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        monitor: snapshot,
    };

    (status_code, Json(response))
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    let body = state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
