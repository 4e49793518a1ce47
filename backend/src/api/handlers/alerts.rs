//! Alert handlers.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::Result;
use crate::models::Alert;

const DEFAULT_RESOLVER: &str = "operator";

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_alerts))
        .route("/:id", get(get_alert))
        .route("/:id/resolve", post(resolve_alert))
}

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    #[serde(default)]
    pub unresolved: bool,
}

/// GET /api/v1/alerts
pub async fn list_alerts(
    State(state): State<SharedState>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<Vec<Alert>>> {
    Ok(Json(state.alerts.list(query.unresolved).await?))
}

/// GET /api/v1/alerts/:id
pub async fn get_alert(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>> {
    Ok(Json(state.alerts.get(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveAlertRequest {
    pub resolved_by: Option<String>,
}

/// POST /api/v1/alerts/:id/resolve
pub async fn resolve_alert(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ResolveAlertRequest>>,
) -> Result<Json<Alert>> {
    let resolved_by = payload
        .and_then(|Json(req)| req.resolved_by)
        .unwrap_or_else(|| DEFAULT_RESOLVER.to_string());
    let alert = state.alerts.resolve(id, &resolved_by, Utc::now()).await?;
    Ok(Json(alert))
}
