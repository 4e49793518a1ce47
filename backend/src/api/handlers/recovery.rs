//! Disaster event and recovery procedure handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{DisasterEvent, RecoveryProcedure, TestResult};
use crate::services::recovery_service::DisasterReport;

const DEFAULT_TEST_ENVIRONMENT: &str = "test";

pub fn disasters_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_events).post(report_disaster))
        .route("/:id", get(get_event))
        .route("/:id/start", post(start_recovery))
        .route("/:id/confirm", post(confirm_step))
        .route("/:id/retry", post(retry_recovery))
}

pub fn procedures_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_procedures))
        .route("/:id", get(get_procedure))
        .route("/:id/test", post(test_procedure))
}

/// GET /api/v1/disasters
pub async fn list_events(State(state): State<SharedState>) -> Result<Json<Vec<DisasterEvent>>> {
    Ok(Json(state.recovery.list_events().await?))
}

/// POST /api/v1/disasters
///
/// Records the event; allowlisted type/severity pairs start recovery before
/// the response is returned.
pub async fn report_disaster(
    State(state): State<SharedState>,
    Json(payload): Json<DisasterReport>,
) -> Result<(StatusCode, Json<DisasterEvent>)> {
    let event = state
        .recovery
        .handle_disaster_event(payload, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// GET /api/v1/disasters/:id
pub async fn get_event(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DisasterEvent>> {
    Ok(Json(state.recovery.get_event(id).await?))
}

/// POST /api/v1/disasters/:id/start
pub async fn start_recovery(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DisasterEvent>> {
    Ok(Json(state.recovery.start_recovery_procedure(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmStepRequest {
    pub operator: String,
}

/// POST /api/v1/disasters/:id/confirm
pub async fn confirm_step(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ConfirmStepRequest>,
) -> Result<Json<DisasterEvent>> {
    if payload.operator.trim().is_empty() {
        return Err(AppError::Validation("operator is required".into()));
    }
    let event = state
        .recovery
        .confirm_manual_step(id, payload.operator.trim(), Utc::now())
        .await?;
    Ok(Json(event))
}

/// POST /api/v1/disasters/:id/retry
pub async fn retry_recovery(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DisasterEvent>> {
    Ok(Json(state.recovery.retry_recovery(id).await?))
}

/// GET /api/v1/procedures
pub async fn list_procedures(
    State(state): State<SharedState>,
) -> Result<Json<Vec<RecoveryProcedure>>> {
    Ok(Json(state.recovery.list_procedures().await?))
}

/// GET /api/v1/procedures/:id
pub async fn get_procedure(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RecoveryProcedure>> {
    Ok(Json(state.recovery.get_procedure(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TestProcedureRequest {
    pub environment: Option<String>,
}

/// POST /api/v1/procedures/:id/test
pub async fn test_procedure(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    payload: Option<Json<TestProcedureRequest>>,
) -> Result<Json<TestResult>> {
    let environment = payload
        .and_then(|Json(req)| req.environment)
        .unwrap_or_else(|| DEFAULT_TEST_ENVIRONMENT.to_string());
    let result = state
        .recovery
        .test_recovery_procedure(&id, &environment, Utc::now())
        .await?;
    Ok(Json(result))
}
