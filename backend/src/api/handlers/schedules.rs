//! Backup schedule handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::Result;
use crate::models::{Job, Schedule};
use crate::services::scheduler_service::{CreateScheduleRequest, UpdateScheduleRequest};

const DEFAULT_JOB_LIMIT: usize = 50;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route(
            "/:id",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
        .route("/:id/run", post(run_schedule))
        .route("/:id/jobs", get(list_jobs))
}

#[derive(Debug, Deserialize)]
pub struct ListSchedulesQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

/// GET /api/v1/schedules
pub async fn list_schedules(
    State(state): State<SharedState>,
    Query(query): Query<ListSchedulesQuery>,
) -> Result<Json<Vec<Schedule>>> {
    let schedules = state.scheduler.list_schedules(query.include_deleted).await?;
    Ok(Json(schedules))
}

/// POST /api/v1/schedules
pub async fn create_schedule(
    State(state): State<SharedState>,
    Json(payload): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<Schedule>)> {
    let schedule = state.scheduler.create_schedule(payload, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/v1/schedules/:id
pub async fn get_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Schedule>> {
    Ok(Json(state.scheduler.get_schedule(id).await?))
}

/// PATCH /api/v1/schedules/:id
pub async fn update_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateScheduleRequest>,
) -> Result<Json<Schedule>> {
    let schedule = state
        .scheduler
        .update_schedule(id, payload, Utc::now())
        .await?;
    Ok(Json(schedule))
}

/// DELETE /api/v1/schedules/:id
pub async fn delete_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.scheduler.delete_schedule(id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/schedules/:id/run
///
/// Starts a job and returns it immediately; the attempt runs in the background.
pub async fn run_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Job>)> {
    let job = state.scheduler.trigger(id, Utc::now()).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/schedules/:id/jobs
pub async fn list_jobs(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>> {
    state.scheduler.get_schedule(id).await?;
    let jobs = state
        .scheduler
        .list_jobs(Some(id), query.limit.unwrap_or(DEFAULT_JOB_LIMIT))
        .await?;
    Ok(Json(jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{body_json, context, empty_request, json_request};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_create_get_and_delete_schedule() {
        let ctx = context().await;
        let app = ctx.router();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/schedules",
                json!({"name": "nightly", "kind": "database", "cron_expression": "0 2 * * *"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["name"], "nightly");
        assert_eq!(created["enabled"], true);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/v1/schedules/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/api/v1/schedules/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/api/v1/schedules"))
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_bad_request() {
        let ctx = context().await;
        let app = ctx.router();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/schedules",
                json!({"name": "broken", "kind": "files", "cron_expression": "every day"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "INVALID_SCHEDULE");
    }

    #[tokio::test]
    async fn test_unknown_schedule_is_not_found() {
        let ctx = context().await;
        let app = ctx.router();

        let response = app
            .oneshot(empty_request(
                "POST",
                &format!("/api/v1/schedules/{}/run", Uuid::new_v4()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
