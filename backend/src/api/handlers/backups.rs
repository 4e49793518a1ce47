//! Backup artifact handlers: listing, restore, verification and retention.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::Result;
use crate::models::Artifact;
use crate::services::backup_service::{CleanupReport, VerifyReport};
use crate::services::producer::RestoreTarget;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_backups))
        .route("/cleanup", post(cleanup_backups))
        .route("/:id", get(get_backup).delete(delete_backup))
        .route("/:id/restore", post(restore_backup))
        .route("/:id/verify", post(verify_backup))
}

/// Where to restore an artifact to.
#[derive(Debug, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum RestoreRequest {
    Live,
    Directory { path: PathBuf },
    Database { url: String },
}

impl From<RestoreRequest> for RestoreTarget {
    fn from(req: RestoreRequest) -> Self {
        match req {
            RestoreRequest::Live => RestoreTarget::Live,
            RestoreRequest::Directory { path } => RestoreTarget::Directory(path),
            RestoreRequest::Database { url } => RestoreTarget::Database(url),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub artifact_id: Uuid,
    pub restored: bool,
}

/// GET /api/v1/backups
pub async fn list_backups(State(state): State<SharedState>) -> Result<Json<Vec<Artifact>>> {
    Ok(Json(state.backups.list_backups().await?))
}

/// GET /api/v1/backups/:id
pub async fn get_backup(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Artifact>> {
    Ok(Json(state.backups.get_backup(id).await?))
}

/// DELETE /api/v1/backups/:id
pub async fn delete_backup(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.backups.delete_backup(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/backups/:id/restore
pub async fn restore_backup(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RestoreRequest>,
) -> Result<Json<RestoreResponse>> {
    let target = RestoreTarget::from(payload);
    state.backups.restore_from_backup(id, &target).await?;
    Ok(Json(RestoreResponse {
        artifact_id: id,
        restored: true,
    }))
}

/// POST /api/v1/backups/:id/verify
pub async fn verify_backup(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VerifyReport>> {
    Ok(Json(state.backups.verify_artifact(id).await?))
}

/// POST /api/v1/backups/cleanup
pub async fn cleanup_backups(State(state): State<SharedState>) -> Result<Json<CleanupReport>> {
    Ok(Json(state.backups.cleanup_old_backups(Utc::now()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{body_json, context, empty_request, json_request, TestContext};
    use crate::models::{ArtifactStatus, SourceKind};
    use crate::store::MetadataStore;
    use crate::services::storage_service::StorageService;
    use bytes::Bytes;
    use serde_json::json;
    use tower::ServiceExt;

    async fn stored_artifact(ctx: &TestContext, content: &'static [u8], checksum_of: &[u8]) -> Uuid {
        let id = Uuid::new_v4();
        let key = StorageService::archive_key(SourceKind::Files, id, "tar.gz");
        ctx.storage.put(&key, Bytes::from_static(content)).await.unwrap();
        let artifact = Artifact {
            id,
            job_id: Uuid::new_v4(),
            kind: SourceKind::Files,
            created_at: Utc::now(),
            sources: vec!["etc/app.conf".into()],
            size_bytes: content.len() as u64,
            compressed_size_bytes: content.len() as u64,
            compressed: true,
            duration_ms: 10,
            status: ArtifactStatus::Success,
            location: format!("file://{}", key),
            storage_key: key,
            checksum: StorageService::calculate_hash(checksum_of),
            error: None,
        };
        ctx.store.upsert_artifact(&artifact).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_verify_intact_backup() {
        let ctx = context().await;
        let id = stored_artifact(&ctx, b"archive bytes", b"archive bytes").await;

        let response = ctx
            .router()
            .oneshot(empty_request("POST", &format!("/api/v1/backups/{}/verify", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["size_bytes"], 13);
    }

    #[tokio::test]
    async fn test_restore_of_corrupted_backup_is_rejected() {
        let ctx = context().await;
        let id = stored_artifact(&ctx, b"tampered bytes", b"original bytes").await;

        let response = ctx
            .router()
            .oneshot(json_request(
                "POST",
                &format!("/api/v1/backups/{}/restore", id),
                json!({"target": "directory", "path": "/tmp/unused"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["code"], "INTEGRITY_ERROR");
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let ctx = context().await;
        let id = stored_artifact(&ctx, b"archive bytes", b"archive bytes").await;
        let app = ctx.router();

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/api/v1/backups/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", &format!("/api/v1/backups/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_restore_request_targets() {
        let req: RestoreRequest = serde_json::from_value(json!({"target": "live"})).unwrap();
        assert_eq!(RestoreTarget::from(req), RestoreTarget::Live);

        let req: RestoreRequest =
            serde_json::from_value(json!({"target": "database", "url": "postgres://x/y"})).unwrap();
        assert_eq!(
            RestoreTarget::from(req),
            RestoreTarget::Database("postgres://x/y".into())
        );
    }
}
