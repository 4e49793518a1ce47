//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Recurrence expression could not be parsed. Never retried.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A dump or archive step failed. Retried by the scheduler.
    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// Stored artifact does not match its recorded checksum. Always fatal.
    #[error("Integrity check failed for artifact {artifact_id}: expected {expected}, got {actual}")]
    Integrity {
        artifact_id: Uuid,
        expected: String,
        actual: String,
    },

    /// External dependency unreachable or returned an unexpected status
    #[error("Health check failed: {0}")]
    HealthCheck(String),

    /// A disaster-recovery step failed. Never retried automatically.
    #[error("Recovery step '{step}' failed: {message}")]
    RecoveryStep { step: String, message: String },

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict error (e.g., overlapping recovery runs)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address parse error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("Row not found".to_string()),
            other => AppError::Database(other.to_string()),
        }
    }
}

impl AppError {
    /// Stable machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Migration(_) => "MIGRATION_ERROR",
            AppError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            AppError::BackupFailed(_) => "BACKUP_FAILED",
            AppError::Integrity { .. } => "INTEGRITY_ERROR",
            AppError::HealthCheck(_) => "HEALTH_CHECK_ERROR",
            AppError::RecoveryStep { .. } => "RECOVERY_STEP_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::AddrParse(_) => "ADDR_PARSE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database operation failed".to_string(),
            ),
            AppError::Migration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database migration failed".to_string(),
            ),
            AppError::InvalidSchedule(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::BackupFailed(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Integrity { .. } => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            AppError::HealthCheck(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::RecoveryStep { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO operation failed".to_string(),
            ),
            AppError::AddrParse(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Invalid address".to_string(),
            ),
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "Invalid JSON".to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let code = self.code();
        tracing::error!(error = %self, code = code, "Request error");

        let body = Json(json!({
            "code": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_error_message_names_both_checksums() {
        let id = Uuid::nil();
        let err = AppError::Integrity {
            artifact_id: id,
            expected: "aaa".into(),
            actual: "bbb".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected aaa"));
        assert!(msg.contains("got bbb"));
        assert_eq!(err.code(), "INTEGRITY_ERROR");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_status_codes() {
        let resp = AppError::InvalidSchedule("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::Conflict("busy".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = AppError::Integrity {
            artifact_id: Uuid::nil(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
