//! Backup report handler.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::api::SharedState;
use crate::error::Result;
use crate::services::report_service::BackupReport;

const DEFAULT_REPORT_DAYS: i64 = 30;

pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(generate_report))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// GET /api/v1/reports?from=&to=
///
/// Defaults to the 30 days before `to` (or now).
pub async fn generate_report(
    State(state): State<SharedState>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<BackupReport>> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query
        .from
        .unwrap_or_else(|| to - Duration::days(DEFAULT_REPORT_DAYS));
    Ok(Json(state.reports.generate(from, to).await?))
}
