//! Route definitions for the API.

use axum::{routing::get, Router};

use super::handlers;
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health_check))
        .route("/healthz", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}

fn api_v1_routes() -> Router<SharedState> {
    Router::new()
        .nest("/schedules", handlers::schedules::router())
        .nest("/backups", handlers::backups::router())
        .nest("/alerts", handlers::alerts::router())
        .nest("/disasters", handlers::recovery::disasters_router())
        .nest("/procedures", handlers::recovery::procedures_router())
        .nest("/reports", handlers::reports::router())
}
