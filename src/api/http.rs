//! HTTP monitoring endpoints with Axum

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::host::{Hub, HubStats};

/// Create the Axum router with the monitoring endpoints
pub fn create_router(hub: Arc<Hub>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
        .layer(cors)
        .with_state(hub)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/stats - connection, request and event queue counters
async fn stats(State(hub): State<Arc<Hub>>) -> Json<HubStats> {
    Json(hub.stats())
}
