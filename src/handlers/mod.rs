// src/handlers/mod.rs
pub mod pipelines;
pub mod ws; // 📡 Live pipeline status

use axum::{extract::Extension, response::Json, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::middleware::logging::request_logging_middleware;
use crate::AppState;

/// Full HTTP surface with shared state attached
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(pipelines::pipeline_routes())
        .merge(ws::ws_routes())
        .route("/api/status", get(api_status))
        .layer(axum::middleware::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

// Liveness and configuration summary
async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.store_kind,
        "stage_timeout_secs": state.config.stage_timeout.as_secs(),
        "subscription_idle_timeout_secs": state.config.subscription_idle_timeout.as_secs(),
    }))
}
