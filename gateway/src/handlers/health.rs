// src/handlers/health.rs
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;

use crate::server::AppState;

/// GET /healthz
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "tunnels": state.tunnels.len(),
        "proxies": state.router.proxies().len(),
    }))
}

/// GET /metrics
pub async fn metrics_endpoint(handle: PrometheusHandle) -> impl IntoResponse {
    (axum::http::StatusCode::OK, handle.render())
}
