use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

/// GET /healthz
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /version
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "name": "corral",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Multi-cluster Kubernetes management server"
    }))
}

/// GET /metrics
pub async fn metrics_endpoint(handle: PrometheusHandle) -> impl IntoResponse {
    (axum::http::StatusCode::OK, handle.render())
}
