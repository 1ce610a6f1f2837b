// src/middleware/logging.rs
use axum::{http::Request, middleware::Next, response::Response};
use tracing::info;
use uuid::Uuid;

use crate::proxy::route_target;

/// Request logging middleware with correlation ID and target cluster
pub async fn request_logger(req: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let cluster = route_target(req.uri(), req.headers())
        .map(|(id, _)| id)
        .unwrap_or_default();
    info!(%request_id, cluster = %cluster, method = %req.method(), uri = %req.uri(), "request started");

    let response = next.run(req).await;

    info!(%request_id, status = response.status().as_u16(), "request finished");
    response
}
