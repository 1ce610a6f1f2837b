// src/middleware/metrics.rs
use axum::{http::Request, middleware::Next, response::Response};
use metrics::{counter, histogram, Label};
use std::time::Instant;

use crate::proxy::route_target;

/// Records request count and duration per method, status and target cluster
pub async fn metrics_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let cluster = route_target(req.uri(), req.headers())
        .map(|(id, _)| id)
        .unwrap_or_default();

    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let labels = vec![
        Label::new("method", method),
        Label::new("status", response.status().as_u16().to_string()),
        Label::new("cluster", cluster),
    ];
    counter!("gateway_requests_total", labels.clone()).increment(1);
    histogram!("gateway_request_duration_seconds", labels).record(elapsed);

    response
}
