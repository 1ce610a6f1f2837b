// src/handlers/proxy.rs
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::server::AppState;

/// Fallback for every path not served by the gateway itself.
pub async fn proxy(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    match state.router.serve(req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}
