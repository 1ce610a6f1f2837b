// Request middleware: token authentication, request logging and HTTP metrics

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::auth::{token_from_headers, Providers, TokenManager};
use crate::catalog::CatalogManager;
use crate::error::ApiError;
use crate::models::auth::Token;
use crate::registration::Registration;
use crate::settings::Settings;
use crate::store::Stores;

/// Resolves the `<name>:<key>` token of the request and stores it in the
/// request extensions for handlers.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let value = token_from_headers(request.headers())
        .ok_or_else(|| ApiError::Unauthorized("must authenticate".to_string()))?;

    let token = state.tokens().validate(&value).await?;

    request.extensions_mut().insert(CurrentToken { value, token });

    Ok(next.run(request).await)
}

/// Request logging middleware with correlation ID
pub async fn request_logger(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    info!(%request_id, method = %req.method(), uri = %req.uri(), "request started");

    let response = next.run(req).await;

    info!(%request_id, status = %response.status(), "request finished");
    response
}

/// Records request count and duration per method and status.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();

    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!("http_requests_total", "method" => method.clone(), "status" => status.clone()).increment(1);
    histogram!("http_request_duration_seconds", "method" => method, "status" => status).record(elapsed);

    response
}

/// Session token of the authenticated caller.
#[derive(Debug, Clone)]
pub struct CurrentToken {
    pub value: String,
    pub token: Token,
}

/// Application state
pub struct AppState {
    pub stores: Stores,
    pub settings: Settings,
    pub providers: Arc<Providers>,
    pub registration: Arc<Registration>,
    pub catalogs: Arc<CatalogManager>,
    /// Forces `Secure` on session cookies even behind plain-HTTP proxies.
    pub secure_cookies: bool,
}

impl AppState {
    pub fn tokens(&self) -> &TokenManager {
        self.providers.tokens()
    }

    /// Whether the client reached us over https, directly or via a proxy.
    pub fn is_secure(&self, headers: &HeaderMap) -> bool {
        self.secure_cookies || scheme(headers) == "https"
    }

    /// `scheme://host` of the request as the client saw it.
    pub fn origin(&self, headers: &HeaderMap) -> String {
        let host = headers
            .get("X-Forwarded-Host")
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("{}://{}", scheme(headers), host)
    }
}

fn scheme(headers: &HeaderMap) -> &str {
    headers
        .get("X-Forwarded-Proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_scheme_wins_over_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(scheme(&headers), "http");
        headers.insert("X-Forwarded-Proto", HeaderValue::from_static("https, http"));
        assert_eq!(scheme(&headers), "https");
    }
}
