// Self-registration manifest for imported clusters

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::middleware::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportQuery {
    #[serde(default)]
    pub auth_image: String,
}

/// GET /v3/import/<token>.yaml
pub async fn import_manifest(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
    Query(query): Query<ImportQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = file
        .strip_suffix(".yaml")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::NotFound(format!("{} not found", file)))?;

    let origin = state.origin(&headers);
    let manifest = state
        .registration
        .import_manifest(token, &origin, &query.auth_image)
        .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], manifest).into_response())
}
