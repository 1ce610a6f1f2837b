// Catalog refresh and exportYaml actions

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::auth::ActionQuery;
use crate::error::{ApiError, ApiResult};
use crate::middleware::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct LinkQuery {
    pub link: Option<String>,
}

/// API ids of namespaced catalogs are `<namespace>:<name>`.
fn catalog_key(id: &str) -> String {
    match id.split_once(':') {
        Some((ns, name)) => format!("{}/{}", ns, name),
        None => id.to_string(),
    }
}

async fn refresh(state: &AppState, key: Option<&str>) -> ApiResult<Response> {
    let refreshed = state.catalogs.refresh(key).await?;
    let names: Vec<&str> = refreshed.iter().map(|c| c.metadata.name.as_str()).collect();
    Ok(Json(json!({ "catalogs": names })).into_response())
}

async fn export_yaml(state: &AppState, id: &str) -> ApiResult<Response> {
    let yaml = state.catalogs.export_yaml(&catalog_key(id)).await?;
    Ok(([(header::CONTENT_TYPE, "text/yaml")], yaml).into_response())
}

/// POST /v3/catalogs?action=refresh
pub async fn refresh_all(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionQuery>,
) -> ApiResult<Response> {
    match query.action.as_deref() {
        Some("refresh") => refresh(&state, None).await,
        _ => Err(ApiError::InvalidAction("only refresh is supported on the collection".to_string())),
    }
}

/// POST /v3/{catalogs,clusterCatalogs,projectCatalogs}/<id>?action=refresh|exportYaml
pub async fn catalog_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ActionQuery>,
) -> ApiResult<Response> {
    match query.action.as_deref() {
        Some("refresh") => refresh(&state, Some(&catalog_key(&id))).await,
        Some("exportYaml") => export_yaml(&state, &id).await,
        Some(other) => Err(ApiError::InvalidAction(format!("invalid action {}", other))),
        None => Err(ApiError::InvalidAction("action is required".to_string())),
    }
}

/// GET /v3/{catalogs,clusterCatalogs,projectCatalogs}/<id>?link=exportYaml
pub async fn catalog_link(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LinkQuery>,
) -> ApiResult<Response> {
    match query.link.as_deref() {
        Some("exportYaml") => export_yaml(&state, &id).await,
        Some(other) => Err(ApiError::NotFound(format!("no such link {}", other))),
        None => Err(ApiError::NotFound("link is required".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_ids_become_store_keys() {
        assert_eq!(catalog_key("library"), "library");
        assert_eq!(catalog_key("c-1:helm"), "c-1/helm");
        assert_eq!(catalog_key("p-1:team:charts"), "p-1/team:charts");
    }
}
