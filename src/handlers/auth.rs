// Login, logout, tokens, principals, auth configs and the SAML service-provider endpoints

use axum::{
    extract::{Extension, Form, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::providers::saml::{error_redirect, SamlProvider, STATE_COOKIE, TEST_AND_ENABLE_ACTION};
use crate::auth::{expired_session_cookie, session_cookie, token_from_headers, AuthError, LoginInput};
use crate::error::{ApiError, ApiResult};
use crate::middleware::{AppState, CurrentToken};
use crate::models::auth::{AuthConfig, PrincipalType, ProviderKind, Token};

#[derive(Debug, Default, Deserialize)]
pub struct ActionQuery {
    pub action: Option<String>,
}

impl ActionQuery {
    fn require(&self, action: &str) -> ApiResult<()> {
        match self.action.as_deref() {
            Some(a) if a == action => Ok(()),
            Some(a) => Err(ApiError::InvalidAction(format!("invalid action {}", a))),
            None => Err(ApiError::InvalidAction("action is required".to_string())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedirectInput {
    #[serde(default)]
    final_redirect_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAndEnableInput {
    /// Candidate config; the stored one when absent.
    #[serde(default)]
    pub config: Option<AuthConfig>,
    #[serde(default)]
    pub final_redirect_url: String,
    #[serde(flatten)]
    pub login: LoginInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub principal_type: Option<PrincipalType>,
}

#[derive(Debug, Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState", default)]
    pub relay_state: String,
}

/// `<name>:<key>` handed back to the client.
pub fn token_value(token: &Token) -> String {
    format!("{}:{}", token.name(), token.token)
}

/// Token as listed to its owner, without the secret half.
fn public_token(mut token: Token) -> Token {
    token.token.clear();
    token
}

/// `githubProviders` -> `github`
fn provider_collection(collection: &str, name: &str) -> ApiResult<ProviderKind> {
    let matches = collection
        .strip_suffix("Providers")
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(name));
    if !matches {
        return Err(ApiError::NotFound(format!("no such provider {}/{}", collection, name)));
    }
    ProviderKind::from_name(name).ok_or_else(|| ApiError::NotFound(format!("no such provider {}", name)))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(n, v)| *n == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

fn state_cookie(value: &str, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly", STATE_COOKIE, value);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn expired_state_cookie(secure: bool) -> String {
    let mut cookie = format!("{}=; Path=/; HttpOnly; Max-Age=-1", STATE_COOKIE);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn saml_provider(state: &AppState, name: &str) -> ApiResult<(ProviderKind, Arc<SamlProvider>)> {
    let kind = ProviderKind::from_name(name)
        .filter(|k| k.is_saml())
        .ok_or_else(|| ApiError::NotFound(format!("no such saml provider {}", name)))?;
    let provider = state
        .providers
        .saml(kind)
        .ok_or_else(|| ApiError::NotFound(format!("saml provider {} is not supported", kind)))?;
    Ok((kind, provider))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// POST /v3-public/<provider>Providers/<name>?action=login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Path((collection, name)): Path<(String, String)>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let kind = provider_collection(&collection, &name)?;
    query.require("login")?;
    let secure = state.is_secure(&headers);

    if kind.is_saml() {
        let input: RedirectInput = parse_body(body)?;
        let (_, provider) = saml_provider(&state, kind.name())?;
        let config = state.providers.config(kind).await?;
        if !config.enabled {
            return Err(AuthError::Unauthorized(format!("auth provider {} is disabled", kind)).into());
        }
        let login = provider.login_request(&config, &input.final_redirect_url, None, None)?;
        return Ok((
            [(header::SET_COOKIE, state_cookie(&login.state_cookie, secure))],
            Json(json!({ "idpRedirectUrl": login.idp_redirect_url })),
        )
            .into_response());
    }

    let input: LoginInput = parse_body(body)?;
    let token = state.providers.login(kind.name(), &input).await?;
    let value = token_value(&token);
    let cookie = session_cookie(&value, secure);

    if input.response_type == "cookie" {
        return Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)]).into_response());
    }
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "type": "token", "token": value })),
    )
        .into_response())
}

/// GET /v3-public/authProviders
pub async fn list_auth_providers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let configs = state.providers.public_configs().await?;
    Ok(Json(json!({ "data": configs })))
}

/// POST /v3/tokens?action=logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    query.require("logout")?;
    if let Some(value) = token_from_headers(&headers) {
        state.tokens().logout(&value).await?;
    }
    let cookie = expired_session_cookie(state.is_secure(&headers));
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)]).into_response())
}

/// GET /v3/tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentToken>,
) -> ApiResult<Json<Value>> {
    let tokens: Vec<Token> = state
        .tokens()
        .list_tokens(&current.token)
        .await?
        .into_iter()
        .map(public_token)
        .collect();
    Ok(Json(json!({ "data": tokens })))
}

/// GET /v3/tokens/<id>
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentToken>,
    Path(id): Path<String>,
) -> ApiResult<Json<Token>> {
    let token = state.tokens().get_token_by_id(&current.token, &id).await?;
    Ok(Json(public_token(token)))
}

/// DELETE /v3/tokens/<id>
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentToken>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.tokens().remove_token(&current.token, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v3/principals?action=search
pub async fn search_principals(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentToken>,
    Query(query): Query<ActionQuery>,
    Json(input): Json<SearchInput>,
) -> ApiResult<Json<Value>> {
    query.require("search")?;
    let principals = state
        .providers
        .search(&current.token, &input.name, input.principal_type)
        .await?;
    Ok(Json(json!({ "data": principals })))
}

/// GET /v3/principals/<id>
pub async fn get_principal(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentToken>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let principal = state.providers.get_principal(&current.token, &id).await?;
    Ok(Json(json!(principal)))
}

/// PUT /v3/authConfigs/<name>
pub async fn update_auth_config(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut config): Json<AuthConfig>,
) -> ApiResult<Json<AuthConfig>> {
    config.metadata.name = name;
    let config = state.providers.update_config(config).await?;
    Ok(Json(config))
}

/// POST /v3/authConfigs/<name>?action=testAndEnable|disable
pub async fn auth_config_action(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentToken>,
    Path(name): Path<String>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let kind = ProviderKind::from_name(&name).ok_or_else(|| ApiError::NotFound(format!("no such provider {}", name)))?;
    match query.action.as_deref() {
        Some("disable") => {
            let config = state.providers.disable(kind).await?;
            Ok(Json(config).into_response())
        }
        Some(TEST_AND_ENABLE_ACTION) => {
            let input: TestAndEnableInput = parse_body(body)?;
            let config = match input.config {
                Some(config) => config,
                None => state.providers.config(kind).await?,
            };

            if kind.is_saml() {
                // Stored first so the ACS handler sees the candidate config.
                let config = state.providers.update_config(config).await?;
                let (_, provider) = saml_provider(&state, kind.name())?;
                let login = provider.login_request(
                    &config,
                    &input.final_redirect_url,
                    Some(current.token.user_id.clone()),
                    Some(TEST_AND_ENABLE_ACTION.to_string()),
                )?;
                let secure = state.is_secure(&headers);
                return Ok((
                    [(header::SET_COOKIE, state_cookie(&login.state_cookie, secure))],
                    Json(json!({ "idpRedirectUrl": login.idp_redirect_url })),
                )
                    .into_response());
            }

            let config = state
                .providers
                .test_and_enable(config, &input.login, &current.token)
                .await?;
            Ok(Json(config).into_response())
        }
        Some(other) => Err(ApiError::InvalidAction(format!("invalid action {}", other))),
        None => Err(ApiError::InvalidAction("action is required".to_string())),
    }
}

/// GET /v1-saml/<provider>/saml/metadata
pub async fn saml_metadata(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let (kind, provider) = saml_provider(&state, &name)?;
    let config = state.providers.config(kind).await?;
    let metadata = provider.metadata(&config)?;
    Ok(([(header::CONTENT_TYPE, "application/xml")], metadata).into_response())
}

/// POST /v1-saml/<provider>/saml/acs
///
/// A bad relay state is an HTTP error. Anything after that redirects the
/// browser, with `errorCode` on failure.
pub async fn saml_acs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Form(form): Form<AcsForm>,
) -> ApiResult<Response> {
    let (kind, provider) = saml_provider(&state, &name)?;
    let config = state.providers.config(kind).await?;
    let cookie = cookie_value(&headers, STATE_COOKIE);
    let outcome = provider.consume(&config, &form.saml_response, &form.relay_state, cookie.as_deref())?;

    let secure = state.is_secure(&headers);
    let clear_state = expired_state_cookie(secure);
    let fail = |err: &AuthError| {
        (
            AppendHeaders([(header::SET_COOKIE, clear_state.clone())]),
            Redirect::to(&error_redirect(&outcome.redirect, err)),
        )
            .into_response()
    };

    let result = match outcome.result {
        Ok(result) => result,
        Err(e) => return Ok(fail(&e)),
    };

    if outcome.action.as_deref() == Some(TEST_AND_ENABLE_ACTION) {
        let Some(user_id) = outcome.user_id.as_deref() else {
            return Ok(fail(&AuthError::Unauthorized("test and enable without a user".to_string())));
        };
        if let Err(e) = state
            .providers
            .users()
            .set_principal_on_current_user(user_id, &result.user_principal)
            .await
        {
            warn!("saml test and enable for {} failed: {}", kind, e);
            return Ok(fail(&e));
        }
        let mut enabled = config;
        enabled.enabled = true;
        if !enabled.allowed_principal_ids.contains(&result.user_principal.id) {
            enabled.allowed_principal_ids.push(result.user_principal.id.clone());
        }
        if let Err(e) = state.providers.update_config(enabled).await {
            return Ok(fail(&e));
        }
        info!(provider = %kind, user = user_id, "auth provider enabled");
        return Ok((
            AppendHeaders([(header::SET_COOKIE, clear_state.clone())]),
            Redirect::to(&outcome.redirect),
        )
            .into_response());
    }

    match state.providers.complete_login(&config, result, None, "").await {
        Ok(token) => Ok((
            AppendHeaders([
                (header::SET_COOKIE, clear_state.clone()),
                (header::SET_COOKIE, session_cookie(&token_value(&token), secure)),
            ]),
            Redirect::to(&outcome.redirect),
        )
            .into_response()),
        Err(e) => Ok(fail(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn collection_must_name_the_provider() {
        assert_eq!(provider_collection("localProviders", "local").unwrap(), ProviderKind::Local);
        assert_eq!(
            provider_collection("activeDirectoryProviders", "activedirectory").unwrap(),
            ProviderKind::ActiveDirectory
        );
        assert!(matches!(
            provider_collection("localProviders", "github").unwrap_err(),
            ApiError::NotFound(_)
        ));
        assert!(provider_collection("localConfigs", "local").is_err());
    }

    #[test]
    fn action_query_is_checked() {
        let query = ActionQuery {
            action: Some("login".to_string()),
        };
        assert!(query.require("login").is_ok());
        assert!(matches!(query.require("logout").unwrap_err(), ApiError::InvalidAction(_)));
        assert!(ActionQuery::default().require("login").is_err());
    }

    #[test]
    fn state_cookie_is_read_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("R_SESS=token-abc:key; saml-state=signed.jwt.value"),
        );
        assert_eq!(cookie_value(&headers, STATE_COOKIE).as_deref(), Some("signed.jwt.value"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn listed_tokens_hide_their_key() {
        let token = Token {
            metadata: crate::models::ObjectMeta::named("token-x7k2q"),
            token: "secret".to_string(),
            ..Default::default()
        };
        assert_eq!(token_value(&token), "token-x7k2q:secret");
        assert!(public_token(token).token.is_empty());
    }
}
