use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{parse_principal_id, public_config, AuthProvider, AuthResult, LoginInput};
use crate::auth::{AuthError, Result};
use crate::models::auth::{AuthConfig, GithubConfig, Principal, PrincipalType, ProviderConfig, ProviderKind, Token};

pub const ACCESS_TOKEN_INFO: &str = "access_token";
const USER_KIND: &str = "user";
const ORG_KIND: &str = "org";
const TEAM_KIND: &str = "team";
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GithubAccount {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub html_url: String,
    /// `User` or `Organization`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GithubTeam {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub organization: GithubAccount,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    items: Vec<GithubAccount>,
}

/// The slice of the GitHub API the provider needs.
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn access_token(&self, config: &GithubConfig, code: &str) -> Result<String>;

    async fn user(&self, config: &GithubConfig, token: &str) -> Result<GithubAccount>;

    async fn orgs(&self, config: &GithubConfig, token: &str) -> Result<Vec<GithubAccount>>;

    async fn teams(&self, config: &GithubConfig, token: &str) -> Result<Vec<GithubTeam>>;

    async fn search(
        &self,
        config: &GithubConfig,
        token: &str,
        query: &str,
        principal_type: Option<PrincipalType>,
    ) -> Result<Vec<GithubAccount>>;

    async fn account(&self, config: &GithubConfig, token: &str, id: &str) -> Result<GithubAccount>;

    async fn team(&self, config: &GithubConfig, token: &str, id: &str) -> Result<GithubTeam>;
}

fn scheme(config: &GithubConfig) -> &'static str {
    if config.tls {
        "https://"
    } else {
        "http://"
    }
}

/// Base of the login endpoints: github.com, or the enterprise host.
fn web_base(config: &GithubConfig) -> String {
    if config.hostname.is_empty() {
        "https://github.com".to_string()
    } else {
        format!("{}{}", scheme(config), config.hostname)
    }
}

/// Base of the REST API: api.github.com, or `/api/v3` on the enterprise host.
fn api_base(config: &GithubConfig) -> String {
    if config.hostname.is_empty() {
        "https://api.github.com".to_string()
    } else {
        format!("{}{}/api/v3", scheme(config), config.hostname)
    }
}

/// The `rel="next"` target of a `Link` header.
fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (url, rel) = part.split_once(';')?;
        if rel.trim() == r#"rel="next""# {
            Some(url.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        } else {
            None
        }
    })
}

fn provider_error(e: reqwest::Error) -> AuthError {
    AuthError::Provider(e.to_string())
}

pub struct HttpGithubClient {
    http: reqwest::Client,
}

impl HttpGithubClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("corral")
            .build()
            .map_err(provider_error)?;
        Ok(Self { http })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, token: &str) -> Result<(T, HeaderMap)> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("token {}", token))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(provider_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AuthError::NotFound(format!("{} not found", url)));
        }
        if !status.is_success() {
            return Err(AuthError::Provider(format!("GET {} returned {}", url, status)));
        }
        let headers = response.headers().clone();
        let body = response.json::<T>().await.map_err(provider_error)?;
        Ok((body, headers))
    }

    async fn get_paged<T: DeserializeOwned>(&self, url: String, token: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;
        while let Some(url) = next.take() {
            let (page, headers): (Vec<T>, _) = self.get_json(&url, token).await?;
            items.extend(page);
            pages += 1;
            if pages < MAX_PAGES {
                next = next_page(&headers);
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl GithubClient for HttpGithubClient {
    async fn access_token(&self, config: &GithubConfig, code: &str) -> Result<String> {
        let url = format!("{}/login/oauth/access_token", web_base(config));
        let form = [
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("code", code),
        ];
        let response: AccessTokenResponse = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(provider_error)?
            .json()
            .await
            .map_err(provider_error)?;
        if !response.error.is_empty() {
            return Err(AuthError::Unauthorized(format!(
                "{}: {}",
                response.error, response.error_description
            )));
        }
        if response.access_token.is_empty() {
            return Err(AuthError::Unauthorized("no access token returned".to_string()));
        }
        Ok(response.access_token)
    }

    async fn user(&self, config: &GithubConfig, token: &str) -> Result<GithubAccount> {
        let (user, _) = self.get_json(&format!("{}/user", api_base(config)), token).await?;
        Ok(user)
    }

    async fn orgs(&self, config: &GithubConfig, token: &str) -> Result<Vec<GithubAccount>> {
        self.get_paged(format!("{}/user/orgs?per_page={}", api_base(config), PAGE_SIZE), token)
            .await
    }

    async fn teams(&self, config: &GithubConfig, token: &str) -> Result<Vec<GithubTeam>> {
        self.get_paged(format!("{}/user/teams?per_page={}", api_base(config), PAGE_SIZE), token)
            .await
    }

    async fn search(
        &self,
        config: &GithubConfig,
        token: &str,
        query: &str,
        principal_type: Option<PrincipalType>,
    ) -> Result<Vec<GithubAccount>> {
        let mut q = query.to_string();
        match principal_type {
            Some(PrincipalType::User) => q.push_str(" type:user"),
            Some(PrincipalType::Group) => q.push_str(" type:org"),
            None => {}
        }
        let base = format!("{}/search/users", api_base(config));
        let url = reqwest::Url::parse_with_params(&base, &[("q", q.as_str()), ("per_page", "100")])
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let (result, _): (SearchResult, _) = self.get_json(url.as_str(), token).await?;
        Ok(result.items)
    }

    async fn account(&self, config: &GithubConfig, token: &str, id: &str) -> Result<GithubAccount> {
        let (account, _) = self
            .get_json(&format!("{}/user/{}", api_base(config), id), token)
            .await?;
        Ok(account)
    }

    async fn team(&self, config: &GithubConfig, token: &str, id: &str) -> Result<GithubTeam> {
        let (team, _) = self
            .get_json(&format!("{}/teams/{}", api_base(config), id), token)
            .await?;
        Ok(team)
    }
}

pub struct GithubProvider {
    client: Arc<dyn GithubClient>,
}

impl GithubProvider {
    pub fn new(client: Arc<dyn GithubClient>) -> Self {
        Self { client }
    }

    fn github_config(config: &AuthConfig) -> Result<&GithubConfig> {
        match &config.provider {
            ProviderConfig::GithubConfig(c) => Ok(c),
            _ => Err(AuthError::Internal(format!(
                "auth config {} is not a github config",
                config.metadata.name
            ))),
        }
    }

    fn access_token(token: &Token) -> Result<&str> {
        token
            .provider_info
            .get(ACCESS_TOKEN_INFO)
            .map(String::as_str)
            .ok_or_else(|| AuthError::Unauthorized("no github access token on session".to_string()))
    }

    fn account_principal(account: &GithubAccount) -> Principal {
        let is_org = account.kind == "Organization";
        let kind = if is_org { ORG_KIND } else { USER_KIND };
        let id = format!("github_{}://{}", kind, account.id);
        let base = if is_org {
            Principal::group(id, ProviderKind::Github.name())
        } else {
            Principal::user(id, ProviderKind::Github.name())
        };
        Principal {
            display_name: account.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| account.login.clone()),
            login_name: account.login.clone(),
            profile_picture: account.avatar_url.clone(),
            profile_url: account.html_url.clone(),
            ..base
        }
    }

    fn org_principal(org: &GithubAccount) -> Principal {
        Principal {
            display_name: org.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| org.login.clone()),
            login_name: org.login.clone(),
            profile_picture: org.avatar_url.clone(),
            member_of: true,
            ..Principal::group(format!("github_{}://{}", ORG_KIND, org.id), ProviderKind::Github.name())
        }
    }

    fn team_principal(team: &GithubTeam) -> Principal {
        Principal {
            display_name: team.name.clone(),
            login_name: team.slug.clone(),
            profile_picture: team.organization.avatar_url.clone(),
            member_of: true,
            ..Principal::group(format!("github_{}://{}", TEAM_KIND, team.id), ProviderKind::Github.name())
        }
    }
}

#[async_trait]
impl AuthProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    async fn authenticate(&self, config: &AuthConfig, input: &LoginInput) -> Result<AuthResult> {
        let github = Self::github_config(config)?;
        if input.code.is_empty() {
            return Err(AuthError::BadRequest("code is required".to_string()));
        }

        let access_token = self.client.access_token(github, &input.code).await?;
        let user = self.client.user(github, &access_token).await?;
        let orgs = self.client.orgs(github, &access_token).await?;
        let teams = self.client.teams(github, &access_token).await?;
        debug!(login = %user.login, orgs = orgs.len(), teams = teams.len(), "github identity resolved");

        let mut user_principal = Self::account_principal(&user);
        user_principal.me = true;
        let groups = orgs
            .iter()
            .map(Self::org_principal)
            .chain(teams.iter().map(Self::team_principal))
            .collect();

        let mut provider_info = BTreeMap::new();
        provider_info.insert(ACCESS_TOKEN_INFO.to_string(), access_token);
        Ok(AuthResult {
            user_principal,
            groups,
            provider_info,
        })
    }

    async fn search(
        &self,
        config: &AuthConfig,
        query: &str,
        principal_type: Option<PrincipalType>,
        token: &Token,
    ) -> Result<Vec<Principal>> {
        let github = Self::github_config(config)?;
        let access_token = Self::access_token(token)?;
        let accounts = self
            .client
            .search(github, access_token, query, principal_type)
            .await?;
        Ok(accounts.iter().map(Self::account_principal).collect())
    }

    async fn get_principal(&self, config: &AuthConfig, id: &str, token: &Token) -> Result<Principal> {
        let github = Self::github_config(config)?;
        let access_token = Self::access_token(token)?;
        let (_, kind, external) = parse_principal_id(id)
            .ok_or_else(|| AuthError::BadRequest(format!("invalid id {}", id)))?;
        match kind {
            USER_KIND | ORG_KIND => {
                let account = self.client.account(github, access_token, external).await?;
                Ok(Self::account_principal(&account))
            }
            TEAM_KIND => {
                let team = self.client.team(github, access_token, external).await?;
                Ok(Self::team_principal(&team))
            }
            other => Err(AuthError::NotFound(format!("unknown principal kind {}", other))),
        }
    }

    fn transform_config(&self, config: &AuthConfig, _server_url: &str) -> Value {
        let mut value = public_config(config);
        if let (Ok(github), Some(fields)) = (Self::github_config(config), value.as_object_mut()) {
            let redirect = format!(
                "{}/login/oauth/authorize?client_id={}",
                web_base(github),
                github.client_id
            );
            fields.insert("redirectUrl".to_string(), Value::String(redirect));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn enterprise_hosts() {
        let mut config = GithubConfig::default();
        assert_eq!(api_base(&config), "https://api.github.com");
        config.hostname = "git.corp".into();
        config.tls = true;
        assert_eq!(api_base(&config), "https://git.corp/api/v3");
        assert_eq!(web_base(&config), "https://git.corp");
    }

    #[test]
    fn link_header_pagination() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://api.github.com/user/orgs?page=2>; rel="next", <https://api.github.com/user/orgs?page=5>; rel="last""#,
            ),
        );
        assert_eq!(
            next_page(&headers).as_deref(),
            Some("https://api.github.com/user/orgs?page=2")
        );
        assert_eq!(next_page(&HeaderMap::new()), None);
    }

    #[test]
    fn principals_prefer_display_name() {
        let account = GithubAccount {
            id: 42,
            login: "eve".into(),
            name: Some("Eve".into()),
            ..Default::default()
        };
        let p = GithubProvider::account_principal(&account);
        assert_eq!(p.id, "github_user://42");
        assert_eq!(p.display_name, "Eve");

        let org = GithubAccount {
            id: 99,
            login: "acme".into(),
            kind: "Organization".into(),
            ..Default::default()
        };
        let p = GithubProvider::account_principal(&org);
        assert_eq!(p.id, "github_org://99");
        assert_eq!(p.principal_type, PrincipalType::Group);
        assert_eq!(p.display_name, "acme");
    }
}
