// Identity provider contract and the login pipeline

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::tokens::provider_of;
use super::{AuthError, Result, TokenManager, UserManager};
use crate::models::auth::{AuthConfig, Principal, PrincipalType, ProviderKind, Token};
use crate::settings::{Settings, SERVER_URL};
use crate::store::SharedStore;

pub mod github;
pub mod ldap;
pub mod local;
pub mod saml;

pub use github::{GithubClient, GithubProvider, HttpGithubClient};
pub use ldap::{Ldap3Connector, LdapConnector, LdapProvider};
pub use local::LocalProvider;
pub use saml::SamlProvider;

/// Config fields never shown outside the store.
const SECRET_FIELDS: &[&str] = &["clientSecret", "serviceAccountPassword", "spKey"];

/// Credentials posted to a provider's `login` action.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInput {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// OAuth authorization code.
    #[serde(default)]
    pub code: String,
    /// Session lifetime in milliseconds; the server default when absent.
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub response_type: String,
}

/// What a provider learned about a login.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthResult {
    pub user_principal: Principal,
    pub groups: Vec<Principal>,
    pub provider_info: BTreeMap<String, String>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    async fn authenticate(&self, config: &AuthConfig, input: &LoginInput) -> Result<AuthResult>;

    async fn search(
        &self,
        config: &AuthConfig,
        query: &str,
        principal_type: Option<PrincipalType>,
        token: &Token,
    ) -> Result<Vec<Principal>>;

    async fn get_principal(&self, config: &AuthConfig, id: &str, token: &Token) -> Result<Principal>;

    /// Public view of the stored config: secrets removed, redirect URLs added.
    fn transform_config(&self, config: &AuthConfig, _server_url: &str) -> Value {
        public_config(config)
    }
}

/// Serializes a config with its secret fields stripped.
pub fn public_config(config: &AuthConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    if let Some(fields) = value.as_object_mut() {
        for secret in SECRET_FIELDS {
            fields.remove(*secret);
        }
        fields.insert("id".to_string(), Value::String(config.metadata.name.clone()));
    }
    value
}

/// `(provider, kind, external id)` of `<provider>_<kind>://<id>`.
pub fn parse_principal_id(id: &str) -> Option<(&str, &str, &str)> {
    let (scheme, external) = id.split_once("://")?;
    let (provider, kind) = scheme.split_once('_')?;
    Some((provider, kind, external))
}

/// Dispatch table over the configured providers plus the login pipeline.
pub struct Providers {
    providers: BTreeMap<ProviderKind, Arc<dyn AuthProvider>>,
    saml: BTreeMap<ProviderKind, Arc<SamlProvider>>,
    configs: SharedStore<AuthConfig>,
    users: UserManager,
    tokens: TokenManager,
    settings: Settings,
    config_locks: BTreeMap<ProviderKind, Mutex<()>>,
    session_ttl_millis: i64,
}

impl Providers {
    pub fn new(
        configs: SharedStore<AuthConfig>,
        users: UserManager,
        tokens: TokenManager,
        settings: Settings,
        session_ttl_millis: i64,
    ) -> Self {
        let config_locks = ProviderKind::ALL
            .into_iter()
            .map(|k| (k, Mutex::new(())))
            .collect();
        Self {
            providers: BTreeMap::new(),
            saml: BTreeMap::new(),
            configs,
            users,
            tokens,
            settings,
            config_locks,
            session_ttl_millis,
        }
    }

    pub fn with(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with_saml(mut self, provider: Arc<SamlProvider>) -> Self {
        self.saml.insert(provider.kind(), provider.clone());
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn users(&self) -> &UserManager {
        &self.users
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn saml(&self, kind: ProviderKind) -> Option<Arc<SamlProvider>> {
        self.saml.get(&kind).cloned()
    }

    fn provider(&self, name: &str) -> Result<(ProviderKind, Arc<dyn AuthProvider>)> {
        let kind = ProviderKind::from_name(name)
            .ok_or_else(|| AuthError::NotFound(format!("no such provider {}", name)))?;
        let provider = self
            .providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| AuthError::NotFound(format!("provider {} is not supported", kind)))?;
        Ok((kind, provider))
    }

    pub async fn config(&self, kind: ProviderKind) -> Result<AuthConfig> {
        self.configs.get("", kind.name()).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::NotFound(format!("auth config {} not found", kind))
            } else {
                e.into()
            }
        })
    }

    /// Authenticates `input` against provider `name` and mints a session token.
    pub async fn login(&self, name: &str, input: &LoginInput) -> Result<Token> {
        let (kind, provider) = self.provider(name)?;
        let config = self.config(kind).await?;
        if !config.enabled {
            return Err(AuthError::Unauthorized(format!("auth provider {} is disabled", kind)));
        }

        let result = provider.authenticate(&config, input).await?;
        self.complete_login(&config, result, input.ttl, &input.description)
            .await
    }

    /// Turns an authenticated identity into a session: ensures the user,
    /// enforces the access mode, and mints the token.
    pub async fn complete_login(
        &self,
        config: &AuthConfig,
        result: AuthResult,
        ttl: Option<i64>,
        description: &str,
    ) -> Result<Token> {
        let principal = result.user_principal;
        let display_name = if principal.display_name.is_empty() {
            principal.login_name.clone()
        } else {
            principal.display_name.clone()
        };

        let user = self.users.ensure_user(&principal.id, &display_name).await?;
        if !user.is_enabled() {
            return Err(AuthError::Unauthorized("user is not enabled".to_string()));
        }

        let allowed = self
            .users
            .check_access(
                config.access_mode,
                &config.allowed_principal_ids,
                &user,
                &principal,
                &result.groups,
            )
            .await?;
        if !allowed {
            return Err(AuthError::Forbidden("unauthorized".to_string()));
        }

        let token = self
            .tokens
            .new_login_token(
                user.name(),
                principal,
                result.groups,
                result.provider_info,
                ttl.unwrap_or(self.session_ttl_millis),
                description,
            )
            .await?;
        info!(user = %user.name(), provider = %config.metadata.name, "login succeeded");
        Ok(token)
    }

    /// Stores a provider config. Writes for one provider are serialized.
    pub async fn update_config(&self, mut config: AuthConfig) -> Result<AuthConfig> {
        let kind = config
            .kind()
            .ok_or_else(|| AuthError::BadRequest(format!("no such provider {}", config.metadata.name)))?;
        let _guard = match self.config_locks.get(&kind) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        if let Some(existing) = self.configs.get_opt("", kind.name()).await? {
            config.metadata.resource_version = existing.metadata.resource_version;
            config.metadata.uid = existing.metadata.uid;
            config.metadata.creation_timestamp = existing.metadata.creation_timestamp;
            return Ok(self.configs.update(config).await?);
        }
        Ok(self.configs.create(config).await?)
    }

    /// Every stored config in its public form.
    pub async fn public_configs(&self) -> Result<Vec<Value>> {
        let server_url = self.settings.get(SERVER_URL);
        let configs = self.configs.list(None).await?;
        Ok(configs
            .iter()
            .map(|config| {
                match config.kind().and_then(|k| self.providers.get(&k)) {
                    Some(provider) => provider.transform_config(config, &server_url),
                    None => public_config(config),
                }
            })
            .collect())
    }

    /// Searches the local provider and every enabled external one.
    pub async fn search(&self, token: &Token, query: &str, principal_type: Option<PrincipalType>) -> Result<Vec<Principal>> {
        let mut principals = Vec::new();
        for (kind, provider) in &self.providers {
            let config = match self.configs.get_opt("", kind.name()).await? {
                Some(config) if config.enabled || *kind == ProviderKind::Local => config,
                _ => continue,
            };
            match provider.search(&config, query, principal_type, token).await {
                Ok(found) => principals.extend(found),
                Err(e) => warn!("error searching {} principals: {}", kind, e),
            }
        }
        Ok(principals)
    }

    /// Resolves a principal id through the provider named in its prefix.
    pub async fn get_principal(&self, token: &Token, id: &str) -> Result<Principal> {
        if !id.contains("://") {
            return Err(AuthError::BadRequest(format!("invalid id {}", id)));
        }
        let (kind, provider) = self.provider(provider_of(id))?;
        let config = self.config(kind).await?;
        let mut principal = provider.get_principal(&config, id, token).await?;
        principal.me = principal.id == token.user_principal.id;
        Ok(principal)
    }

    /// Authenticates against a candidate config before enabling it, binding the
    /// resulting principal to the calling user.
    pub async fn test_and_enable(&self, mut config: AuthConfig, input: &LoginInput, current: &Token) -> Result<AuthConfig> {
        let kind = config
            .kind()
            .ok_or_else(|| AuthError::BadRequest(format!("no such provider {}", config.metadata.name)))?;
        let (_, provider) = self.provider(kind.name())?;

        let result = provider.authenticate(&config, input).await?;
        let user = self
            .users
            .set_principal_on_current_user(&current.user_id, &result.user_principal)
            .await?;

        config.enabled = true;
        if !config.allowed_principal_ids.contains(&result.user_principal.id) {
            config.allowed_principal_ids.push(result.user_principal.id.clone());
        }
        let config = self.update_config(config).await?;

        // Keep the calling session valid under the new provider.
        let mut token = current.clone();
        token.user_principal = result.user_principal;
        token.group_principals = result.groups;
        token.provider_info = result.provider_info;
        token.auth_provider = kind.name().to_string();
        if let Err(e) = self.tokens.update_login_token(token).await {
            warn!("failed to update token of {}: {}", user.name(), e);
        }
        info!(provider = %kind, user = %user.name(), "auth provider enabled");
        Ok(config)
    }

    /// Turns a provider off; existing sessions stay valid until they expire.
    pub async fn disable(&self, kind: ProviderKind) -> Result<AuthConfig> {
        let mut config = self.config(kind).await?;
        config.enabled = false;
        self.update_config(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::github::{GithubAccount, GithubTeam};
    use super::*;
    use crate::models::auth::{AccessMode, GithubConfig, ProviderConfig};
    use crate::store::Stores;

    struct FakeGithub;

    #[async_trait]
    impl GithubClient for FakeGithub {
        async fn access_token(&self, _config: &GithubConfig, code: &str) -> Result<String> {
            assert_eq!(code, "Z");
            Ok("gho_test".to_string())
        }

        async fn user(&self, _config: &GithubConfig, token: &str) -> Result<GithubAccount> {
            assert_eq!(token, "gho_test");
            Ok(GithubAccount {
                id: 42,
                login: "eve".into(),
                ..Default::default()
            })
        }

        async fn orgs(&self, _config: &GithubConfig, _token: &str) -> Result<Vec<GithubAccount>> {
            Ok(vec![GithubAccount {
                id: 99,
                login: "acme".into(),
                ..Default::default()
            }])
        }

        async fn teams(&self, _config: &GithubConfig, _token: &str) -> Result<Vec<GithubTeam>> {
            Ok(Vec::new())
        }

        async fn search(
            &self,
            _config: &GithubConfig,
            _token: &str,
            _query: &str,
            _principal_type: Option<PrincipalType>,
        ) -> Result<Vec<GithubAccount>> {
            Ok(Vec::new())
        }

        async fn account(&self, _config: &GithubConfig, _token: &str, id: &str) -> Result<GithubAccount> {
            Err(AuthError::NotFound(id.to_string()))
        }

        async fn team(&self, _config: &GithubConfig, _token: &str, id: &str) -> Result<GithubTeam> {
            Err(AuthError::NotFound(id.to_string()))
        }
    }

    fn providers(stores: &Stores) -> Providers {
        let users = UserManager::new(stores);
        let tokens = TokenManager::new(
            stores.tokens.clone(),
            stores.users.clone(),
            stores.user_attributes.clone(),
        );
        Providers::new(
            stores.auth_configs.clone(),
            users,
            tokens,
            Settings::new(stores.settings.clone()),
            0,
        )
        .with(Arc::new(GithubProvider::new(Arc::new(FakeGithub))))
        .with(Arc::new(LocalProvider::new(stores.users.clone())))
    }

    fn github_config(allowed: &str) -> AuthConfig {
        let mut config = AuthConfig::new(
            ProviderKind::Github,
            ProviderConfig::GithubConfig(GithubConfig {
                client_id: "X".into(),
                client_secret: "Y".into(),
                tls: true,
                ..Default::default()
            }),
        );
        config.enabled = true;
        config.access_mode = AccessMode::Required;
        config.allowed_principal_ids = vec![allowed.to_string()];
        config
    }

    #[tokio::test]
    async fn github_login_with_required_access() {
        let stores = Stores::memory();
        let providers = providers(&stores);
        stores.auth_configs.create(github_config("github_user://42")).await.unwrap();

        let input = LoginInput {
            code: "Z".into(),
            ..Default::default()
        };
        let token = providers.login("github", &input).await.unwrap();
        assert_eq!(token.user_principal.id, "github_user://42");
        assert_eq!(token.auth_provider, "github");
        assert_eq!(token.provider_info.get("access_token").map(String::as_str), Some("gho_test"));

        let groups = providers.tokens().groups_for_token(&token).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "github_org://99");

        let stored = stores.tokens.get("", token.name()).await.unwrap();
        assert_eq!(stored.user_id, token.user_id);
        let user = stores.users.get("", &token.user_id).await.unwrap();
        assert_eq!(user.principal_ids, vec!["github_user://42"]);
    }

    #[tokio::test]
    async fn login_denied_outside_allowed_principals() {
        let stores = Stores::memory();
        let providers = providers(&stores);
        stores.auth_configs.create(github_config("github_user://7")).await.unwrap();

        let input = LoginInput {
            code: "Z".into(),
            ..Default::default()
        };
        let err = providers.login("github", &input).await.unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
        assert!(stores.tokens.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_and_unknown_providers() {
        let stores = Stores::memory();
        let providers = providers(&stores);
        let mut config = github_config("github_user://42");
        config.enabled = false;
        stores.auth_configs.create(config).await.unwrap();

        let input = LoginInput::default();
        assert!(matches!(
            providers.login("github", &input).await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(providers.login("nosuch", &input).await.unwrap_err().is_not_found());
        assert!(providers.login("azureAD", &input).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn public_configs_hide_secrets() {
        let stores = Stores::memory();
        let providers = providers(&stores);
        providers.update_config(github_config("github_user://42")).await.unwrap();

        let configs = providers.public_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].get("clientSecret").is_none());
        assert_eq!(configs[0]["clientId"], "X");
        assert!(configs[0]["redirectUrl"]
            .as_str()
            .unwrap()
            .starts_with("https://github.com/login/oauth/authorize?client_id=X"));
    }

    #[test]
    fn principal_ids_parse() {
        assert_eq!(
            parse_principal_id("github_team://7"),
            Some(("github", "team", "7"))
        );
        assert_eq!(
            parse_principal_id("openldap_user://uid=a,dc=x"),
            Some(("openldap", "user", "uid=a,dc=x"))
        );
        assert_eq!(parse_principal_id("local://u-1"), None);
    }
}
