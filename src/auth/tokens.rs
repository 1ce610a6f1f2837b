// Session token lifecycle

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{generate_key, generate_name, AuthError, Result, IMPERSONATE_GROUP_HEADER, IMPERSONATE_USER_HEADER};
use crate::models::auth::{Principal, Token, User, UserAttribute, USER_ID_LABEL};
use crate::models::ObjectMeta;
use crate::store::{Backoff, SharedStore};

pub const TOKEN_KEY_INDEX: &str = "authn.management.cattle.io/token-key-index";

/// Splits `<name>:<key>`. Anything other than exactly two parts yields an empty key.
pub fn split_token_parts(value: &str) -> (&str, &str) {
    let mut parts = value.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(key), None) => (name, key),
        (Some(name), _, _) => (name, ""),
        _ => ("", ""),
    }
}

/// Provider name encoded in a principal id: `github_user://42` -> `github`.
pub fn provider_of(principal_id: &str) -> &str {
    let scheme = principal_id.split("://").next().unwrap_or(principal_id);
    scheme.split('_').next().unwrap_or(scheme)
}

/// Headers asserting the identity of `user_id` to a downstream API server.
pub fn impersonation_headers(user_id: &str, groups: &[Principal]) -> Vec<(&'static str, String)> {
    let mut headers = vec![(IMPERSONATE_USER_HEADER, user_id.to_string())];
    headers.extend(
        groups
            .iter()
            .map(|g| (IMPERSONATE_GROUP_HEADER, g.id.clone())),
    );
    headers
}

#[derive(Clone)]
pub struct TokenManager {
    tokens: SharedStore<Token>,
    users: SharedStore<User>,
    user_attributes: SharedStore<UserAttribute>,
}

impl TokenManager {
    pub fn new(
        tokens: SharedStore<Token>,
        users: SharedStore<User>,
        user_attributes: SharedStore<UserAttribute>,
    ) -> Self {
        tokens.add_index(TOKEN_KEY_INDEX, Arc::new(|t: &Token| vec![t.token.clone()]));
        Self {
            tokens,
            users,
            user_attributes,
        }
    }

    async fn lookup(&self, value: &str) -> Result<Token> {
        let (name, key) = split_token_parts(value);

        let indexed = self.tokens.by_index(TOKEN_KEY_INDEX, key).await?;
        let stored = match indexed.into_iter().next() {
            Some(token) => token,
            None => self.tokens.get("", name).await.map_err(|e| {
                if e.is_not_found() {
                    AuthError::NotFound(format!("failed to retrieve auth token {}", name))
                } else {
                    e.into()
                }
            })?,
        };

        if stored.token != key || stored.name() != name {
            return Err(AuthError::InvalidToken);
        }
        Ok(stored)
    }

    /// Resolves a presented token, failing on expiry.
    pub async fn validate(&self, value: &str) -> Result<Token> {
        let (token, expired) = self.validate_allow_expired(value).await?;
        if expired {
            return Err(AuthError::Expired);
        }
        Ok(token)
    }

    /// Resolves a presented token and reports expiry alongside the record.
    pub async fn validate_allow_expired(&self, value: &str) -> Result<(Token, bool)> {
        let token = self.lookup(value).await?;
        let expired = token.is_expired();
        Ok((token, expired))
    }

    /// Mints a session token after a successful login and refreshes the
    /// user's group cache for the provider.
    pub async fn new_login_token(
        &self,
        user_id: &str,
        user_principal: Principal,
        groups: Vec<Principal>,
        provider_info: BTreeMap<String, String>,
        ttl_millis: i64,
        description: &str,
    ) -> Result<Token> {
        let provider = provider_of(&user_principal.id).to_string();

        let backoff = Backoff::conflict();
        let mut attempt = 0;
        loop {
            match self
                .user_attribute_create_or_update(user_id, &provider, &groups)
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    warn!("Problem creating or updating userAttribute for {}: {}", user_id, e);
                    attempt += 1;
                    if attempt >= backoff.steps {
                        return Err(AuthError::Internal("Unable to create userAttribute".to_string()));
                    }
                    tokio::time::sleep(backoff.delay(attempt - 1)).await;
                }
            }
        }

        let token = Token {
            user_principal,
            is_derived: false,
            ttl_millis,
            user_id: user_id.to_string(),
            auth_provider: provider,
            provider_info,
            description: description.to_string(),
            ..Default::default()
        };
        self.create_token(token).await
    }

    /// A non-session token carrying the identity of `current`.
    pub async fn create_derived_token(&self, current: &Token, ttl_millis: i64, description: &str) -> Result<Token> {
        debug!(user = %current.user_id, "creating derived token");
        let token = Token {
            user_principal: current.user_principal.clone(),
            is_derived: true,
            ttl_millis,
            user_id: current.user_id.clone(),
            auth_provider: current.auth_provider.clone(),
            provider_info: current.provider_info.clone(),
            description: description.to_string(),
            cluster_name: current.cluster_name.clone(),
            ..Default::default()
        };
        self.create_token(token).await
    }

    async fn create_token(&self, mut token: Token) -> Result<Token> {
        token.token = generate_key();
        token.metadata = ObjectMeta::named(generate_name("token-"))
            .with_label(USER_ID_LABEL, token.user_id.clone());
        Ok(self.tokens.create(token).await?)
    }

    pub async fn update_login_token(&self, token: Token) -> Result<Token> {
        Ok(self.tokens.update(token).await?)
    }

    /// Every token of the caller's user, expired ones flagged.
    pub async fn list_tokens(&self, current: &Token) -> Result<Vec<Token>> {
        let mut selector = BTreeMap::new();
        selector.insert(USER_ID_LABEL.to_string(), current.user_id.clone());
        let mut tokens = self.tokens.list_labeled(None, &selector).await?;
        for token in tokens.iter_mut() {
            if token.is_expired() {
                token.expired = true;
            }
        }
        Ok(tokens)
    }

    /// A token of the caller's user by name; other users' tokens are not found.
    pub async fn get_token_by_id(&self, current: &Token, id: &str) -> Result<Token> {
        let mut token = self.tokens.get("", id).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::NotFound(format!("{} not found", id))
            } else {
                e.into()
            }
        })?;
        if token.user_id != current.user_id {
            return Err(AuthError::NotFound(format!("{} not found", id)));
        }
        if token.is_expired() {
            token.expired = true;
        }
        Ok(token)
    }

    /// Deletes the token presented as `value`, expired or not. Unknown tokens are a no-op.
    pub async fn delete_token(&self, value: &str) -> Result<()> {
        match self.validate_allow_expired(value).await {
            Ok((token, _)) => self.delete_token_by_name(token.name()).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(AuthError::Unauthorized(e.to_string())),
        }
    }

    pub async fn delete_token_by_name(&self, name: &str) -> Result<()> {
        self.tokens.delete_if_exists("", name).await?;
        debug!(token = name, "deleted token");
        Ok(())
    }

    /// Deletes another token of the caller's user.
    pub async fn remove_token(&self, current: &Token, id: &str) -> Result<()> {
        let target = self.get_token_by_id(current, id).await?;
        if current.name() == target.name() && !current.is_derived {
            return Err(AuthError::BadRequest(
                "Cannot delete token for current session. Use logout instead".to_string(),
            ));
        }
        self.delete_token_by_name(target.name()).await
    }

    pub async fn logout(&self, value: &str) -> Result<()> {
        self.delete_token(value).await
    }

    async fn user_attribute_create_or_update(&self, user_id: &str, provider: &str, groups: &[Principal]) -> Result<()> {
        let existing = self.user_attributes.get_opt("", user_id).await?;
        let mut attribs = match existing {
            Some(attribs) => attribs,
            None => {
                // Owned by the user; it must exist.
                self.users.get("", user_id).await?;
                let mut group_principals = BTreeMap::new();
                group_principals.insert(provider.to_string(), groups.to_vec());
                let attribs = UserAttribute {
                    metadata: ObjectMeta::named(user_id),
                    group_principals,
                    last_refresh: Some(chrono::Utc::now()),
                    needs_refresh: false,
                };
                match self.user_attributes.create(attribs).await {
                    Ok(_) => return Ok(()),
                    Err(e) if e.is_already_exists() => self.user_attributes.get("", user_id).await?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if attribs.group_principals.get(provider).map(Vec::as_slice) != Some(groups) {
            attribs
                .group_principals
                .insert(provider.to_string(), groups.to_vec());
            attribs.last_refresh = Some(chrono::Utc::now());
            self.user_attributes.update(attribs).await?;
            info!(user = user_id, provider, "updated group cache");
        }
        Ok(())
    }

    /// Groups of the token's user for the token's provider. The user
    /// attribute cache wins over the groups stored on the token.
    pub async fn groups_for_token(&self, token: &Token) -> Vec<Principal> {
        let attribs = match self.user_attributes.get_opt("", &token.user_id).await {
            Ok(attribs) => attribs,
            Err(e) => {
                warn!("Problem getting userAttribute while getting groups for {}: {}", token.user_id, e);
                None
            }
        };
        match attribs.and_then(|a| a.group_principals.get(&token.auth_provider).cloned()) {
            Some(groups) => groups,
            None => token.group_principals.clone(),
        }
    }

    pub async fn is_member_of(&self, token: &Token, group_id: &str) -> bool {
        let attribs = match self.user_attributes.get_opt("", &token.user_id).await {
            Ok(attribs) => attribs,
            Err(e) => {
                warn!(
                    "Problem getting userAttribute while determining group membership for {} in {}: {}",
                    token.user_id, group_id, e
                );
                None
            }
        };

        let mut hit_provider = false;
        if let Some(attribs) = &attribs {
            for (provider, groups) in &attribs.group_principals {
                if !groups.is_empty() && *provider == token.auth_provider {
                    hit_provider = true;
                }
                if groups.iter().any(|g| g.id == group_id) {
                    return true;
                }
            }
        }
        !hit_provider && token.group_principals.iter().any(|g| g.id == group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn manager() -> (TokenManager, SharedStore<Token>, SharedStore<User>) {
        let tokens: SharedStore<Token> = Arc::new(MemoryStore::new());
        let users: SharedStore<User> = Arc::new(MemoryStore::new());
        let attribs: SharedStore<UserAttribute> = Arc::new(MemoryStore::new());
        (
            TokenManager::new(tokens.clone(), users.clone(), attribs),
            tokens,
            users,
        )
    }

    async fn alice(users: &SharedStore<User>) -> User {
        users
            .create(User {
                metadata: ObjectMeta::named("u-alice"),
                username: "alice".into(),
                principal_ids: vec!["local://alice".into()],
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn split_is_deterministic() {
        assert_eq!(split_token_parts("abcd1234:key"), ("abcd1234", "key"));
        assert_eq!(split_token_parts("abcd1234"), ("abcd1234", ""));
        assert_eq!(split_token_parts("a:b:c"), ("a", ""));
        assert_eq!(provider_of("github_user://42"), "github");
        assert_eq!(provider_of("local://u-abc"), "local");
        assert_eq!(provider_of("activedirectory_group://cn=x"), "activedirectory");
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let (mgr, tokens, users) = manager();
        alice(&users).await;

        let minted = mgr
            .new_login_token(
                "u-alice",
                Principal::user("local://alice", "local"),
                vec![],
                BTreeMap::new(),
                0,
                "",
            )
            .await
            .unwrap();
        let value = format!("{}:{}", minted.name(), minted.token);
        let valid = mgr.validate(&value).await.unwrap();
        assert_eq!(valid.user_id, "u-alice");
        assert!(!valid.is_expired());

        // A token stored under a fixed name resolves the same way.
        tokens
            .create(Token {
                metadata: ObjectMeta::named("abcd1234"),
                token: "s3cr3t".into(),
                user_id: "u-alice".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mgr.validate("abcd1234:s3cr3t").await.unwrap().user_id, "u-alice");
        assert!(matches!(
            mgr.validate("abcd1234:wrong").await,
            Err(AuthError::InvalidToken)
        ));
        assert!(mgr.validate("missing:nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn expired_token_is_returned_with_flag() {
        let (mgr, tokens, _) = manager();
        let mut meta = ObjectMeta::named("token-old");
        meta.creation_timestamp = chrono::Utc::now() - Duration::hours(2);
        tokens
            .create(Token {
                metadata: meta,
                token: "k".into(),
                user_id: "u-1".into(),
                ttl_millis: 1000,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(matches!(mgr.validate("token-old:k").await, Err(AuthError::Expired)));
        let (token, expired) = mgr.validate_allow_expired("token-old:k").await.unwrap();
        assert!(expired);
        assert_eq!(token.name(), "token-old");

        mgr.delete_token("token-old:k").await.unwrap();
        assert!(tokens.get_opt("", "token-old").await.unwrap().is_none());
        // Deleting again is a no-op.
        mgr.delete_token("token-old:k").await.unwrap();
    }

    #[tokio::test]
    async fn current_session_cannot_be_removed() {
        let (mgr, _, users) = manager();
        alice(&users).await;
        let session = mgr
            .new_login_token("u-alice", Principal::user("local://alice", "local"), vec![], BTreeMap::new(), 0, "")
            .await
            .unwrap();
        let derived = mgr.create_derived_token(&session, 0, "cli").await.unwrap();
        assert!(derived.is_derived);

        let err = mgr.remove_token(&session, session.name()).await.unwrap_err();
        assert!(matches!(err, AuthError::BadRequest(_)));
        mgr.remove_token(&session, derived.name()).await.unwrap();
        assert_eq!(mgr.list_tokens(&session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_cache_overrides_token_groups() {
        let (mgr, _, users) = manager();
        alice(&users).await;
        let group = Principal::group("github_org://99", "github");
        let mut token = mgr
            .new_login_token(
                "u-alice",
                Principal::user("github_user://42", "github"),
                vec![group.clone()],
                BTreeMap::new(),
                0,
                "",
            )
            .await
            .unwrap();
        token.group_principals = vec![Principal::group("github_org://1", "github")];

        let groups = mgr.groups_for_token(&token).await;
        assert_eq!(groups, vec![group]);
        assert!(mgr.is_member_of(&token, "github_org://99").await);
        assert!(!mgr.is_member_of(&token, "github_org://1").await);

        let headers = impersonation_headers(&token.user_id, &groups);
        assert_eq!(headers[0], (IMPERSONATE_USER_HEADER, "u-alice".to_string()));
        assert_eq!(headers[1], (IMPERSONATE_GROUP_HEADER, "github_org://99".to_string()));
    }
}
