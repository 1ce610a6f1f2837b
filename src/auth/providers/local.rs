use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{AuthProvider, AuthResult, LoginInput};
use crate::auth::{verify_password, AuthError, Result};
use crate::models::auth::{AuthConfig, Principal, PrincipalType, ProviderKind, Token, User};
use crate::store::SharedStore;

const PREFIX: &str = "local://";

/// Username/password users kept in the user store.
pub struct LocalProvider {
    users: SharedStore<User>,
}

impl LocalProvider {
    pub fn new(users: SharedStore<User>) -> Self {
        Self { users }
    }

    fn to_principal(user: &User) -> Principal {
        Principal {
            display_name: user.display_name.clone(),
            login_name: user.username.clone(),
            ..Principal::user(format!("{}{}", PREFIX, user.name()), ProviderKind::Local.name())
        }
    }
}

#[async_trait]
impl AuthProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn authenticate(&self, _config: &AuthConfig, input: &LoginInput) -> Result<AuthResult> {
        let invalid = || AuthError::Unauthorized("authentication failed".to_string());
        if input.username.is_empty() || input.password.is_empty() {
            return Err(invalid());
        }

        let users = self.users.list(None).await?;
        let user = users
            .iter()
            .find(|u| u.username == input.username)
            .ok_or_else(invalid)?;
        if user.password.is_empty() {
            return Err(invalid());
        }

        let matches = verify_password(&input.password, &user.password)
            .map_err(|e| AuthError::Internal(format!("failed to verify password: {}", e)))?;
        if !matches {
            return Err(invalid());
        }

        Ok(AuthResult {
            user_principal: Principal {
                me: true,
                ..Self::to_principal(user)
            },
            groups: Vec::new(),
            provider_info: BTreeMap::new(),
        })
    }

    async fn search(
        &self,
        _config: &AuthConfig,
        query: &str,
        principal_type: Option<PrincipalType>,
        _token: &Token,
    ) -> Result<Vec<Principal>> {
        if principal_type == Some(PrincipalType::Group) {
            return Ok(Vec::new());
        }
        let query = query.to_lowercase();
        let users = self.users.list(None).await?;
        Ok(users
            .iter()
            .filter(|u| {
                u.username.to_lowercase().contains(&query)
                    || u.display_name.to_lowercase().contains(&query)
            })
            .map(Self::to_principal)
            .collect())
    }

    async fn get_principal(&self, _config: &AuthConfig, id: &str, _token: &Token) -> Result<Principal> {
        let name = id
            .strip_prefix(PREFIX)
            .ok_or_else(|| AuthError::NotFound(format!("principal {} not found", id)))?;
        match self.users.get_opt("", name).await? {
            Some(user) => Ok(Self::to_principal(&user)),
            None => Err(AuthError::NotFound(format!("principal {} not found", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::models::auth::ProviderConfig;
    use crate::models::ObjectMeta;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    async fn provider() -> LocalProvider {
        let users: SharedStore<User> = Arc::new(MemoryStore::new());
        users
            .create(User {
                metadata: ObjectMeta::named("u-alice"),
                username: "alice".into(),
                display_name: "Alice Liddell".into(),
                password: hash_password("wonderland").unwrap(),
                principal_ids: vec!["local://u-alice".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        LocalProvider::new(users)
    }

    fn config() -> AuthConfig {
        AuthConfig::new(ProviderKind::Local, ProviderConfig::LocalConfig)
    }

    #[tokio::test]
    async fn password_login() {
        let p = provider().await;
        let ok = p
            .authenticate(
                &config(),
                &LoginInput {
                    username: "alice".into(),
                    password: "wonderland".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ok.user_principal.id, "local://u-alice");
        assert!(ok.groups.is_empty());

        let bad = p
            .authenticate(
                &config(),
                &LoginInput {
                    username: "alice".into(),
                    password: "nope".into(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad, Err(AuthError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn search_by_substring() {
        let p = provider().await;
        let token = Token::default();
        let found = p.search(&config(), "LIDD", None, &token).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(p
            .search(&config(), "alice", Some(PrincipalType::Group), &token)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            p.get_principal(&config(), "local://u-alice", &token).await.unwrap().login_name,
            "alice"
        );
    }
}
