// Canonical users for provider principals

use data_encoding::{BASE32HEX_NOPAD, BASE32_NOPAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::tokens::provider_of;
use super::{generate_key, generate_name, AuthError, Result};
use crate::models::auth::{
    AccessMode, GlobalRoleBinding, Principal, Token, User, CREATOR_ROLE_BINDINGS_ANNOTATION,
    HASHED_PRINCIPAL_VALUE, TOKEN_KIND_LABEL, USER_ID_LABEL,
};
use crate::models::rbac::{ClusterRoleTemplateBinding, GlobalRole, PolicyRule, ProjectRoleTemplateBinding};
use crate::models::ObjectMeta;
use crate::store::{retry_on_conflict, Backoff, SharedStore, StoreError, Stores};

pub const USER_BY_PRINCIPAL_INDEX: &str = "auth.management.cattle.io/userByPrincipal";
pub const CRTB_BY_PRINCIPAL_AND_USER_INDEX: &str = "auth.management.cattle.io/crtbByPrincipalAndUser";
pub const PRTB_BY_PRINCIPAL_AND_USER_INDEX: &str = "auth.management.cattle.io/prtbByPrincipalAndUser";
pub const GRB_BY_USER_INDEX: &str = "auth.management.cattle.io/grbByUser";

pub const INITIAL_ROLES_POPULATED: &str = "InitialRolesPopulated";
const DEFAULT_USER_ROLE: &str = "user";
const MAX_LABEL_KEY_LEN: usize = 63;

/// `u-` plus the first ten base32 characters of the principal's sha256.
pub fn user_name_for(principal_id: &str) -> String {
    let digest = Sha256::digest(principal_id.as_bytes());
    let encoded = BASE32_NOPAD.encode(&digest).to_lowercase();
    format!("u-{}", &encoded[..10])
}

/// Label key under which a user is filed for `principal_id`.
pub fn principal_label_key(principal_id: &str) -> String {
    let mut encoded = BASE32HEX_NOPAD.encode(principal_id.as_bytes());
    encoded.truncate(MAX_LABEL_KEY_LEN);
    encoded
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CreatorRoleBindings {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    created: Vec<String>,
}

fn non_empty(values: &[&str]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .collect()
}

#[derive(Clone)]
pub struct UserManager {
    users: SharedStore<User>,
    tokens: SharedStore<Token>,
    global_roles: SharedStore<GlobalRole>,
    grbs: SharedStore<GlobalRoleBinding>,
    crtbs: SharedStore<ClusterRoleTemplateBinding>,
    prtbs: SharedStore<ProjectRoleTemplateBinding>,
}

impl UserManager {
    pub fn new(stores: &Stores) -> Self {
        stores.users.add_index(
            USER_BY_PRINCIPAL_INDEX,
            Arc::new(|u: &User| u.principal_ids.clone()),
        );
        stores.crtbs.add_index(
            CRTB_BY_PRINCIPAL_AND_USER_INDEX,
            Arc::new(|b: &ClusterRoleTemplateBinding| {
                non_empty(&[
                    b.group_principal_name.as_str(),
                    b.user_principal_name.as_str(),
                    b.user_name.as_str(),
                ])
            }),
        );
        stores.prtbs.add_index(
            PRTB_BY_PRINCIPAL_AND_USER_INDEX,
            Arc::new(|b: &ProjectRoleTemplateBinding| {
                non_empty(&[
                    b.group_principal_name.as_str(),
                    b.user_principal_name.as_str(),
                    b.user_name.as_str(),
                ])
            }),
        );
        stores.global_role_bindings.add_index(
            GRB_BY_USER_INDEX,
            Arc::new(|b: &GlobalRoleBinding| non_empty(&[b.user_name.as_str()])),
        );

        Self {
            users: stores.users.clone(),
            tokens: stores.tokens.clone(),
            global_roles: stores.global_roles.clone(),
            grbs: stores.global_role_bindings.clone(),
            crtbs: stores.crtbs.clone(),
            prtbs: stores.prtbs.clone(),
        }
    }

    /// The user claiming `principal_id`, if any. More than one claimant is an error.
    pub async fn user_by_principal(&self, principal_id: &str) -> Result<Option<User>> {
        let mut users = self.users.by_index(USER_BY_PRINCIPAL_INDEX, principal_id).await?;
        if users.len() > 1 {
            return Err(AuthError::Internal(format!(
                "can't find unique user for principal {}",
                principal_id
            )));
        }
        if let Some(user) = users.pop() {
            return Ok(Some(user));
        }

        // Older records are only findable by their hashed-principal label.
        let mut selector = BTreeMap::new();
        selector.insert(principal_label_key(principal_id), HASHED_PRINCIPAL_VALUE.to_string());
        let mut users = self.users.list_labeled(None, &selector).await?;
        if users.len() > 1 {
            return Err(AuthError::Internal(format!(
                "can't find unique user for principal {}",
                principal_id
            )));
        }
        Ok(users.pop())
    }

    /// The canonical user for `principal_id`, created on first sight.
    pub async fn ensure_user(&self, principal_id: &str, display_name: &str) -> Result<User> {
        let user = match self.user_by_principal(principal_id).await? {
            Some(mut user) => {
                if !display_name.is_empty() && user.display_name.is_empty() {
                    user.display_name = display_name.to_string();
                    user = self.users.update(user).await?;
                }
                // Users created outside of a login carry no creator bindings.
                if user.metadata.annotation(CREATOR_ROLE_BINDINGS_ANNOTATION).is_none()
                    || user.conditions.is_true(INITIAL_ROLES_POPULATED)
                {
                    return Ok(user);
                }
                user
            }
            None => self.create_user(principal_id, display_name).await?,
        };

        self.ensure_creator_bindings(user.name()).await
    }

    async fn create_user(&self, principal_id: &str, display_name: &str) -> Result<User> {
        let required = self.default_global_roles().await?;
        let annotation = serde_json::to_string(&CreatorRoleBindings {
            required,
            created: Vec::new(),
        })
        .map_err(StoreError::from)?;

        let mut metadata = ObjectMeta::named(user_name_for(principal_id))
            .with_label(principal_label_key(principal_id), HASHED_PRINCIPAL_VALUE);
        metadata
            .annotations
            .insert(CREATOR_ROLE_BINDINGS_ANNOTATION.to_string(), annotation);
        let user = User {
            metadata,
            display_name: display_name.to_string(),
            principal_ids: vec![principal_id.to_string()],
            ..Default::default()
        };

        let user = match self.users.create(user).await {
            Ok(user) => {
                info!(user = %user.name(), principal = principal_id, "created user");
                user
            }
            Err(e) if e.is_already_exists() => {
                let existing = self.users.get("", &user_name_for(principal_id)).await?;
                if !existing.principal_ids.iter().any(|p| p == principal_id) {
                    return Err(AuthError::Conflict(format!(
                        "user {} already exists for a different principal",
                        existing.name()
                    )));
                }
                existing
            }
            Err(e) => return Err(e.into()),
        };

        self.ensure_view_binding(user.name()).await?;
        Ok(user)
    }

    async fn default_global_roles(&self) -> Result<Vec<String>> {
        let mut roles: Vec<String> = self
            .global_roles
            .list(None)
            .await?
            .into_iter()
            .filter(|r| r.new_user_default)
            .map(|r| r.metadata.name)
            .collect();
        if roles.is_empty() {
            roles.push(DEFAULT_USER_ROLE.to_string());
        }
        Ok(roles)
    }

    /// Lets a user read its own record.
    async fn ensure_view_binding(&self, user_name: &str) -> Result<()> {
        let role_name = format!("{}-view", user_name);
        let mut rule = PolicyRule::new(&["get"], &["management.cattle.io"], &["users"]);
        rule.resource_names = vec![user_name.to_string()];
        let role = GlobalRole {
            metadata: ObjectMeta::named(&role_name),
            display_name: role_name.clone(),
            rules: vec![rule],
            new_user_default: false,
        };
        match self.global_roles.create(role).await {
            Err(e) if !e.is_already_exists() => return Err(e.into()),
            _ => {}
        }

        let binding = GlobalRoleBinding {
            metadata: ObjectMeta::named(format!("grb-{}", role_name)),
            user_name: user_name.to_string(),
            group_principal_name: String::new(),
            global_role_name: role_name,
        };
        match self.grbs.create(binding).await {
            Err(e) if !e.is_already_exists() => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Creates the bindings named in the user's creator annotation that do
    /// not exist yet, then marks the initial roles as populated.
    async fn ensure_creator_bindings(&self, user_name: &str) -> Result<User> {
        let users = &self.users;
        let grbs = &self.grbs;
        retry_on_conflict(Backoff::conflict(), || async move {
            let mut user = users.get("", user_name).await?;
            let mut bindings: CreatorRoleBindings = match user.metadata.annotation(CREATOR_ROLE_BINDINGS_ANNOTATION) {
                Some(raw) => serde_json::from_str(raw)?,
                None => CreatorRoleBindings::default(),
            };

            let existing: Vec<String> = grbs
                .by_index(GRB_BY_USER_INDEX, user_name)
                .await?
                .into_iter()
                .map(|b| b.global_role_name)
                .collect();
            for role in bindings.required.clone() {
                if bindings.created.contains(&role) {
                    continue;
                }
                if !existing.contains(&role) {
                    let binding = GlobalRoleBinding {
                        metadata: ObjectMeta::named(generate_name("grb-")),
                        user_name: user_name.to_string(),
                        group_principal_name: String::new(),
                        global_role_name: role.clone(),
                    };
                    grbs.create(binding).await?;
                    debug!(user = user_name, role = %role, "created global role binding");
                }
                bindings.created.push(role);
            }

            user.metadata.annotations.insert(
                CREATOR_ROLE_BINDINGS_ANNOTATION.to_string(),
                serde_json::to_string(&bindings)?,
            );
            user.conditions.set_true(INITIAL_ROLES_POPULATED);
            users.update(user).await
        })
        .await
        .map_err(AuthError::from)
    }

    /// Binds `principal` to an existing user, replacing any principal of the same provider.
    pub async fn set_principal_on_current_user(&self, user_id: &str, principal: &Principal) -> Result<User> {
        if let Some(owner) = self.user_by_principal(&principal.id).await? {
            if owner.name() != user_id {
                return Err(AuthError::Conflict(format!(
                    "principal {} is already associated with user {}",
                    principal.id,
                    owner.name()
                )));
            }
            return Ok(owner);
        }

        let users = &self.users;
        let provider = provider_of(&principal.id);
        let user = retry_on_conflict(Backoff::conflict(), || async move {
            let mut user = users.get("", user_id).await?;
            user.principal_ids.retain(|p| provider_of(p) != provider);
            user.principal_ids.push(principal.id.clone());
            users.update(user).await
        })
        .await?;
        info!(user = user_id, principal = %principal.id, "bound principal to user");
        Ok(user)
    }

    /// Whether a login may proceed under the provider's access mode.
    pub async fn check_access(
        &self,
        access_mode: AccessMode,
        allowed_principal_ids: &[String],
        user: &User,
        user_principal: &Principal,
        groups: &[Principal],
    ) -> Result<bool> {
        match access_mode {
            AccessMode::Unrestricted => return Ok(true),
            AccessMode::Required | AccessMode::Restricted => {}
        }

        let candidates: Vec<&str> = std::iter::once(user_principal.id.as_str())
            .chain(user.principal_ids.iter().map(String::as_str))
            .chain(groups.iter().map(|g| g.id.as_str()))
            .collect();
        if candidates
            .iter()
            .any(|c| allowed_principal_ids.iter().any(|a| a == c))
        {
            return Ok(true);
        }
        if access_mode == AccessMode::Required {
            return Ok(false);
        }

        // Restricted also admits anyone bound into a cluster or project.
        for value in candidates.iter().copied().chain(std::iter::once(user.name())) {
            if !self.crtbs.by_index(CRTB_BY_PRINCIPAL_AND_USER_INDEX, value).await?.is_empty() {
                return Ok(true);
            }
            if !self.prtbs.by_index(PRTB_BY_PRINCIPAL_AND_USER_INDEX, value).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A named, non-expiring system token for `user_name`, returned as `name:key`.
    pub async fn ensure_token(&self, token_name: &str, description: &str, user_name: &str) -> Result<String> {
        if token_name.starts_with("token-") {
            return Err(AuthError::BadRequest("token names can't start with token-".to_string()));
        }

        if let Some(existing) = self.tokens.get_opt("", token_name).await? {
            return Ok(format!("{}:{}", existing.name(), existing.token));
        }

        let token = Token {
            metadata: ObjectMeta::named(token_name)
                .with_label(USER_ID_LABEL, user_name)
                .with_label(TOKEN_KIND_LABEL, "system"),
            token: generate_key(),
            user_id: user_name.to_string(),
            auth_provider: "local".to_string(),
            is_derived: true,
            ttl_millis: 0,
            description: description.to_string(),
            ..Default::default()
        };
        let token = match self.tokens.create(token).await {
            Ok(token) => token,
            Err(e) if e.is_already_exists() => self.tokens.get("", token_name).await?,
            Err(e) => return Err(e.into()),
        };
        Ok(format!("{}:{}", token.name(), token.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (UserManager, Stores) {
        let stores = Stores::memory();
        (UserManager::new(&stores), stores)
    }

    #[test]
    fn derived_names_are_stable() {
        let name = user_name_for("local://alice");
        assert!(name.starts_with("u-"));
        assert_eq!(name.len(), 12);
        assert_eq!(name, user_name_for("local://alice"));
        assert_ne!(name, user_name_for("local://bob"));
        assert!(principal_label_key(&"x".repeat(200)).len() <= 63);
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let (mgr, stores) = manager();
        let first = mgr.ensure_user("github_user://42", "Eve").await.unwrap();
        let second = mgr.ensure_user("github_user://42", "").await.unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(first.display_name, "Eve");
        assert_eq!(stores.users.list(None).await.unwrap().len(), 1);
        assert_eq!(
            first.metadata.label(&principal_label_key("github_user://42")),
            Some(HASHED_PRINCIPAL_VALUE)
        );
    }

    #[tokio::test]
    async fn legacy_user_found_by_label() {
        let (mgr, stores) = manager();
        stores
            .users
            .create(User {
                metadata: ObjectMeta::named("user-legacy")
                    .with_label(principal_label_key("local://legacy"), HASHED_PRINCIPAL_VALUE),
                ..Default::default()
            })
            .await
            .unwrap();
        let user = mgr.ensure_user("local://legacy", "").await.unwrap();
        assert_eq!(user.name(), "user-legacy");
    }

    #[tokio::test]
    async fn new_user_gets_default_bindings_once() {
        let (mgr, stores) = manager();
        stores
            .global_roles
            .create(GlobalRole {
                metadata: ObjectMeta::named("user"),
                new_user_default: true,
                ..Default::default()
            })
            .await
            .unwrap();
        stores
            .global_roles
            .create(GlobalRole {
                metadata: ObjectMeta::named("admin"),
                ..Default::default()
            })
            .await
            .unwrap();

        let user = mgr.ensure_user("local://alice", "Alice").await.unwrap();
        assert!(user.conditions.is_true(INITIAL_ROLES_POPULATED));
        mgr.ensure_user("local://alice", "Alice").await.unwrap();

        let roles: Vec<String> = stores
            .global_role_bindings
            .by_index(GRB_BY_USER_INDEX, user.name())
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.global_role_name)
            .collect();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains(&"user".to_string()));
        assert!(roles.contains(&format!("{}-view", user.name())));
    }

    #[tokio::test]
    async fn access_modes() {
        let (mgr, stores) = manager();
        let user = mgr.ensure_user("github_user://42", "eve").await.unwrap();
        let me = Principal::user("github_user://42", "github");
        let org = Principal::group("github_org://99", "github");

        assert!(mgr
            .check_access(AccessMode::Unrestricted, &[], &user, &me, &[])
            .await
            .unwrap());
        assert!(mgr
            .check_access(AccessMode::Required, &["github_org://99".into()], &user, &me, &[org.clone()])
            .await
            .unwrap());
        assert!(!mgr
            .check_access(AccessMode::Required, &["github_org://1".into()], &user, &me, &[org.clone()])
            .await
            .unwrap());
        assert!(!mgr
            .check_access(AccessMode::Restricted, &[], &user, &me, &[org.clone()])
            .await
            .unwrap());

        stores
            .crtbs
            .create(ClusterRoleTemplateBinding {
                metadata: ObjectMeta::namespaced("c-1", "crtb-1"),
                group_principal_name: "github_org://99".into(),
                role_template_name: "cluster-member".into(),
                cluster_name: "c-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(mgr
            .check_access(AccessMode::Restricted, &[], &user, &me, &[org])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn principal_replaced_per_provider() {
        let (mgr, _) = manager();
        let user = mgr.ensure_user("local://alice", "Alice").await.unwrap();
        mgr.set_principal_on_current_user(user.name(), &Principal::user("github_user://1", "github"))
            .await
            .unwrap();
        let updated = mgr
            .set_principal_on_current_user(user.name(), &Principal::user("github_user://2", "github"))
            .await
            .unwrap();
        assert_eq!(updated.principal_ids, vec!["local://alice", "github_user://2"]);

        let other = mgr.ensure_user("local://bob", "Bob").await.unwrap();
        let err = mgr
            .set_principal_on_current_user(other.name(), &Principal::user("github_user://2", "github"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn system_tokens() {
        let (mgr, _) = manager();
        assert!(mgr.ensure_token("token-abc", "", "u-1").await.is_err());
        let first = mgr.ensure_token("agent", "agent token", "u-1").await.unwrap();
        let second = mgr.ensure_token("agent", "agent token", "u-1").await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("agent:"));
    }
}
