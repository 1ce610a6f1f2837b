// Identity records: tokens, users, principals and provider configs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::meta::{Conditions, ObjectMeta};

pub const USER_ID_LABEL: &str = "authn.management.cattle.io/token-userId";
pub const TOKEN_KIND_LABEL: &str = "authn.management.cattle.io/kind";
/// Label value marking a user record by the hash of a principal it owns; the key is the hash.
pub const HASHED_PRINCIPAL_VALUE: &str = "hashed-principal-name";
pub const CREATOR_ROLE_BINDINGS_ANNOTATION: &str = "authz.management.cattle.io/creator-role-bindings";
pub const PRINCIPAL_DISPLAY_NAME_ANNOTATION: &str = "auth.cattle.io/principal-display-name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrincipalType {
    #[default]
    User,
    Group,
}

/// A provider's view of an identity. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// `<provider>_<kind>://<external-id>`
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub login_name: String,
    #[serde(default)]
    pub principal_type: PrincipalType,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub me: bool,
    #[serde(default)]
    pub member_of: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_picture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_url: String,
}

impl Principal {
    pub fn user(id: impl Into<String>, provider: &str) -> Self {
        Self {
            id: id.into(),
            provider: provider.to_string(),
            principal_type: PrincipalType::User,
            ..Default::default()
        }
    }

    pub fn group(id: impl Into<String>, provider: &str) -> Self {
        Self {
            id: id.into(),
            provider: provider.to_string(),
            principal_type: PrincipalType::Group,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub metadata: ObjectMeta,
    /// The secret half of `<name>:<key>`.
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub auth_provider: String,
    #[serde(default)]
    pub user_principal: Principal,
    /// Legacy group cache; superseded by `UserAttribute` when present.
    #[serde(default)]
    pub group_principals: Vec<Principal>,
    #[serde(default)]
    pub provider_info: BTreeMap<String, String>,
    #[serde(default)]
    pub is_derived: bool,
    #[serde(default)]
    pub ttl_millis: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

impl Token {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// TTL of zero never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_millis <= 0 {
            return false;
        }
        let age = now.signed_duration_since(self.metadata.creation_timestamp);
        age.num_milliseconds() > self.ttl_millis
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: String,
    /// Bcrypt hash, local provider only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub principal_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub must_change_password: bool,
    #[serde(default)]
    pub conditions: Conditions,
}

impl User {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Per-user group cache keyed by provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAttribute {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub group_principals: BTreeMap<String, Vec<Principal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub needs_refresh: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRoleBinding {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub group_principal_name: String,
    pub global_role_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    #[default]
    Unrestricted,
    Restricted,
    Required,
}

/// The enumerated set of identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    Local,
    Github,
    ActiveDirectory,
    OpenLdap,
    FreeIpa,
    AzureAd,
    Ping,
    Adfs,
    KeyCloak,
    Okta,
    Shibboleth,
    GoogleOauth,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 12] = [
        ProviderKind::Local,
        ProviderKind::Github,
        ProviderKind::ActiveDirectory,
        ProviderKind::OpenLdap,
        ProviderKind::FreeIpa,
        ProviderKind::AzureAd,
        ProviderKind::Ping,
        ProviderKind::Adfs,
        ProviderKind::KeyCloak,
        ProviderKind::Okta,
        ProviderKind::Shibboleth,
        ProviderKind::GoogleOauth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Github => "github",
            ProviderKind::ActiveDirectory => "activedirectory",
            ProviderKind::OpenLdap => "openldap",
            ProviderKind::FreeIpa => "freeipa",
            ProviderKind::AzureAd => "azureAD",
            ProviderKind::Ping => "ping",
            ProviderKind::Adfs => "adfs",
            ProviderKind::KeyCloak => "keyCloak",
            ProviderKind::Okta => "okta",
            ProviderKind::Shibboleth => "shibboleth",
            ProviderKind::GoogleOauth => "googleOauth",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name().eq_ignore_ascii_case(name))
    }

    pub fn is_ldap(self) -> bool {
        matches!(
            self,
            ProviderKind::ActiveDirectory | ProviderKind::OpenLdap | ProviderKind::FreeIpa
        )
    }

    pub fn is_saml(self) -> bool {
        matches!(
            self,
            ProviderKind::Ping
                | ProviderKind::Adfs
                | ProviderKind::KeyCloak
                | ProviderKind::Okta
                | ProviderKind::Shibboleth
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One stored configuration per provider; the record name is the provider name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub allowed_principal_ids: Vec<String>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

impl AuthConfig {
    pub fn new(kind: ProviderKind, provider: ProviderConfig) -> Self {
        Self {
            metadata: ObjectMeta::named(kind.name()),
            enabled: false,
            access_mode: AccessMode::Unrestricted,
            allowed_principal_ids: Vec::new(),
            conditions: Conditions::default(),
            provider,
        }
    }

    pub fn kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_name(&self.metadata.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProviderConfig {
    LocalConfig,
    GithubConfig(GithubConfig),
    LdapConfig(LdapConfig),
    SamlConfig(SamlConfig),
    /// Providers whose settings are stored but which have no login flow here.
    OpaqueConfig {
        #[serde(default)]
        settings: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_true")]
    pub tls: bool,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LdapConfig {
    pub servers: Vec<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub connection_timeout: u64,
    #[serde(default)]
    pub service_account_distinguished_name: String,
    #[serde(default)]
    pub service_account_password: String,
    #[serde(default)]
    pub default_login_domain: String,
    #[serde(default)]
    pub user_search_base: String,
    #[serde(default)]
    pub user_search_attribute: String,
    #[serde(default)]
    pub user_login_attribute: String,
    #[serde(default)]
    pub user_object_class: String,
    #[serde(default)]
    pub user_name_attribute: String,
    #[serde(default)]
    pub user_member_attribute: String,
    #[serde(default)]
    pub user_enabled_attribute: String,
    #[serde(default)]
    pub user_disabled_bit_mask: i64,
    #[serde(default)]
    pub group_search_base: String,
    #[serde(default)]
    pub group_search_attribute: String,
    #[serde(default)]
    pub group_object_class: String,
    #[serde(default)]
    pub group_name_attribute: String,
    #[serde(default)]
    pub group_dn_attribute: String,
    #[serde(default)]
    pub group_member_user_attribute: String,
    #[serde(default)]
    pub group_member_mapping_attribute: String,
    #[serde(default)]
    pub nested_group_membership_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamlConfig {
    #[serde(default)]
    pub idp_metadata_content: String,
    #[serde(default)]
    pub sp_cert: String,
    #[serde(default)]
    pub sp_key: String,
    #[serde(default)]
    pub rancher_api_host: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub uid_field: String,
    #[serde(default)]
    pub display_name_field: String,
    #[serde(default)]
    pub user_name_field: String,
    #[serde(default)]
    pub groups_field: String,
}
