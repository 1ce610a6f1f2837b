use async_trait::async_trait;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, SearchOptions};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{parse_principal_id, AuthProvider, AuthResult, LoginInput};
use crate::auth::{AuthError, Result};
use crate::models::auth::{AuthConfig, LdapConfig, Principal, PrincipalType, ProviderConfig, ProviderKind, Token};

/// Parent-group lookups OR at most this many DNs into one filter.
pub const GROUP_BATCH_SIZE: usize = 50;
const SEARCH_SIZE_LIMIT: i32 = 1000;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_INVALID_CREDENTIALS: u32 = 49;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    Subtree,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LdapEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl LdapEntry {
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    /// Attribute values; names compare case-insensitively.
    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }
}

#[async_trait]
pub trait LdapSession: Send {
    /// A rejected password is `Unauthorized`.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    async fn search(&mut self, base: &str, scope: SearchScope, filter: &str, attrs: &[String]) -> Result<Vec<LdapEntry>>;

    async fn unbind(&mut self);
}

#[async_trait]
pub trait LdapConnector: Send + Sync {
    async fn connect(&self, config: &LdapConfig) -> Result<Box<dyn LdapSession>>;
}

/// Connects with `ldap3`, trying each configured server in order.
#[derive(Debug, Default, Clone)]
pub struct Ldap3Connector;

struct Ldap3Session {
    ldap: Ldap,
}

fn ldap_error(e: LdapError) -> AuthError {
    match e {
        LdapError::LdapResult { result } if result.rc == RC_INVALID_CREDENTIALS => {
            AuthError::Unauthorized("authentication failed".to_string())
        }
        other => AuthError::Provider(other.to_string()),
    }
}

#[async_trait]
impl LdapConnector for Ldap3Connector {
    async fn connect(&self, config: &LdapConfig) -> Result<Box<dyn LdapSession>> {
        let timeout = match config.connection_timeout {
            0 => DEFAULT_CONNECTION_TIMEOUT_MS,
            ms => ms,
        };
        let port = match (config.port, config.tls) {
            (0, true) => 636,
            (0, false) => 389,
            (port, _) => port,
        };
        let scheme = if config.tls { "ldaps" } else { "ldap" };

        let mut last_error = AuthError::Provider("no ldap servers configured".to_string());
        for server in &config.servers {
            let url = format!("{}://{}:{}", scheme, server, port);
            let settings = LdapConnSettings::new()
                .set_conn_timeout(Duration::from_millis(timeout))
                .set_starttls(config.starttls && !config.tls);
            match LdapConnAsync::with_settings(settings, &url).await {
                Ok((conn, ldap)) => {
                    tokio::spawn(async move {
                        if let Err(e) = conn.drive().await {
                            warn!("ldap connection error: {}", e);
                        }
                    });
                    debug!(server = %url, "connected to ldap server");
                    return Ok(Box::new(Ldap3Session { ldap }));
                }
                Err(e) => {
                    warn!("failed to connect to ldap server {}: {}", url, e);
                    last_error = ldap_error(e);
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl LdapSession for Ldap3Session {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.ldap
            .simple_bind(dn, password)
            .await
            .map_err(ldap_error)?
            .success()
            .map_err(ldap_error)?;
        Ok(())
    }

    async fn search(&mut self, base: &str, scope: SearchScope, filter: &str, attrs: &[String]) -> Result<Vec<LdapEntry>> {
        let scope = match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::Subtree => Scope::Subtree,
        };
        let result = self
            .ldap
            .with_search_options(SearchOptions::new().sizelimit(SEARCH_SIZE_LIMIT))
            .search(base, scope, filter, attrs.to_vec())
            .await
            .map_err(ldap_error)?;
        let rc = result.1.rc;
        if rc != 0 && rc != RC_SIZE_LIMIT_EXCEEDED {
            return Err(ldap_error(LdapError::LdapResult { result: result.1 }));
        }
        Ok(result
            .0
            .into_iter()
            .map(SearchEntry::construct)
            .map(|e| LdapEntry {
                dn: e.dn,
                attrs: e.attrs,
            })
            .collect())
    }

    async fn unbind(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!("ldap unbind failed: {}", e);
        }
    }
}

/// Config with the directory flavor's defaults filled in.
fn effective(kind: ProviderKind, config: &LdapConfig) -> LdapConfig {
    let ad = kind == ProviderKind::ActiveDirectory;
    let mut c = config.clone();
    let fill = |field: &mut String, ad_default: &str, ldap_default: &str| {
        if field.is_empty() {
            *field = if ad { ad_default } else { ldap_default }.to_string();
        }
    };
    fill(&mut c.user_login_attribute, "sAMAccountName", "uid");
    fill(&mut c.user_search_attribute, "sAMAccountName|sn|givenName", "uid|sn|givenName");
    fill(&mut c.user_object_class, "person", "inetOrgPerson");
    fill(&mut c.user_name_attribute, "name", "cn");
    fill(&mut c.user_member_attribute, "memberOf", "memberOf");
    fill(&mut c.group_object_class, "group", "groupOfNames");
    fill(&mut c.group_search_attribute, "sAMAccountName", "cn");
    fill(&mut c.group_name_attribute, "name", "cn");
    fill(&mut c.group_dn_attribute, "distinguishedName", "entryDN");
    fill(&mut c.group_member_user_attribute, "distinguishedName", "entryDN");
    fill(&mut c.group_member_mapping_attribute, "member", "member");
    if ad {
        if c.user_enabled_attribute.is_empty() {
            c.user_enabled_attribute = "userAccountControl".to_string();
        }
        if c.user_disabled_bit_mask == 0 {
            c.user_disabled_bit_mask = 2;
        }
    }
    if c.group_search_base.is_empty() {
        c.group_search_base = c.user_search_base.clone();
    }
    c
}

/// Login name without any `DOMAIN\` or `@domain` qualifier.
fn bare_username(username: &str) -> &str {
    let name = username.rsplit('\\').next().unwrap_or(username);
    name.split('@').next().unwrap_or(name)
}

fn is_dn_attribute(attr: &str) -> bool {
    attr.eq_ignore_ascii_case("distinguishedName") || attr.eq_ignore_ascii_case("entryDN") || attr.eq_ignore_ascii_case("dn")
}

pub struct LdapProvider {
    kind: ProviderKind,
    connector: Arc<dyn LdapConnector>,
}

impl LdapProvider {
    pub fn new(kind: ProviderKind, connector: Arc<dyn LdapConnector>) -> Self {
        Self { kind, connector }
    }

    fn ldap_config(&self, config: &AuthConfig) -> Result<LdapConfig> {
        match &config.provider {
            ProviderConfig::LdapConfig(c) => Ok(effective(self.kind, c)),
            _ => Err(AuthError::Internal(format!(
                "auth config {} is not an ldap config",
                config.metadata.name
            ))),
        }
    }

    fn user_attrs(c: &LdapConfig) -> Vec<String> {
        let mut attrs = vec![
            "objectClass".to_string(),
            c.user_login_attribute.clone(),
            c.user_name_attribute.clone(),
            c.user_member_attribute.clone(),
            c.group_member_user_attribute.clone(),
        ];
        if !c.user_enabled_attribute.is_empty() {
            attrs.push(c.user_enabled_attribute.clone());
        }
        attrs.sort();
        attrs.dedup();
        attrs
    }

    fn group_attrs(c: &LdapConfig) -> Vec<String> {
        let mut attrs = vec![
            "objectClass".to_string(),
            c.group_name_attribute.clone(),
            c.group_dn_attribute.clone(),
            c.group_member_mapping_attribute.clone(),
        ];
        attrs.sort();
        attrs.dedup();
        attrs
    }

    fn user_principal(&self, c: &LdapConfig, entry: &LdapEntry) -> Principal {
        let login = entry.first(&c.user_login_attribute).unwrap_or_default().to_string();
        let display = entry
            .first(&c.user_name_attribute)
            .map(str::to_string)
            .unwrap_or_else(|| login.clone());
        Principal {
            display_name: display,
            login_name: login,
            ..Principal::user(format!("{}_user://{}", self.kind.name(), entry.dn), self.kind.name())
        }
    }

    fn group_principal(&self, c: &LdapConfig, entry: &LdapEntry) -> Principal {
        let display = entry
            .first(&c.group_name_attribute)
            .map(str::to_string)
            .unwrap_or_else(|| entry.dn.clone());
        Principal {
            display_name: display,
            member_of: true,
            ..Principal::group(format!("{}_group://{}", self.kind.name(), entry.dn), self.kind.name())
        }
    }

    fn is_group(c: &LdapConfig, entry: &LdapEntry) -> bool {
        entry
            .values("objectClass")
            .iter()
            .any(|oc| oc.eq_ignore_ascii_case(&c.group_object_class))
    }

    fn is_disabled(c: &LdapConfig, entry: &LdapEntry) -> bool {
        if c.user_enabled_attribute.is_empty() || c.user_disabled_bit_mask == 0 {
            return false;
        }
        entry
            .first(&c.user_enabled_attribute)
            .and_then(|v| v.parse::<i64>().ok())
            .map_or(false, |flags| flags & c.user_disabled_bit_mask != 0)
    }

    /// Groups whose DN is in `dns`, queried in batches.
    async fn groups_by_dn(
        &self,
        session: &mut dyn LdapSession,
        c: &LdapConfig,
        dns: &[String],
    ) -> Result<Vec<LdapEntry>> {
        let mut groups = Vec::new();
        for batch in dns.chunks(GROUP_BATCH_SIZE) {
            let clauses: String = batch
                .iter()
                .map(|dn| format!("({}={})", c.group_dn_attribute, ldap_escape(dn)))
                .collect();
            let filter = format!("(&(objectClass={})(|{}))", c.group_object_class, clauses);
            groups.extend(
                session
                    .search(&c.group_search_base, SearchScope::Subtree, &filter, &Self::group_attrs(c))
                    .await?,
            );
        }
        Ok(groups)
    }

    /// Groups listing `value` in their member-mapping attribute.
    async fn groups_with_member(
        &self,
        session: &mut dyn LdapSession,
        c: &LdapConfig,
        value: &str,
    ) -> Result<Vec<LdapEntry>> {
        let filter = format!(
            "(&(objectClass={})({}={}))",
            c.group_object_class,
            c.group_member_mapping_attribute,
            ldap_escape(value)
        );
        session
            .search(&c.group_search_base, SearchScope::Subtree, &filter, &Self::group_attrs(c))
            .await
    }

    /// Direct groups of `user`, plus their ancestors when nesting is enabled.
    /// Ancestor lookups stop at the first error and keep what was found.
    async fn user_groups(
        &self,
        session: &mut dyn LdapSession,
        c: &LdapConfig,
        user: &LdapEntry,
    ) -> Result<Vec<Principal>> {
        let member_of = user.values(&c.user_member_attribute).to_vec();
        let direct = if !member_of.is_empty() {
            self.groups_by_dn(session, c, &member_of).await?
        } else {
            let value = if is_dn_attribute(&c.group_member_user_attribute) {
                user.dn.clone()
            } else {
                match user.first(&c.group_member_user_attribute) {
                    Some(v) => v.to_string(),
                    None => return Ok(Vec::new()),
                }
            };
            self.groups_with_member(session, c, &value).await?
        };

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut principals = Vec::new();
        let mut pending: VecDeque<LdapEntry> = VecDeque::new();
        for group in direct {
            if visited.insert(group.dn.to_lowercase()) {
                principals.push(self.group_principal(c, &group));
                pending.push_back(group);
            }
        }

        if c.nested_group_membership_enabled {
            while let Some(group) = pending.pop_front() {
                let parents = match self.groups_with_member(session, c, &group.dn).await {
                    Ok(parents) => parents,
                    Err(e) => {
                        warn!("nested group lookup for {} failed: {}", group.dn, e);
                        break;
                    }
                };
                for parent in parents {
                    if visited.insert(parent.dn.to_lowercase()) {
                        principals.push(self.group_principal(c, &parent));
                        pending.push_back(parent);
                    }
                }
            }
        }
        Ok(principals)
    }

    async fn service_session(&self, c: &LdapConfig) -> Result<Box<dyn LdapSession>> {
        let mut session = self.connector.connect(c).await?;
        session
            .bind(&c.service_account_distinguished_name, &c.service_account_password)
            .await
            .map_err(|e| match e {
                AuthError::Unauthorized(_) => AuthError::Provider("service account bind rejected".to_string()),
                other => other,
            })?;
        Ok(session)
    }

    async fn login(&self, session: &mut dyn LdapSession, c: &LdapConfig, input: &LoginInput) -> Result<AuthResult> {
        let username = bare_username(&input.username);
        let filter = format!(
            "(&(objectClass={})({}={}))",
            c.user_object_class,
            c.user_login_attribute,
            ldap_escape(username)
        );
        let mut users = session
            .search(&c.user_search_base, SearchScope::Subtree, &filter, &Self::user_attrs(c))
            .await?;
        if users.len() != 1 {
            debug!(username, matches = users.len(), "ldap user lookup did not find exactly one entry");
            return Err(AuthError::Unauthorized("authentication failed".to_string()));
        }
        let user = users.remove(0);

        session.bind(&user.dn, &input.password).await?;
        // Back to the service account for the group queries.
        session
            .bind(&c.service_account_distinguished_name, &c.service_account_password)
            .await?;

        if Self::is_disabled(c, &user) {
            return Err(AuthError::Forbidden("user is disabled".to_string()));
        }

        let groups = self.user_groups(session, c, &user).await?;
        Ok(AuthResult {
            user_principal: Principal {
                me: true,
                ..self.user_principal(c, &user)
            },
            groups,
            provider_info: Default::default(),
        })
    }
}

#[async_trait]
impl AuthProvider for LdapProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn authenticate(&self, config: &AuthConfig, input: &LoginInput) -> Result<AuthResult> {
        if input.username.is_empty() || input.password.is_empty() {
            return Err(AuthError::Unauthorized("authentication failed".to_string()));
        }
        let c = self.ldap_config(config)?;
        let mut session = self.service_session(&c).await?;
        let result = self.login(session.as_mut(), &c, input).await;
        session.unbind().await;
        result
    }

    async fn search(
        &self,
        config: &AuthConfig,
        query: &str,
        principal_type: Option<PrincipalType>,
        _token: &Token,
    ) -> Result<Vec<Principal>> {
        let c = self.ldap_config(config)?;
        let q = ldap_escape(query);
        let mut session = self.service_session(&c).await?;

        let mut principals = Vec::new();
        let mut outcome = Ok(());
        if principal_type != Some(PrincipalType::Group) {
            let clauses: String = c
                .user_search_attribute
                .split('|')
                .map(|attr| format!("({}=*{}*)", attr, q))
                .collect();
            let filter = format!("(&(objectClass={})(|{}))", c.user_object_class, clauses);
            match session
                .search(&c.user_search_base, SearchScope::Subtree, &filter, &Self::user_attrs(&c))
                .await
            {
                Ok(users) => principals.extend(users.iter().map(|u| self.user_principal(&c, u))),
                Err(e) => outcome = Err(e),
            }
        }
        if outcome.is_ok() && principal_type != Some(PrincipalType::User) {
            let filter = format!(
                "(&(objectClass={})({}=*{}*))",
                c.group_object_class, c.group_search_attribute, q
            );
            match session
                .search(&c.group_search_base, SearchScope::Subtree, &filter, &Self::group_attrs(&c))
                .await
            {
                Ok(groups) => principals.extend(groups.iter().map(|g| self.group_principal(&c, g))),
                Err(e) => outcome = Err(e),
            }
        }
        session.unbind().await;
        outcome.map(|_| principals)
    }

    async fn get_principal(&self, config: &AuthConfig, id: &str, _token: &Token) -> Result<Principal> {
        let c = self.ldap_config(config)?;
        let (_, _, dn) = parse_principal_id(id)
            .ok_or_else(|| AuthError::BadRequest(format!("invalid id {}", id)))?;
        let mut session = self.service_session(&c).await?;
        let mut attrs = Self::user_attrs(&c);
        attrs.extend(Self::group_attrs(&c));
        let found = session
            .search(dn, SearchScope::Base, "(objectClass=*)", &attrs)
            .await;
        session.unbind().await;

        let entry = found?
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::NotFound(format!("principal {} not found", id)))?;
        if Self::is_group(&c, &entry) {
            Ok(self.group_principal(&c, &entry))
        } else {
            Ok(self.user_principal(&c, &entry))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const SERVICE_DN: &str = "cn=svc,dc=corp";

    /// Answers searches whose filter contains a registered needle.
    #[derive(Default)]
    struct Directory {
        passwords: HashMap<String, String>,
        answers: Vec<(String, Vec<LdapEntry>)>,
        filters: Mutex<Vec<String>>,
    }

    struct FakeSession(Arc<Directory>);

    #[async_trait]
    impl LdapSession for FakeSession {
        async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
            match self.0.passwords.get(dn) {
                Some(p) if p == password => Ok(()),
                _ => Err(AuthError::Unauthorized("authentication failed".into())),
            }
        }

        async fn search(&mut self, _base: &str, _scope: SearchScope, filter: &str, _attrs: &[String]) -> Result<Vec<LdapEntry>> {
            self.0.filters.lock().push(filter.to_string());
            Ok(self
                .0
                .answers
                .iter()
                .find(|(needle, _)| filter.contains(needle.as_str()))
                .map(|(_, entries)| entries.clone())
                .unwrap_or_default())
        }

        async fn unbind(&mut self) {}
    }

    struct FakeConnector(Arc<Directory>);

    #[async_trait]
    impl LdapConnector for FakeConnector {
        async fn connect(&self, _config: &LdapConfig) -> Result<Box<dyn LdapSession>> {
            Ok(Box::new(FakeSession(self.0.clone())))
        }
    }

    fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> LdapEntry {
        LdapEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
        }
    }

    fn config(nested: bool) -> AuthConfig {
        let mut config = AuthConfig::new(
            ProviderKind::OpenLdap,
            ProviderConfig::LdapConfig(LdapConfig {
                servers: vec!["ldap.corp".into()],
                service_account_distinguished_name: SERVICE_DN.into(),
                service_account_password: "svcpw".into(),
                user_search_base: "dc=corp".into(),
                nested_group_membership_enabled: nested,
                ..Default::default()
            }),
        );
        config.enabled = true;
        config
    }

    fn directory(member_of: &[&str]) -> Arc<Directory> {
        let mut dir = Directory::default();
        dir.passwords.insert(SERVICE_DN.into(), "svcpw".into());
        dir.passwords.insert("uid=alice,dc=corp".into(), "pw".into());
        dir.answers.push((
            "(uid=alice)".into(),
            vec![entry(
                "uid=alice,dc=corp",
                &[("uid", &["alice"]), ("cn", &["Alice"]), ("memberOf", member_of)],
            )],
        ));
        dir.answers.push((
            "(entryDN=cn=devs,dc=corp)".into(),
            vec![entry("cn=devs,dc=corp", &[("cn", &["devs"])])],
        ));
        dir.answers.push((
            "(member=cn=devs,dc=corp)".into(),
            vec![entry("cn=eng,dc=corp", &[("cn", &["eng"])])],
        ));
        // A cycle back to devs.
        dir.answers.push((
            "(member=cn=eng,dc=corp)".into(),
            vec![entry("cn=devs,dc=corp", &[("cn", &["devs"])])],
        ));
        Arc::new(dir)
    }

    fn login(username: &str, password: &str) -> LoginInput {
        LoginInput {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn login_resolves_nested_groups_once() {
        let dir = directory(&["cn=devs,dc=corp"]);
        let provider = LdapProvider::new(ProviderKind::OpenLdap, Arc::new(FakeConnector(dir.clone())));

        let result = provider.authenticate(&config(true), &login("alice", "pw")).await.unwrap();
        assert_eq!(result.user_principal.id, "openldap_user://uid=alice,dc=corp");
        assert_eq!(result.user_principal.display_name, "Alice");
        let groups: Vec<&str> = result.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(groups, vec!["openldap_group://cn=devs,dc=corp", "openldap_group://cn=eng,dc=corp"]);

        let flat = provider.authenticate(&config(false), &login("alice", "pw")).await.unwrap();
        assert_eq!(flat.groups.len(), 1);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let dir = directory(&[]);
        let provider = LdapProvider::new(ProviderKind::OpenLdap, Arc::new(FakeConnector(dir)));
        let err = provider.authenticate(&config(false), &login("alice", "nope")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(_)));
        let err = provider.authenticate(&config(false), &login("mallory", "pw")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn member_of_is_batched() {
        let dns: Vec<String> = (0..120).map(|i| format!("cn=g{},dc=corp", i)).collect();
        let refs: Vec<&str> = dns.iter().map(String::as_str).collect();
        let dir = directory(&refs);
        let provider = LdapProvider::new(ProviderKind::OpenLdap, Arc::new(FakeConnector(dir.clone())));
        provider.authenticate(&config(false), &login("alice", "pw")).await.unwrap();

        let batches = dir
            .filters
            .lock()
            .iter()
            .filter(|f| f.contains("(|(entryDN="))
            .count();
        assert_eq!(batches, 3);
    }

    #[test]
    fn active_directory_defaults() {
        let c = effective(ProviderKind::ActiveDirectory, &LdapConfig::default());
        assert_eq!(c.user_login_attribute, "sAMAccountName");
        assert_eq!(c.user_disabled_bit_mask, 2);
        let disabled = entry("cn=bob", &[("userAccountControl", &["514"])]);
        assert!(LdapProvider::is_disabled(&c, &disabled));
        let enabled = entry("cn=bob", &[("userAccountControl", &["512"])]);
        assert!(!LdapProvider::is_disabled(&c, &enabled));
        assert_eq!(bare_username("CORP\\bob"), "bob");
        assert_eq!(bare_username("bob@corp.local"), "bob");
    }
}
