use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_principal_id, AuthProvider, AuthResult, LoginInput};
use crate::auth::{AuthError, Result, StateClaims, StateSigner};
use crate::models::auth::{AuthConfig, Principal, PrincipalType, ProviderConfig, ProviderKind, SamlConfig, Token};

pub mod dsig;

pub const STATE_COOKIE: &str = "saml-state";
pub const TEST_AND_ENABLE_ACTION: &str = "testAndEnable";
const RELAY_STATE_BYTES: usize = 42;
const CLOCK_SKEW_SECS: i64 = 180;
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Parsed identity-provider metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdpMetadata {
    pub entity_id: String,
    pub sso_url: String,
    /// Base64 DER signing certificates.
    pub certificates: Vec<String>,
}

/// One configured service provider, built from a stored config version.
#[derive(Debug)]
pub struct ServiceProvider {
    pub kind: ProviderKind,
    pub resource_version: u64,
    pub entity_id: String,
    pub acs_url: String,
    pub metadata_url: String,
    pub certificate: String,
    pub idp: IdpMetadata,
    pub fields: SamlConfig,
}

/// Service providers by provider kind.
#[derive(Clone, Default)]
pub struct SamlRegistry {
    inner: Arc<Mutex<HashMap<ProviderKind, Arc<ServiceProvider>>>>,
}

impl SamlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service provider for `config`, rebuilt only when the config's
    /// resource version changed.
    pub fn init(&self, kind: ProviderKind, config: &AuthConfig) -> Result<Arc<ServiceProvider>> {
        let mut inner = self.inner.lock();
        if let Some(sp) = inner.get(&kind) {
            if sp.resource_version == config.metadata.resource_version {
                return Ok(sp.clone());
            }
        }
        let sp = Arc::new(build_service_provider(kind, config)?);
        inner.insert(kind, sp.clone());
        info!(provider = %kind, version = config.metadata.resource_version, "saml service provider initialized");
        Ok(sp)
    }
}

fn saml_fields(config: &AuthConfig) -> Result<&SamlConfig> {
    match &config.provider {
        ProviderConfig::SamlConfig(c) => Ok(c),
        _ => Err(AuthError::Internal(format!(
            "auth config {} is not a saml config",
            config.metadata.name
        ))),
    }
}

fn build_service_provider(kind: ProviderKind, config: &AuthConfig) -> Result<ServiceProvider> {
    let fields = saml_fields(config)?;
    if fields.rancher_api_host.is_empty() {
        return Err(AuthError::BadRequest("rancherApiHost is required".to_string()));
    }
    let idp = parse_idp_metadata(&fields.idp_metadata_content)?;
    let base = format!(
        "{}/v1-saml/{}/saml",
        fields.rancher_api_host.trim_end_matches('/'),
        kind.name()
    );
    let metadata_url = format!("{}/metadata", base);
    let entity_id = if fields.entity_id.is_empty() {
        metadata_url.clone()
    } else {
        fields.entity_id.clone()
    };
    Ok(ServiceProvider {
        kind,
        resource_version: config.metadata.resource_version,
        entity_id,
        acs_url: format!("{}/acs", base),
        metadata_url,
        certificate: pem_body(&fields.sp_cert),
        idp,
        fields: fields.clone(),
    })
}

/// Base64 body of a PEM block with headers and whitespace removed.
fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|l| !l.starts_with("-----"))
        .flat_map(|l| l.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn xml_error(e: quick_xml::Error) -> AuthError {
    AuthError::BadRequest(format!("invalid saml document: {}", e))
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

pub fn parse_idp_metadata(xml: &str) -> Result<IdpMetadata> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut metadata = IdpMetadata::default();
    let mut redirect_url = String::new();
    let mut any_url = String::new();
    let mut in_encryption_key = false;
    let mut in_certificate = false;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) => match local_name(&e).as_str() {
                "EntityDescriptor" if metadata.entity_id.is_empty() => {
                    metadata.entity_id = attr(&e, "entityID").unwrap_or_default();
                }
                "SingleSignOnService" => {
                    let location = attr(&e, "Location").unwrap_or_default();
                    let binding = attr(&e, "Binding").unwrap_or_default();
                    if binding.ends_with("HTTP-Redirect") && redirect_url.is_empty() {
                        redirect_url = location;
                    } else if any_url.is_empty() {
                        any_url = location;
                    }
                }
                "KeyDescriptor" => {
                    in_encryption_key = attr(&e, "use").as_deref() == Some("encryption");
                }
                "X509Certificate" => in_certificate = !in_encryption_key,
                _ => {}
            },
            Event::Text(t) if in_certificate => {
                let text = t.unescape().map_err(xml_error)?;
                metadata.certificates.push(pem_body(&text));
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"X509Certificate" => in_certificate = false,
                b"KeyDescriptor" => in_encryption_key = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    metadata.sso_url = if redirect_url.is_empty() { any_url } else { redirect_url };
    if metadata.entity_id.is_empty() || metadata.sso_url.is_empty() {
        return Err(AuthError::BadRequest(
            "idp metadata must declare an entityID and a SingleSignOnService".to_string(),
        ));
    }
    Ok(metadata)
}

/// SP metadata document served at the metadata URL.
pub fn sp_metadata(sp: &ServiceProvider) -> String {
    let key = if sp.certificate.is_empty() {
        String::new()
    } else {
        format!(
            r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
            sp.certificate
        )
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity}"><md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">{key}<md:NameIDFormat>urn:oasis:names:tc:SAML:2.0:nameid-format:transient</md:NameIDFormat><md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs}" index="1"/></md:SPSSODescriptor></md:EntityDescriptor>"#,
        entity = escape(&sp.entity_id),
        key = key,
        acs = escape(&sp.acs_url),
    )
}

fn authn_request(sp: &ServiceProvider) -> String {
    format!(
        r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_{id}" Version="2.0" IssueInstant="{now}" Destination="{dest}" AssertionConsumerServiceURL="{acs}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"><saml:Issuer>{issuer}</saml:Issuer><samlp:NameIDPolicy AllowCreate="true" Format="urn:oasis:names:tc:SAML:2.0:nameid-format:transient"/></samlp:AuthnRequest>"#,
        id = Uuid::new_v4(),
        now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        dest = escape(&sp.idp.sso_url),
        acs = escape(&sp.acs_url),
        issuer = escape(&sp.entity_id),
    )
}

/// IdP redirect URL carrying a deflated, encoded AuthnRequest.
pub fn redirect_binding_url(sp: &ServiceProvider, relay_state: &str) -> Result<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    let encode_error = |e: std::io::Error| AuthError::Internal(format!("failed to encode authn request: {}", e));
    encoder.write_all(authn_request(sp).as_bytes()).map_err(encode_error)?;
    let deflated = encoder.finish().map_err(encode_error)?;
    let url = reqwest::Url::parse_with_params(
        &sp.idp.sso_url,
        &[
            ("SAMLRequest", STANDARD.encode(deflated)),
            ("RelayState", relay_state.to_string()),
        ],
    )
    .map_err(|e| AuthError::BadRequest(format!("invalid idp sso url: {}", e)))?;
    Ok(url.to_string())
}

pub fn new_relay_state() -> String {
    let bytes: Vec<u8> = (0..RELAY_STATE_BYTES).map(|_| rand::random::<u8>()).collect();
    URL_SAFE.encode(bytes)
}

/// What the assertion consumer extracted from a SAML response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamlAssertion {
    pub status: String,
    pub issuer: String,
    pub audiences: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// Set once the XML signature verified against the IdP metadata.
    pub signed: bool,
    /// Attribute values by `Name` and by `FriendlyName`.
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl SamlAssertion {
    pub fn values(&self, field: &str) -> &[String] {
        self.attributes.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub fn parse_response(xml: &str) -> Result<SamlAssertion> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut assertion = SamlAssertion::default();
    let mut stack: Vec<String> = Vec::new();
    let mut attribute_names: Vec<String> = Vec::new();
    let mut response_issuer = String::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "StatusCode" if assertion.status.is_empty() => {
                        assertion.status = attr(&e, "Value").unwrap_or_default();
                    }
                    "Conditions" => {
                        assertion.not_before = parse_time(attr(&e, "NotBefore"));
                        assertion.not_on_or_after = parse_time(attr(&e, "NotOnOrAfter"));
                    }
                    "Attribute" => {
                        attribute_names = ["Name", "FriendlyName"]
                            .iter()
                            .filter_map(|a| attr(&e, a))
                            .collect();
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => match local_name(&e).as_str() {
                "StatusCode" if assertion.status.is_empty() => {
                    assertion.status = attr(&e, "Value").unwrap_or_default();
                }
                "Conditions" => {
                    assertion.not_before = parse_time(attr(&e, "NotBefore"));
                    assertion.not_on_or_after = parse_time(attr(&e, "NotOnOrAfter"));
                }
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape().map_err(xml_error)?.into_owned();
                let parent = stack.iter().rev().nth(1).map(String::as_str);
                match stack.last().map(String::as_str) {
                    Some("Issuer") if parent == Some("Assertion") => assertion.issuer = text,
                    Some("Issuer") if parent == Some("Response") => response_issuer = text,
                    Some("Audience") => assertion.audiences.push(text),
                    Some("AttributeValue") => {
                        for name in &attribute_names {
                            assertion
                                .attributes
                                .entry(name.clone())
                                .or_default()
                                .push(text.clone());
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"Attribute" {
                    attribute_names.clear();
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if assertion.issuer.is_empty() {
        assertion.issuer = response_issuer;
    }
    Ok(assertion)
}

/// Decides whether a parsed response may be trusted.
pub trait AssertionVerifier: Send + Sync {
    fn verify(&self, sp: &ServiceProvider, assertion: &SamlAssertion, now: DateTime<Utc>) -> Result<()>;
}

/// Checks status, issuer, audience and validity window of an assertion whose
/// signature already verified.
#[derive(Debug, Default, Clone)]
pub struct ConditionsVerifier;

impl AssertionVerifier for ConditionsVerifier {
    fn verify(&self, sp: &ServiceProvider, assertion: &SamlAssertion, now: DateTime<Utc>) -> Result<()> {
        let denied = |msg: &str| Err(AuthError::Forbidden(msg.to_string()));
        if assertion.status != STATUS_SUCCESS {
            return denied("saml response status is not success");
        }
        if assertion.issuer != sp.idp.entity_id {
            return denied("saml response issuer does not match the idp");
        }
        if !assertion.audiences.is_empty() && !assertion.audiences.iter().any(|a| *a == sp.entity_id) {
            return denied("saml assertion is not meant for this service provider");
        }
        let skew = ChronoDuration::seconds(CLOCK_SKEW_SECS);
        if assertion.not_before.map_or(false, |t| now + skew < t)
            || assertion.not_on_or_after.map_or(false, |t| now - skew >= t)
        {
            return denied("saml assertion is outside its validity window");
        }
        if !assertion.signed {
            return denied("saml response is not signed");
        }
        Ok(())
    }
}

/// IdP redirect for a login, plus the state cookie to set alongside it.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub idp_redirect_url: String,
    pub state_cookie: String,
}

/// Result of consuming a posted assertion.
#[derive(Debug)]
pub struct AcsOutcome {
    pub redirect: String,
    pub action: Option<String>,
    pub user_id: Option<String>,
    pub result: Result<AuthResult>,
}

/// Where the browser goes after a failed assertion.
pub fn error_redirect(redirect: &str, err: &AuthError) -> String {
    let code = match err {
        AuthError::Forbidden(_) | AuthError::Unauthorized(_) => 403,
        _ => 500,
    };
    format!("{}/login?errorCode={}", redirect.trim_end_matches('/'), code)
}

pub struct SamlProvider {
    kind: ProviderKind,
    registry: SamlRegistry,
    signer: StateSigner,
    verifier: Arc<dyn AssertionVerifier>,
}

impl SamlProvider {
    pub fn new(kind: ProviderKind, registry: SamlRegistry, signer: StateSigner) -> Self {
        Self {
            kind,
            registry,
            signer,
            verifier: Arc::new(ConditionsVerifier),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn AssertionVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn service_provider(&self, config: &AuthConfig) -> Result<Arc<ServiceProvider>> {
        self.registry.init(self.kind, config)
    }

    pub fn metadata(&self, config: &AuthConfig) -> Result<String> {
        Ok(sp_metadata(&*self.service_provider(config)?))
    }

    /// Starts a login (or a test-and-enable run for `user_id`).
    pub fn login_request(
        &self,
        config: &AuthConfig,
        redirect: &str,
        user_id: Option<String>,
        action: Option<String>,
    ) -> Result<LoginRedirect> {
        let sp = self.service_provider(config)?;
        let relay_state = new_relay_state();
        let claims = StateClaims::new(relay_state.clone(), redirect.to_string(), user_id, action);
        let state_cookie = self.signer.sign(&claims)?;
        let idp_redirect_url = redirect_binding_url(&sp, &relay_state)?;
        debug!(provider = %self.kind, "saml login redirect issued");
        Ok(LoginRedirect {
            idp_redirect_url,
            state_cookie,
        })
    }

    /// Checks the relay state against the state cookie, then verifies and maps
    /// the assertion. Only a bad state is an error: anything later is
    /// reported inside the outcome so the caller can redirect.
    pub fn consume(
        &self,
        config: &AuthConfig,
        saml_response: &str,
        relay_state: &str,
        state_cookie: Option<&str>,
    ) -> Result<AcsOutcome> {
        let claims = self.signer.verify(state_cookie.unwrap_or_default())?;
        if claims.rs != relay_state {
            return Err(AuthError::Unauthorized("relay state does not match".to_string()));
        }

        let result = self.assertion_result(config, saml_response);
        if let Err(e) = &result {
            warn!("saml assertion for {} rejected: {}", self.kind, e);
        }
        Ok(AcsOutcome {
            redirect: claims.redirect,
            action: claims.action,
            user_id: claims.user_id,
            result,
        })
    }

    fn assertion_result(&self, config: &AuthConfig, saml_response: &str) -> Result<AuthResult> {
        let sp = self.service_provider(config)?;
        let raw = STANDARD
            .decode(saml_response.trim())
            .map_err(|e| AuthError::BadRequest(format!("invalid saml response encoding: {}", e)))?;
        let xml = String::from_utf8(raw)
            .map_err(|e| AuthError::BadRequest(format!("invalid saml response encoding: {}", e)))?;
        let outer = parse_response(&xml)?;
        // Only the signed element is read for identity; the status lives on the envelope.
        let trusted = dsig::verify(&xml, &sp.idp.certificates)?;
        let assertion = SamlAssertion {
            status: outer.status,
            signed: true,
            ..parse_response(&trusted)?
        };
        self.verifier.verify(&sp, &assertion, Utc::now())?;
        self.map_assertion(&sp.fields, &assertion)
    }

    fn map_assertion(&self, fields: &SamlConfig, assertion: &SamlAssertion) -> Result<AuthResult> {
        let uid = assertion
            .values(&fields.uid_field)
            .first()
            .cloned()
            .ok_or_else(|| AuthError::Forbidden(format!("saml assertion has no {} attribute", fields.uid_field)))?;
        let display_name = assertion
            .values(&fields.display_name_field)
            .first()
            .cloned()
            .unwrap_or_else(|| uid.clone());
        let login_name = assertion
            .values(&fields.user_name_field)
            .first()
            .cloned()
            .unwrap_or_default();

        let user_principal = Principal {
            display_name,
            login_name,
            me: true,
            ..Principal::user(format!("{}_user://{}", self.kind.name(), uid), self.kind.name())
        };
        let groups = assertion
            .values(&fields.groups_field)
            .iter()
            .map(|g| Principal {
                display_name: g.clone(),
                member_of: true,
                ..Principal::group(format!("{}_group://{}", self.kind.name(), g), self.kind.name())
            })
            .collect();
        Ok(AuthResult {
            user_principal,
            groups,
            provider_info: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl AuthProvider for SamlProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn authenticate(&self, _config: &AuthConfig, _input: &LoginInput) -> Result<AuthResult> {
        Err(AuthError::BadRequest(format!(
            "{} logins go through the identity provider redirect",
            self.kind
        )))
    }

    /// No directory to query: the search term itself is offered as a principal.
    async fn search(
        &self,
        _config: &AuthConfig,
        query: &str,
        principal_type: Option<PrincipalType>,
        _token: &Token,
    ) -> Result<Vec<Principal>> {
        let mut principals = Vec::new();
        if principal_type != Some(PrincipalType::Group) {
            principals.push(Principal {
                display_name: query.to_string(),
                ..Principal::user(format!("{}_user://{}", self.kind.name(), query), self.kind.name())
            });
        }
        if principal_type != Some(PrincipalType::User) {
            principals.push(Principal {
                display_name: query.to_string(),
                ..Principal::group(format!("{}_group://{}", self.kind.name(), query), self.kind.name())
            });
        }
        Ok(principals)
    }

    async fn get_principal(&self, _config: &AuthConfig, id: &str, _token: &Token) -> Result<Principal> {
        let (_, kind, external) = parse_principal_id(id)
            .ok_or_else(|| AuthError::BadRequest(format!("invalid id {}", id)))?;
        let principal = match kind {
            "user" => Principal::user(id, self.kind.name()),
            "group" => Principal::group(id, self.kind.name()),
            other => return Err(AuthError::NotFound(format!("unknown principal kind {}", other))),
        };
        Ok(Principal {
            display_name: external.to_string(),
            ..principal
        })
    }
}

#[cfg(test)]
mod tests {
    use super::dsig::testing::{TestIdp, SIGNATURE_SLOT};
    use super::*;

    const IDP_METADATA: &str = r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>
        MIIBsigning
      </ds:X509Certificate></ds:X509Data></ds:KeyInfo>
    </md:KeyDescriptor>
    <md:KeyDescriptor use="encryption">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>MIIBencrypt</ds:X509Certificate></ds:X509Data></ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/post"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/sso"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#;

    fn config(version: u64) -> AuthConfig {
        config_with(version, IDP_METADATA.to_string())
    }

    /// Metadata pinning the given base64 signing certificates.
    fn config_for(certificates: &[&str]) -> AuthConfig {
        let keys: String = certificates
            .iter()
            .map(|c| format!(r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{c}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#))
            .collect();
        config_with(
            1,
            format!(
                r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com"><md:IDPSSODescriptor>{keys}<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/sso"/></md:IDPSSODescriptor></md:EntityDescriptor>"#
            ),
        )
    }

    fn config_with(version: u64, metadata: String) -> AuthConfig {
        let mut config = AuthConfig::new(
            ProviderKind::Okta,
            ProviderConfig::SamlConfig(SamlConfig {
                idp_metadata_content: metadata,
                rancher_api_host: "https://corral.example.com".into(),
                uid_field: "uid".into(),
                display_name_field: "displayName".into(),
                user_name_field: "userName".into(),
                groups_field: "groups".into(),
                ..Default::default()
            }),
        );
        config.metadata.resource_version = version;
        config
    }

    fn unsigned_response(issuer: &str, uid: &str) -> String {
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">
  <saml:Issuer>{issuer}</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_assertion1">
    <saml:Issuer>{issuer}</saml:Issuer>
    {SIGNATURE_SLOT}
    <saml:Conditions>
      <saml:AudienceRestriction><saml:Audience>https://corral.example.com/v1-saml/okta/saml/metadata</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AttributeStatement>
      <saml:Attribute Name="urn:oid:0.9.2342.19200300.100.1.1" FriendlyName="uid"><saml:AttributeValue>{uid}</saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="displayName"><saml:AttributeValue>Eve Example</saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="groups"><saml:AttributeValue>admins</saml:AttributeValue><saml:AttributeValue>devs</saml:AttributeValue></saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#
        )
    }

    fn response(idp: &TestIdp, issuer: &str) -> String {
        STANDARD.encode(idp.sign(&unsigned_response(issuer, "eve"), "Assertion", "_assertion1"))
    }

    fn consume_result(config: &AuthConfig, saml_response: &str) -> Result<AuthResult> {
        let p = provider();
        let login = p.login_request(config, "https://ui", None, None).unwrap();
        let claims = StateSigner::new(b"state").verify(&login.state_cookie).unwrap();
        let outcome = p
            .consume(config, saml_response, &claims.rs, Some(&login.state_cookie))
            .unwrap();
        outcome.result
    }

    fn provider() -> SamlProvider {
        SamlProvider::new(ProviderKind::Okta, SamlRegistry::new(), StateSigner::new(b"state"))
    }

    #[test]
    fn idp_metadata_prefers_redirect_binding() {
        let idp = parse_idp_metadata(IDP_METADATA).unwrap();
        assert_eq!(idp.entity_id, "https://idp.example.com");
        assert_eq!(idp.sso_url, "https://idp.example.com/sso");
        assert_eq!(idp.certificates, vec!["MIIBsigning"]);
        assert!(parse_idp_metadata("<md:EntityDescriptor/>").is_err());
    }

    #[test]
    fn reinit_with_same_version_is_noop() {
        let registry = SamlRegistry::new();
        let first = registry.init(ProviderKind::Okta, &config(3)).unwrap();
        let again = registry.init(ProviderKind::Okta, &config(3)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        let bumped = registry.init(ProviderKind::Okta, &config(4)).unwrap();
        assert!(!Arc::ptr_eq(&first, &bumped));
        assert_eq!(first.acs_url, "https://corral.example.com/v1-saml/okta/saml/acs");
    }

    #[test]
    fn relay_state_round_trip() {
        let idp = TestIdp::new();
        let config = config_for(&[idp.certificate.as_str()]);
        let p = provider();
        let login = p
            .login_request(&config, "https://corral.example.com", None, None)
            .unwrap();
        let url = reqwest::Url::parse(&login.idp_redirect_url).unwrap();
        assert_eq!(url.path(), "/sso");
        let relay: String = url
            .query_pairs()
            .find(|(k, _)| k == "RelayState")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(URL_SAFE.decode(&relay).unwrap().len(), RELAY_STATE_BYTES);

        let outcome = p
            .consume(&config, &response(&idp, "https://idp.example.com"), &relay, Some(&login.state_cookie))
            .unwrap();
        assert_eq!(outcome.redirect, "https://corral.example.com");
        let result = outcome.result.unwrap();
        assert_eq!(result.user_principal.id, "okta_user://eve");
        assert_eq!(result.user_principal.display_name, "Eve Example");
        let groups: Vec<&str> = result.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(groups, vec!["okta_group://admins", "okta_group://devs"]);

        assert!(p
            .consume(&config, &response(&idp, "https://idp.example.com"), "forged", Some(&login.state_cookie))
            .is_err());
    }

    #[test]
    fn untrusted_assertions_redirect_with_403() {
        let idp = TestIdp::new();
        let config = config_for(&[idp.certificate.as_str()]);

        let p = provider();
        let login = p.login_request(&config, "https://ui", None, None).unwrap();
        let claims = StateSigner::new(b"state").verify(&login.state_cookie).unwrap();
        let outcome = p
            .consume(&config, &response(&idp, "https://evil.example.com"), &claims.rs, Some(&login.state_cookie))
            .unwrap();
        let err = outcome.result.unwrap_err();
        assert_eq!(error_redirect(&outcome.redirect, &err), "https://ui/login?errorCode=403");

        let impostor = TestIdp::new();
        let err = consume_result(&config, &response(&impostor, "https://idp.example.com")).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
        assert_eq!(error_redirect("https://ui", &err), "https://ui/login?errorCode=403");
    }

    #[test]
    fn forged_assertions_are_rejected() {
        let idp = TestIdp::new();
        let config = config_for(&[idp.certificate.as_str()]);

        // Unsigned, but carrying a copy of the IdP certificate.
        let unsigned = unsigned_response("https://idp.example.com", "eve").replace(
            SIGNATURE_SLOT,
            &format!(
                r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#,
                idp.certificate
            ),
        );
        let err = consume_result(&config, &STANDARD.encode(unsigned)).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));

        let signed = idp.sign(&unsigned_response("https://idp.example.com", "eve"), "Assertion", "_assertion1");
        let tampered = signed.replace(">eve<", ">root<");
        let err = consume_result(&config, &STANDARD.encode(tampered)).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));

        // Metadata without signing keys cannot vouch for anything.
        let err = consume_result(&config_for(&[]), &STANDARD.encode(signed)).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
    }

    #[test]
    fn any_pinned_certificate_may_sign() {
        let old = TestIdp::new();
        let rotated = TestIdp::new();
        let config = config_for(&[old.certificate.as_str(), rotated.certificate.as_str()]);

        let result = consume_result(&config, &response(&rotated, "https://idp.example.com")).unwrap();
        assert_eq!(result.user_principal.id, "okta_user://eve");
    }

    #[test]
    fn sp_metadata_lists_acs() {
        let p = provider();
        let xml = p.metadata(&config(1)).unwrap();
        assert!(xml.contains(r#"Location="https://corral.example.com/v1-saml/okta/saml/acs""#));
        assert!(xml.contains(r#"entityID="https://corral.example.com/v1-saml/okta/saml/metadata""#));
    }
}
