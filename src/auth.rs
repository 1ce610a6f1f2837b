// Authentication core: tokens, users and identity providers

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::{Alphanumeric, Slice};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::ApiError;
use crate::store::StoreError;

pub mod providers;
pub mod tokens;
pub mod users;

pub use providers::{AuthProvider, AuthResult, LoginInput, Providers};
pub use tokens::TokenManager;
pub use users::UserManager;

pub const COOKIE_NAME: &str = "R_SESS";
pub const IMPERSONATE_USER_HEADER: &str = "Impersonate-User";
pub const IMPERSONATE_GROUP_HEADER: &str = "Impersonate-Group";

const TOKEN_KEY_LEN: usize = 32;
const NAME_SUFFIX_LEN: usize = 5;
const NAME_ALPHABET: &[char] = &[
    'b', 'c', 'd', 'f', 'g', 'h', 'j', 'k', 'l', 'm', 'n', 'p', 'q', 'r', 's', 't', 'v', 'w', 'x',
    'z', '2', '4', '5', '6', '7', '8', '9',
];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("Invalid auth token value")]
    InvalidToken,

    #[error("Auth Token has expired")]
    Expired,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    /// Upstream identity provider failure; the detail is for logs only.
    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl AuthError {
    pub fn is_not_found(&self) -> bool {
        match self {
            AuthError::NotFound(_) => true,
            AuthError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized(msg) => ApiError::Unauthorized(msg),
            AuthError::InvalidToken => ApiError::Unauthorized(e.to_string()),
            AuthError::Expired => ApiError::Gone(e.to_string()),
            AuthError::NotFound(msg) => ApiError::NotFound(msg),
            AuthError::Forbidden(msg) => ApiError::Forbidden(msg),
            AuthError::BadRequest(msg) => ApiError::BadRequest(msg),
            AuthError::Conflict(msg) => ApiError::Conflict(msg),
            AuthError::Provider(detail) => {
                warn!("identity provider error: {}", detail);
                ApiError::Unauthorized("unauthorized".to_string())
            }
            AuthError::Store(e) => e.into(),
            AuthError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

pub fn hash_password(password: &str) -> std::result::Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

pub fn verify_password(password: &str, hash: &str) -> std::result::Result<bool, bcrypt::BcryptError> {
    bcrypt::verify(password, hash)
}

/// Secret half of a token.
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_KEY_LEN)
        .map(char::from)
        .collect()
}

/// `prefix` plus a short random suffix, e.g. `token-x7k2q`.
pub fn generate_name(prefix: &str) -> String {
    let Ok(alphabet) = Slice::new(NAME_ALPHABET) else {
        return prefix.to_string();
    };
    let suffix: String = rand::thread_rng()
        .sample_iter(alphabet)
        .take(NAME_SUFFIX_LEN)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// `<name>:<key>` from `Authorization: Bearer` or the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == COOKIE_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value carrying a session token.
pub fn session_cookie(value: &str, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly", COOKIE_NAME, value);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value removing the session cookie.
pub fn expired_session_cookie(secure: bool) -> String {
    let mut cookie = format!(
        "{}=; Path=/; HttpOnly; Max-Age=-1; Expires=Wed, 10 Feb 1982 23:00:00 GMT",
        COOKIE_NAME
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateClaims {
    /// Relay state this cookie answers for.
    pub rs: String,
    #[serde(default)]
    pub redirect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

impl StateClaims {
    pub fn new(relay_state: String, redirect: String, user_id: Option<String>, action: Option<String>) -> Self {
        let now = Utc::now();
        let exp = now + Duration::minutes(10);

        Self {
            rs: relay_state,
            redirect,
            user_id,
            action,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        }
    }
}

/// Signs the short-lived login-state cookies used by redirect-based providers.
#[derive(Clone)]
pub struct StateSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl StateSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Random per-process secret.
    pub fn random() -> Self {
        let secret: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
        Self::new(&secret)
    }

    pub fn sign(&self, claims: &StateClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign state: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<StateClaims> {
        decode::<StateClaims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|_| AuthError::Unauthorized("invalid login state".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b; R_SESS=token-1:cookie"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("token-1:cookie"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token-2:bearer"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("token-2:bearer"));
    }

    #[test]
    fn generated_names_and_keys() {
        let name = generate_name("token-");
        assert!(name.starts_with("token-"));
        assert_eq!(name.len(), "token-".len() + NAME_SUFFIX_LEN);
        let key = generate_key();
        assert_eq!(key.len(), TOKEN_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn state_signer_rejects_foreign_signature() {
        let claims = StateClaims::new("rs".into(), "https://ui".into(), None, None);
        let signed = StateSigner::new(b"one").sign(&claims).unwrap();
        assert_eq!(StateSigner::new(b"one").verify(&signed).unwrap(), claims);
        assert!(StateSigner::new(b"two").verify(&signed).is_err());
    }

    #[test]
    fn cookies_carry_attributes() {
        assert_eq!(session_cookie("t:k", true), "R_SESS=t:k; Path=/; HttpOnly; Secure");
        assert!(expired_session_cookie(false).contains("Max-Age=-1"));
    }
}
