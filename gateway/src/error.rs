use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use corral::auth::AuthError;
use corral::dialer::DialError;
use corral::store::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No cluster available")]
    NoCluster,

    #[error("cluster {0} has no API endpoint")]
    NoEndpoint(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("invalid CA certificate for cluster {0}: {1}")]
    InvalidCa(String, String),

    #[error("error proxying to cluster {0}: {1}")]
    Upstream(String, String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(e) => GatewayError::Store(e),
            other => GatewayError::Unauthorized(other.to_string()),
        }
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoCluster => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Dial(DialError::Unauthorized) => StatusCode::UNAUTHORIZED,
            GatewayError::Dial(DialError::WaitingForAgent) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(..) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.status() {
            StatusCode::NOT_FOUND => "NotFound",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::BAD_REQUEST => "InvalidBodyContent",
            StatusCode::SERVICE_UNAVAILABLE => "ClusterUnavailable",
            _ => "ServerError",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("{}", self);
        }

        let body = Json(json!({
            "type": "error",
            "status": status.as_u16(),
            "code": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cluster_is_not_found() {
        let err = GatewayError::NoCluster;
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "No cluster available");
    }

    #[test]
    fn dial_failures_map_by_kind() {
        assert_eq!(
            GatewayError::from(DialError::WaitingForAgent).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from(DialError::NoDialer("c-1".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GatewayError::from(AuthError::Expired).status(), StatusCode::UNAUTHORIZED);
    }
}
