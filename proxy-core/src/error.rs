//! Error types and HTTP response conversion
//!
//! Variants map to the dispositions in the error-handling table: each carries
//! both an HTTP-side `IntoResponse` mapping (for the admin surface and for
//! HTTP-speaking flows) and a disposition for non-HTTP flows, applied by the
//! slow-path processor. Errors never cross flow boundaries: a `FlowError`
//! returned from one connection's processing is caught and converted to a
//! counter increment + teardown at that flow's worker, never propagated.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Covers both admin-surface failures and the
/// process-level ambient concerns (config, I/O, control-plane).
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control-plane error: {0}")]
    ControlPlane(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[cfg(feature = "redis-backend")]
    #[error("redis error: {0}")]
    Redis(Box<redis::RedisError>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

/// Disposition of an error encountered while processing a single flow.
/// Distinct from [`Error`]
/// because a flow error is always scoped to one connection and must never
/// propagate beyond its owning worker.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("WAF blocked request: score={score} threshold={threshold}")]
    WafBlocked { score: u32, threshold: u32 },

    #[error("rate limit exceeded: tier={tier}")]
    RateLimitExceeded { tier: String },

    #[error("identity is blocklisted")]
    Blocklisted,

    #[error("upstream connect failed after {attempts} attempts: {reason}")]
    UpstreamConnectFailed { attempts: u32, reason: String },

    #[error("upstream connection failed mid-flight: {0}")]
    UpstreamIoFailed(String),

    #[error("no rule matched this flow")]
    NoRuleMatched,

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl FlowError {
    /// HTTP status code to send before closing, when the flow speaks HTTP.
    pub fn http_status(&self) -> StatusCode {
        match self {
            FlowError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            FlowError::TlsHandshakeFailed(_) => StatusCode::BAD_REQUEST,
            FlowError::WafBlocked { .. } => StatusCode::FORBIDDEN,
            FlowError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            FlowError::Blocklisted => StatusCode::FORBIDDEN,
            FlowError::UpstreamConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            FlowError::UpstreamIoFailed(_) => StatusCode::BAD_GATEWAY,
            FlowError::NoRuleMatched => StatusCode::FORBIDDEN,
            FlowError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether a non-HTTP flow should be closed with a clean TCP reset
    /// (vs. a protocol-specific alert, e.g. TLS).
    pub fn reset_on_non_http(&self) -> bool {
        !matches!(self, FlowError::TlsHandshakeFailed(_))
    }
}

/// Error response body for the admin surface.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self { error: error.into(), code: None, status: status.as_u16() }
    }

    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self { error: error.into(), code: Some(code.into()), status: status.as_u16() }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Error::Config(e) => {
                tracing::error!("configuration error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", e.to_string()),
                )
            }
            Error::Io(e) => {
                tracing::error!("I/O error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", "I/O operation failed"),
                )
            }
            Error::ControlPlane(msg) => {
                tracing::warn!("control-plane error: {msg}");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "CONTROL_PLANE_ERROR", msg),
                )
            }
            Error::Tls(msg) => {
                tracing::warn!("TLS error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "TLS_ERROR", msg),
                )
            }
            #[cfg(feature = "redis-backend")]
            Error::Redis(e) => {
                tracing::error!("redis error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR", "cache operation failed"),
                )
            }
            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),
            Error::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal server error"),
                )
            }
            Error::Other(msg) => {
                tracing::error!("unexpected error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "an unexpected error occurred"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_error_http_status_mapping() {
        assert_eq!(FlowError::AuthFailed("x".into()).http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            FlowError::WafBlocked { score: 60, threshold: 50 }.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            FlowError::RateLimitExceeded { tier: "global".into() }.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(FlowError::Blocklisted.http_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_tls_failure_is_not_a_plain_reset() {
        assert!(!FlowError::TlsHandshakeFailed("bad cert".into()).reset_on_non_http());
        assert!(FlowError::AuthFailed("x".into()).reset_on_non_http());
    }

    #[test]
    fn test_error_response_with_code() {
        let err = ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD", "nope");
        assert_eq!(err.status, 400);
        assert_eq!(err.code, Some("BAD".to_string()));
    }
}
