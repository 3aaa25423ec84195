//! Error types: breaker call outcomes and the client-facing gateway taxonomy.
use std::fmt;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::config_store::ConfigStoreError;
use crate::response::Envelope;

/// Outcome of a call guarded by a circuit breaker when it did not produce `Ok`.
#[derive(Debug, Clone)]
pub enum CallError<E> {
    /// The call exceeded the command timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// Too many concurrent calls for this command.
    Rejected { in_flight: usize, max: usize },
    /// The breaker is open (or a half-open trial is already in flight).
    CircuitOpen { service: String, open_for: Duration },
    /// The call itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "call timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Rejected { in_flight, max } => {
                write!(f, "max concurrency reached ({} in-flight, max {})", in_flight, max)
            }
            Self::CircuitOpen { service, open_for } => {
                write!(f, "circuit open for '{}' (open for {:?})", service, open_for)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> CallError<E> {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    /// Check if the breaker short-circuited the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// Check if the concurrency limit rejected the call
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Every failure the gateway reports to a client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route for {path}")]
    Unrouted { path: String },

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Unauthorized(String),

    #[error("too many requests, retry later")]
    RateLimited { retry_after: Duration },

    #[error("service temporarily unavailable: {service}")]
    CircuitOpen { service: String, cause: String },

    #[error("no healthy instance of {service}: {reason}")]
    DiscoveryFailure { service: String, reason: String },

    #[error("permission check failed: {0}")]
    PolicyEngineUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config store: {0}")]
    ConfigStore(#[from] ConfigStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unrouted { .. } | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } | Self::DiscoveryFailure { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PolicyEngineUnavailable(_) | Self::ConfigStore(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = i32::from(status.as_u16());
        let data = match &self {
            Self::CircuitOpen { service, cause } => {
                Some(json!({ "service": service, "error": cause, "fallback": true }))
            }
            Self::DiscoveryFailure { service, reason } => {
                Some(json!({ "service": service, "error": reason, "fallback": true }))
            }
            _ => None,
        };
        let retry_after = match &self {
            Self::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };

        let mut resp = Envelope::with_code(code, self.to_string(), data).into_response_with(status);
        if let Some(secs) = retry_after {
            resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}
