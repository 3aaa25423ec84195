//! Unified response envelope.
//!
//! Every response the gateway itself produces (errors, health, metrics, admin) is
//! wrapped as `{code, msg, data?, timestamp, request_id?}`. Proxied backend
//! responses pass through untouched.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Success code carried in `code` for 2xx envelopes.
pub const CODE_SUCCESS: i32 = 0;

tokio::task_local! {
    /// Request id of the request being served on this task.
    pub static REQUEST_ID: String;
}

/// Current request id, if the request-id middleware scoped one.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Wire shape of an enveloped response.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    /// Envelope with code 0 and message `success`.
    pub fn success(data: T) -> Self {
        Self::with_code(CODE_SUCCESS, "success", Some(data))
    }

    /// Envelope with an explicit code and message.
    pub fn with_code(code: i32, msg: impl Into<String>, data: Option<T>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data,
            timestamp: chrono::Utc::now().timestamp(),
            request_id: current_request_id(),
        }
    }

    /// Render with the given HTTP status.
    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        let status = if self.code == CODE_SUCCESS {
            StatusCode::OK
        } else {
            u16::try_from(self.code)
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        };
        self.into_response_with(status)
    }
}

/// Shorthand for a 200 envelope around `data`.
pub fn ok<T: Serialize>(data: T) -> Response {
    Envelope::success(data).into_response()
}
