//! Gateway error types and the uniform wire envelope.
//!
//! Every user-visible failure serializes as `{code, message, details?}`.
//! Validation failures carry `[{path, message}]` issues in `details`;
//! policy denials carry the structured deny reasons. Stack traces and
//! internal error chains never reach the wire.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::validate::Issue;
use maestro_kernel::policy::DenyReason;
use maestro_runtime::RuntimeError;

/// API-facing errors, one variant per taxonomy code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("request validation failed")]
    InvalidRequest(Vec<Issue>),

    #[error("unauthorized")]
    Unauthorized(String),

    #[error("{message}")]
    Forbidden {
        message: String,
        deny: Vec<DenyReason>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large")]
    PayloadTooLarge { limit: usize },

    #[error("too many requests")]
    TooManyRequests { retry_after_ms: Option<u64> },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ApiError {
    /// Forbidden with the default subject-mismatch message.
    pub fn subject_mismatch() -> Self {
        Self::Forbidden {
            message: "subject does not match plan owner".to_string(),
            deny: Vec::new(),
        }
    }

    /// Forbidden carrying policy deny reasons.
    pub fn policy_denied(deny: Vec<DenyReason>) -> Self {
        Self::Forbidden {
            message: "capability denied".to_string(),
            deny,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::TooManyRequests { .. } => "too_many_requests",
            Self::Upstream(_) => "upstream_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidRequest(_) => "request validation failed".to_string(),
            Self::Unauthorized(message) => message.clone(),
            Self::Forbidden { message, .. } => message.clone(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::Conflict(message) => message.clone(),
            Self::PayloadTooLarge { .. } => "request body exceeds the configured limit".to_string(),
            Self::TooManyRequests { .. } => "too many requests".to_string(),
            Self::Upstream(message) => message.clone(),
            Self::Configuration(message) => message.clone(),
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidRequest(issues) => Some(json!(issues)),
            Self::Forbidden { deny, .. } if !deny.is_empty() => Some(json!(deny)),
            Self::PayloadTooLarge { limit } => Some(json!({ "limit": limit })),
            Self::TooManyRequests {
                retry_after_ms: Some(ms),
            } => Some(json!({ "retryAfterMs": ms })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code(),
            "message": self.message(),
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }
        (self.status(), Json(body)).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => Self::NotFound(what),
            RuntimeError::Conflict(message) => Self::Conflict(message),
            RuntimeError::Duplicate(key) => Self::Conflict(format!("duplicate submission: {key}")),
            RuntimeError::Queue(err) => Self::Upstream(format!("broker unavailable: {err}")),
            RuntimeError::Store(err) => Self::Upstream(format!("state store failed: {err}")),
            RuntimeError::Serialization(err) => Self::Upstream(format!("encoding failed: {err}")),
            other => Self::Upstream(other.to_string()),
        }
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
