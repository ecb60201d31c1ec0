//! Maps the body-limit layer's bare `413` into the uniform error envelope.

use axum::{extract::Request, middleware::Next, response::IntoResponse, response::Response};
use axum::http::StatusCode;

use crate::error::ApiError;

/// Middleware: rewrite `413 Payload Too Large` responses produced by the
/// inner body-limit layer so clients always see `{code, message, details}`.
pub async fn envelope(limit: usize, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge { limit }.into_response();
    }
    response
}
