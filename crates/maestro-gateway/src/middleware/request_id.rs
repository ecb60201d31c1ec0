//! Request and trace id propagation.
//!
//! Inbound `X-Request-Id` / `X-Trace-Id` headers are honoured when
//! syntactically valid, otherwise fresh ids are generated. Both are echoed
//! on the response and stored in a request extension every downstream
//! component reads.

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// Header names.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Per-request identifiers, available as an [`axum::Extension`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: String,
}

fn is_valid_id(id: &str) -> bool {
    (8..=128).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn id_from_headers(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_valid_id(id))
        .map(String::from)
}

/// Middleware: attach ids to the request, echo them on the response.
pub async fn propagate_ids(mut request: Request, next: Next) -> Response {
    let request_id = id_from_headers(request.headers(), REQUEST_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let trace_id = id_from_headers(request.headers(), TRACE_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let context = RequestContext {
        request_id: request_id.clone(),
        trace_id: trace_id.clone(),
    };
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_shape_validation() {
        assert!(is_valid_id("trace-1234"));
        assert!(is_valid_id(&Uuid::new_v4().to_string()));
        assert!(!is_valid_id("short"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id(&"x".repeat(129)));
    }
}
