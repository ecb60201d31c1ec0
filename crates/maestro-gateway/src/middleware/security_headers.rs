//! Hardening headers applied to every response.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

const HSTS: &str = "max-age=31536000; includeSubDomains";

/// Middleware: set standard security headers. HSTS is added only when the
/// deployment serves TLS (`hsts` flag, wired from `server.secure_cookies`).
///
/// Use with a capturing closure:
/// `middleware::from_fn(move |req, next| security_headers::apply(hsts, req, next))`.
pub async fn apply(hsts: bool, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    if hsts {
        headers.insert("strict-transport-security", HeaderValue::from_static(HSTS));
    }
    response
}
