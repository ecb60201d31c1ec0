//! Request-path middleware: id propagation, security headers, session
//! binding and rate limiting.

pub mod access_log;
pub mod body_limit;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;
pub mod session;

pub use rate_limit::{EndpointBucket, MemoryRateLimitBackend, RateLimitBackend, RateLimitManager};
pub use request_id::RequestContext;
pub use session::SessionContext;

use axum::http::HeaderMap;

/// Client IP for quota and rate-limit keying.
///
/// Prefers the first `x-forwarded-for` entry (the deployment fronts the
/// service with a trusted proxy), then `x-real-ip`, then the transport
/// peer recorded by `ConnectInfo`.
pub fn client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real = real.trim();
        if !real.is_empty() {
            return real.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer = "192.0.2.1:9999".parse().ok();
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let peer = "192.0.2.1:9999".parse().ok();
        assert_eq!(client_ip(&headers, peer), "192.0.2.1");
        assert_eq!(client_ip(&headers, None), "unknown");
    }
}
