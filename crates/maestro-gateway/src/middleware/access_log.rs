//! JSON access logging.
//!
//! One structured line per request on the `access` target, carrying the
//! method, path, status, duration and both request identifiers.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use super::request_id::RequestContext;

/// Middleware: log every request after it completes.
pub async fn log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ids = request.extensions().get::<RequestContext>().cloned();
    let start = Instant::now();

    let response = next.run(request).await;

    let (request_id, trace_id) = ids
        .map(|ctx| (ctx.request_id, ctx.trace_id))
        .unwrap_or_default();
    tracing::info!(
        target: "access",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        request_id = %request_id,
        trace_id = %trace_id,
    );
    response
}
