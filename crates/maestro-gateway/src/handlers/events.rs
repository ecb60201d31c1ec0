//! Plan event access: JSON history replay and live SSE streaming.
//!
//! `GET /plan/{id}/events` serves both modes from one route, switched on
//! the `Accept` header. The SSE path acquires a quota slot, replays the
//! history snapshot, then forwards live bus events; the snapshot and the
//! subscription are taken in one bus critical section so the handoff
//! neither drops nor duplicates events. The quota slot is released
//! exactly once however the stream ends — client disconnect, slow-consumer
//! drop, or server shutdown — because the guard rides inside the stream.

use axum::{
    extract::{Extension, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use super::{caller_identity, enforce_ownership, plan_owner};
use crate::error::{ApiError, ApiResult};
use maestro_kernel::audit::{self, AuditOutcome};
use crate::middleware::{client_ip, EndpointBucket, RequestContext, SessionContext};
use crate::state::AppState;
use crate::validate::validate_plan_id;
use maestro_kernel::bus::PlanStepEvent;
use maestro_kernel::policy::HttpAction;

/// `GET /plan/{id}/events`
pub async fn events(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(session): Extension<SessionContext>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let plan_id = validate_plan_id(&plan_id).map_err(ApiError::InvalidRequest)?;
    let subject = session.require_subject(state.oidc_enabled())?;

    let ip = client_ip(&headers, None);
    state.rate_limiter.check(
        EndpointBucket::Plan,
        caller_identity(subject).as_deref(),
        &ip,
    )?;

    let owner = plan_owner(&state, plan_id.as_str()).await?;
    if let Err(err) = enforce_ownership(owner.as_ref(), subject, "subject does not match plan owner")
    {
        audit::record(
            "plan.events",
            AuditOutcome::Denied,
            &ctx.trace_id,
            Some(&ctx.request_id),
            subject,
            Some(&ip),
            "subject does not match plan owner",
        );
        return Err(err);
    }

    let capabilities = ["plan.read".to_string()];
    let decision = state.policy.enforce_http_action(&HttpAction {
        action: "plan.events",
        required_capabilities: &capabilities,
        agent: None,
        trace_id: &ctx.trace_id,
        subject,
        run_mode: state.config.run_mode,
    });
    if !decision.allow {
        return Err(ApiError::policy_denied(decision.deny));
    }

    let wants_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false);

    if wants_sse {
        stream_events(&state, plan_id.as_str(), caller_identity(subject), &ip)
    } else {
        Ok(history_response(&state, plan_id.as_str(), &ctx))
    }
}

fn history_response(state: &Arc<AppState>, plan_id: &str, ctx: &RequestContext) -> Response {
    let events = state.runtime.bus().history(plan_id);
    let body = Json(json!({
        "events": events,
        "requestId": ctx.request_id,
        "traceId": ctx.trace_id,
    }));
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
        .headers_mut()
        .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn stream_events(
    state: &Arc<AppState>,
    plan_id: &str,
    subject_id: Option<String>,
    ip: &str,
) -> ApiResult<Response> {
    let guard = state
        .sse_quota
        .acquire(ip, subject_id.as_deref())
        .ok_or(ApiError::TooManyRequests {
            retry_after_ms: None,
        })?;

    let (history, subscription) = state.runtime.bus().subscribe_with_history(plan_id);
    let keep_alive_ms = state.config.server.sse_keep_alive_ms.max(1);

    let stream = futures::stream::iter(history)
        .chain(subscription)
        .map(move |event: PlanStepEvent| {
            // The guard rides the stream: dropped (and released) exactly
            // once when the connection tears down.
            let _hold = &guard;
            Ok::<Event, Infallible>(
                Event::default()
                    .event(PlanStepEvent::KIND)
                    .json_data(&event)
                    .unwrap_or_else(|_| Event::default().comment("event serialization failed")),
            )
        });

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_millis(keep_alive_ms))
            .text("keep-alive"),
    );
    Ok(sse.into_response())
}
