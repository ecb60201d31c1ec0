//! Chat routing endpoint.
//!
//! `POST /chat` validates the message list and delegates to the
//! [`ChatRouter`](crate::backend::ChatRouter) seam; the LLM provider
//! itself is an external collaborator.

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use super::caller_identity;
use crate::error::{ApiError, ApiResult};
use crate::middleware::{client_ip, EndpointBucket, RequestContext, SessionContext};
use crate::state::AppState;
use crate::validate::{validate_chat, ChatBody};
use maestro_kernel::policy::HttpAction;

/// `POST /chat`
pub async fn route(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult<impl IntoResponse> {
    let subject = session.require_subject(state.oidc_enabled())?;

    validate_chat(&body).map_err(ApiError::InvalidRequest)?;

    let ip = client_ip(&headers, None);
    state.rate_limiter.check(
        EndpointBucket::Chat,
        caller_identity(subject).as_deref(),
        &ip,
    )?;

    let capabilities = ["chat.route".to_string()];
    let decision = state.policy.enforce_http_action(&HttpAction {
        action: "chat.route",
        required_capabilities: &capabilities,
        agent: None,
        trace_id: &ctx.trace_id,
        subject,
        run_mode: state.config.run_mode,
    });
    if !decision.allow {
        return Err(ApiError::policy_denied(decision.deny));
    }

    let response = state.chat.route_chat(&body, subject).await?;
    Ok(Json(json!({
        "response": response,
        "requestId": ctx.request_id,
        "traceId": ctx.trace_id,
    })))
}
