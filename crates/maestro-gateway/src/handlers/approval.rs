//! Operator approval endpoints.
//!
//! `POST /plan/{id}/steps/{step_id}/approve` and `.../reject` resolve a
//! step held in `waiting_approval`. The binding check uses the subject
//! identity, not the raw session id, so a rotated session for the same
//! user can still approve. Repeated calls after a terminal transition
//! return `409`.

use axum::{
    body::Bytes,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;

use super::{enforce_ownership, plan_owner};
use crate::error::{ApiError, ApiResult};
use crate::middleware::{client_ip, RequestContext, SessionContext};
use crate::state::AppState;
use crate::validate::{validate_approval, validate_plan_id, validate_step_id, ApprovalBody};
use maestro_kernel::audit::{self, AuditOutcome};
use maestro_kernel::plan::PlanStepState;
use maestro_kernel::policy::HttpAction;
use maestro_runtime::{ApprovalDecision, RuntimeError};

/// `POST /plan/{id}/steps/{step_id}/approve`
pub async fn approve(
    state: State<Arc<AppState>>,
    ctx: Extension<RequestContext>,
    session: Extension<SessionContext>,
    path: Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    resolve(state, ctx, session, path, headers, body, false).await
}

/// `POST /plan/{id}/steps/{step_id}/reject` — forces `decision = reject`.
pub async fn reject(
    state: State<Arc<AppState>>,
    ctx: Extension<RequestContext>,
    session: Extension<SessionContext>,
    path: Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    resolve(state, ctx, session, path, headers, body, true).await
}

/// The body is optional: an absent or empty body means "approve with no
/// rationale" (or reject, on the reject endpoint).
fn parse_body(body: &Bytes) -> Result<ApprovalBody, ApiError> {
    if body.is_empty() {
        return Ok(ApprovalBody::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        ApiError::InvalidRequest(vec![crate::validate::Issue::new(
            "body",
            format!("malformed JSON: {err}"),
        )])
    })
}

#[allow(clippy::too_many_arguments)]
async fn resolve(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(session): Extension<SessionContext>,
    Path((plan_id, step_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    force_reject: bool,
) -> ApiResult<impl IntoResponse> {
    let plan_id = validate_plan_id(&plan_id).map_err(ApiError::InvalidRequest)?;
    let step_id = validate_step_id(&step_id).map_err(ApiError::InvalidRequest)?;
    let body = parse_body(&body)?;
    let request = validate_approval(&body, force_reject).map_err(ApiError::InvalidRequest)?;

    let subject = session.require_subject(state.oidc_enabled())?;

    let owner = plan_owner(&state, plan_id.as_str()).await?;
    if let Err(err) = enforce_ownership(owner.as_ref(), subject, "approval subject mismatch") {
        audit::record(
            "plan.step.approve",
            AuditOutcome::Denied,
            &ctx.trace_id,
            Some(&ctx.request_id),
            subject,
            Some(&client_ip(&headers, None)),
            "approval subject mismatch",
        );
        return Err(err);
    }

    let capabilities = ["plan.approve".to_string()];
    let decision = state.policy.enforce_http_action(&HttpAction {
        action: if request.approve {
            "plan.step.approve"
        } else {
            "plan.step.reject"
        },
        required_capabilities: &capabilities,
        agent: None,
        trace_id: &ctx.trace_id,
        subject,
        run_mode: state.config.run_mode,
    });
    if !decision.allow {
        return Err(ApiError::policy_denied(decision.deny));
    }

    // Check step state from the bus first; fall back to the store for
    // plans whose history ring has already evicted the step.
    let current_state = match state
        .runtime
        .bus()
        .latest_step_event(plan_id.as_str(), &step_id)
    {
        Some(event) => Some(event.step.state),
        None => state
            .runtime
            .store()
            .get_entry(plan_id.as_str(), &step_id)
            .await
            .map_err(|err| ApiError::Upstream(format!("state store failed: {err}")))?
            .map(|entry| entry.state),
    };
    let Some(current_state) = current_state else {
        return Err(ApiError::NotFound("step".to_string()));
    };
    if current_state != PlanStepState::WaitingApproval {
        return Err(ApiError::Conflict(
            "step is not awaiting approval".to_string(),
        ));
    }

    let summary = match (&request.rationale, request.approve) {
        (Some(rationale), true) => format!("Approved: {rationale}"),
        (Some(rationale), false) => format!("Rejected: {rationale}"),
        (None, true) => "Approved".to_string(),
        (None, false) => "Rejected".to_string(),
    };
    let decision = if request.approve {
        ApprovalDecision::Approve
    } else {
        ApprovalDecision::Reject
    };

    match state
        .runtime
        .resolve_approval(plan_id.as_str(), &step_id, decision, Some(summary))
        .await
    {
        Ok(()) => {}
        Err(RuntimeError::Conflict(message)) => return Err(ApiError::Conflict(message)),
        Err(RuntimeError::NotFound(what)) => return Err(ApiError::NotFound(what)),
        Err(err) => return Err(err.into()),
    }

    let ip = client_ip(&headers, None);
    audit::record(
        if request.approve {
            "plan.step.approve"
        } else {
            "plan.step.reject"
        },
        if request.approve {
            AuditOutcome::Approved
        } else {
            AuditOutcome::Rejected
        },
        &ctx.trace_id,
        Some(&ctx.request_id),
        subject,
        Some(&ip),
        &format!("{plan_id}/{step_id}"),
    );

    Ok(StatusCode::NO_CONTENT)
}
