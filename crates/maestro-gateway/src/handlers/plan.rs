//! Plan creation endpoint.
//!
//! `POST /plan` validates the goal (and optional explicit steps), derives
//! the step sequence through the planner seam when none are given, and
//! hands the plan to the runtime. A broker failure after validation
//! surfaces as `502 upstream_error`; the runtime has already rolled its
//! reservations back by then.

use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::caller_identity;
use crate::error::{ApiError, ApiResult};
use maestro_kernel::audit::{self, AuditOutcome};
use crate::middleware::{client_ip, EndpointBucket, RequestContext, SessionContext};
use crate::state::AppState;
use crate::validate::{validate_goal, Issue};
use maestro_kernel::plan::{is_valid_step_id, Plan, PlanId, PlanStep};
use maestro_kernel::policy::HttpAction;
use maestro_kernel::subject::Subject;
use maestro_runtime::RuntimeError;

/// Request body for `POST /plan`.
#[derive(Debug, Deserialize)]
pub struct CreatePlanBody {
    pub goal: String,
    /// Explicit steps; when absent the planner derives them from the goal.
    #[serde(default)]
    pub steps: Option<Vec<StepSpec>>,
}

/// One explicit step in a plan-creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub action: String,
    pub tool: String,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub capability_label: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub approval_required: bool,
}

/// Response body for `POST /plan`.
#[derive(Debug, Serialize)]
pub struct CreatePlanResponse {
    pub plan: PlanView,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
}

/// Client-facing plan shape (owner identity stays server-side).
#[derive(Debug, Serialize)]
pub struct PlanView {
    pub id: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub created_at: chrono::DateTime<Utc>,
    pub trace_id: String,
}

fn steps_from_specs(specs: &[StepSpec]) -> Result<Vec<PlanStep>, Vec<Issue>> {
    let mut issues = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for (index, spec) in specs.iter().enumerate() {
        if !is_valid_step_id(&spec.id) {
            issues.push(Issue::new(
                format!("steps.{index}.id"),
                "must be 1-64 characters of [A-Za-z0-9._-]",
            ));
        } else if !seen.insert(spec.id.as_str()) {
            issues.push(Issue::new(
                format!("steps.{index}.id"),
                "duplicate step id",
            ));
        }
        if spec.action.trim().is_empty() {
            issues.push(Issue::new(format!("steps.{index}.action"), "must not be empty"));
        }
        if spec.tool.trim().is_empty() {
            issues.push(Issue::new(format!("steps.{index}.tool"), "must not be empty"));
        }
    }
    if specs.is_empty() {
        issues.push(Issue::new("steps", "must contain at least one step"));
    }
    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(specs
        .iter()
        .map(|spec| PlanStep {
            id: spec.id.clone(),
            action: spec.action.trim().to_string(),
            tool: spec.tool.trim().to_string(),
            capability: spec
                .capability
                .clone()
                .unwrap_or_else(|| "tool.execute".to_string()),
            capability_label: spec.capability_label.clone().unwrap_or_default(),
            labels: spec.labels.clone(),
            input: spec.input.clone(),
            metadata: spec.metadata.clone(),
            timeout_seconds: spec.timeout_seconds.unwrap_or(120),
            approval_required: spec.approval_required,
        })
        .collect())
}

/// `POST /plan`
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Json(body): Json<CreatePlanBody>,
) -> ApiResult<impl IntoResponse> {
    let subject = session.require_subject(state.oidc_enabled())?;

    let goal = validate_goal(&body.goal).map_err(ApiError::InvalidRequest)?;
    let steps = match &body.steps {
        Some(specs) => steps_from_specs(specs).map_err(ApiError::InvalidRequest)?,
        None => state.planner.plan_steps(&goal),
    };

    let ip = client_ip(&headers, None);
    state.rate_limiter.check(
        EndpointBucket::Plan,
        caller_identity(subject).as_deref(),
        &ip,
    )?;

    let capabilities = ["plan.create".to_string()];
    let decision = state.policy.enforce_http_action(&HttpAction {
        action: "plan.create",
        required_capabilities: &capabilities,
        agent: None,
        trace_id: &ctx.trace_id,
        subject,
        run_mode: state.config.run_mode,
    });
    if !decision.allow {
        audit::record(
            "plan.create",
            AuditOutcome::Denied,
            &ctx.trace_id,
            Some(&ctx.request_id),
            subject,
            Some(&ip),
            "capability denied",
        );
        return Err(ApiError::policy_denied(decision.deny));
    }

    let owner = subject
        .cloned()
        .unwrap_or_else(|| Subject::anonymous(format!("anon-{}", Uuid::new_v4())));
    let plan = Plan {
        id: PlanId::generate(),
        goal,
        steps,
        owner,
        created_at: Utc::now(),
        trace_id: ctx.trace_id.clone(),
    };

    match state
        .runtime
        .submit(&plan, Some(ctx.request_id.clone()))
        .await
    {
        Ok(()) => {}
        Err(RuntimeError::Duplicate(key)) => {
            return Err(ApiError::Conflict(format!("duplicate submission: {key}")))
        }
        Err(err) => return Err(err.into()),
    }

    let response = CreatePlanResponse {
        plan: PlanView {
            id: plan.id.to_string(),
            goal: plan.goal,
            steps: plan.steps,
            created_at: plan.created_at,
            trace_id: plan.trace_id,
        },
        request_id: ctx.request_id,
        trace_id: ctx.trace_id,
    };
    Ok((StatusCode::CREATED, Json(response)))
}
