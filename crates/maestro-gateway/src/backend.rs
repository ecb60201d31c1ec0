//! External-collaborator seams: goal planning and chat routing.
//!
//! Both are contracts the gateway depends on but does not implement in
//! depth — the production planner and chat provider live behind these
//! traits. The in-tree implementations are the minimal ones the product
//! ships with in development mode.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::validate::ChatBody;
use maestro_kernel::plan::PlanStep;
use maestro_kernel::subject::Subject;

/// Turns a free-form goal into an ordered step sequence.
pub trait GoalPlanner: Send + Sync {
    fn plan_steps(&self, goal: &str) -> Vec<PlanStep>;
}

/// Fallback planner: one agent-run step carrying the goal verbatim.
///
/// Production deployments replace this with an LLM-backed planner; the
/// orchestrator's contract only requires that a plan has at least one
/// step.
pub struct SingleStepPlanner;

impl GoalPlanner for SingleStepPlanner {
    fn plan_steps(&self, goal: &str) -> Vec<PlanStep> {
        let mut step = PlanStep::new("step-1", goal, "agent.run");
        step.capability = "tool.execute".to_string();
        step.capability_label = "Execute tools".to_string();
        step.input
            .insert("goal".to_string(), Value::String(goal.to_string()));
        vec![step]
    }
}

/// The LLM chat-routing provider contract (`RouteChat`).
#[async_trait]
pub trait ChatRouter: Send + Sync {
    async fn route_chat(&self, request: &ChatBody, subject: Option<&Subject>) -> ApiResult<Value>;
}

/// Placeholder router used when no provider is configured: every request
/// surfaces as `upstream_error`.
pub struct UnroutedChat;

#[async_trait]
impl ChatRouter for UnroutedChat {
    async fn route_chat(&self, _request: &ChatBody, _subject: Option<&Subject>) -> ApiResult<Value> {
        Err(ApiError::Upstream(
            "no chat provider configured".to_string(),
        ))
    }
}
