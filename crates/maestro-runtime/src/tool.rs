//! The tool-agent contract.
//!
//! Tool execution is an external collaborator: the runtime hands it an
//! invocation and consumes a stream of [`ToolEvent`]s until a terminal one
//! arrives. Only the contract lives here; concrete transports (gRPC
//! sidecars, in-process handlers) implement [`ToolAgent`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// What the runtime sends to the tool agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub plan_id: String,
    pub step_id: String,
    /// Tool handler name.
    pub tool: String,
    /// Opaque tool input.
    pub input: Map<String, Value>,
    pub timeout_seconds: u64,
    pub trace_id: String,
}

/// Progress state reported by the tool agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventState {
    Running,
    Completed,
    Failed,
}

impl ToolEventState {
    /// Whether this event ends the invocation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One event in a tool invocation's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub state: ToolEventState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

impl ToolEvent {
    /// A terminal success event.
    pub fn completed(summary: impl Into<String>, output: Option<Value>) -> Self {
        Self {
            state: ToolEventState::Completed,
            summary: Some(summary.into()),
            output,
            occurred_at: Utc::now(),
        }
    }

    /// A terminal failure event.
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            state: ToolEventState::Failed,
            summary: Some(summary.into()),
            output: None,
            occurred_at: Utc::now(),
        }
    }

    /// A progress event.
    pub fn running(summary: impl Into<String>) -> Self {
        Self {
            state: ToolEventState::Running,
            summary: Some(summary.into()),
            output: None,
            occurred_at: Utc::now(),
        }
    }
}

/// Transport-level invocation failures, as opposed to a tool reporting its
/// own failure through a terminal [`ToolEvent`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// Worth retrying: the agent was unreachable or the stream broke.
    #[error("transient tool failure: {0}")]
    Transient(String),

    /// Retrying will not help: the invocation itself is invalid.
    #[error("permanent tool failure: {0}")]
    Permanent(String),
}

/// The external tool-execution endpoint.
#[async_trait]
pub trait ToolAgent: Send + Sync {
    /// Execute the invocation, returning a stream of events ending with a
    /// terminal one. Timeout enforcement is the caller's job.
    async fn execute(
        &self,
        invocation: ToolInvocation,
    ) -> Result<BoxStream<'static, ToolEvent>, ToolError>;
}

/// Development stand-in for the external tool agent: acknowledges the
/// invocation and completes immediately, echoing the input back as
/// output. Production deployments wire the RPC-backed agent here.
#[derive(Debug, Default)]
pub struct EchoToolAgent;

#[async_trait]
impl ToolAgent for EchoToolAgent {
    async fn execute(
        &self,
        invocation: ToolInvocation,
    ) -> Result<BoxStream<'static, ToolEvent>, ToolError> {
        let output = serde_json::json!({
            "tool": invocation.tool,
            "input": invocation.input,
        });
        let events = vec![
            ToolEvent::running(format!("executing {}", invocation.tool)),
            ToolEvent::completed(format!("{} finished", invocation.tool), Some(output)),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}
