//! Wire formats for the step and completion topics.
//!
//! Both messages serialize to JSON and satisfy `parse ∘ serialize =
//! identity`. Headers carry the trace id, idempotency key and attempt
//! count so brokers and operators can inspect them without decoding the
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;

use maestro_kernel::plan::{PlanStep, PlanStepState};
use maestro_kernel::subject::Subject;

/// Header carrying the trace id.
pub const HEADER_TRACE_ID: &str = "trace-id";
/// Header carrying the idempotency key.
pub const HEADER_IDEMPOTENCY_KEY: &str = "x-idempotency-key";
/// Header carrying the delivery attempt count.
pub const HEADER_ATTEMPTS: &str = "x-attempts";
/// Header recording why a message was dead-lettered.
pub const HEADER_DEAD_LETTER_REASON: &str = "dead_letter_reason";

/// Prefix distinguishing completion idempotency keys from step keys.
pub const COMPLETION_KEY_PREFIX: &str = "complete:";

/// A step dispatched to a worker over the step topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskMessage {
    pub plan_id: String,
    pub step_id: String,
    pub step: PlanStep,
    pub attempt: u32,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

impl StepTaskMessage {
    /// Deterministic idempotency key for this message.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.plan_id, self.step_id)
    }

    /// Broker headers for this message.
    pub fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            (HEADER_TRACE_ID.to_string(), self.trace_id.clone()),
            (
                HEADER_IDEMPOTENCY_KEY.to_string(),
                self.idempotency_key(),
            ),
            (HEADER_ATTEMPTS.to_string(), self.attempt.to_string()),
        ])
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse from the wire.
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// A step's outcome reported on the completions topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletionMessage {
    pub plan_id: String,
    pub step_id: String,
    pub state: PlanStepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub approvals: BTreeMap<String, bool>,
}

impl StepCompletionMessage {
    /// Completion idempotency key: the step key prefixed `complete:`.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{COMPLETION_KEY_PREFIX}{}:{}",
            self.plan_id, self.step_id
        )
    }

    /// Broker headers for this message.
    pub fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                HEADER_TRACE_ID.to_string(),
                self.trace_id.clone().unwrap_or_default(),
            ),
            (
                HEADER_IDEMPOTENCY_KEY.to_string(),
                self.idempotency_key(),
            ),
            (HEADER_ATTEMPTS.to_string(), self.attempt.to_string()),
        ])
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse from the wire.
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
