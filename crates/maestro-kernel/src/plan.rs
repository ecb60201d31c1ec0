//! Plan and step domain model.
//!
//! A [`Plan`] is an ordered sequence of capability-gated tool invocations
//! ([`PlanStep`]) produced from a user goal. Plans are immutable after
//! creation except through step state transitions, which are driven by the
//! queue runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::subject::Subject;

/// Maximum accepted goal length after trimming.
pub const MAX_GOAL_LEN: usize = 2048;

/// Maximum accepted step id length.
pub const MAX_STEP_ID_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A validated plan identifier.
///
/// Canonical form is `plan-<uuid-v4>`. The legacy short form
/// `plan-<8..64 hex>` is accepted on read so pre-migration plans stay
/// addressable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    /// Generate a fresh canonical plan id.
    pub fn generate() -> Self {
        Self(format!("plan-{}", Uuid::new_v4()))
    }

    /// Parse and validate a plan id, trimming surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let suffix = raw.strip_prefix("plan-")?;
        if Uuid::parse_str(suffix).is_ok() {
            return Some(Self(raw.to_string()));
        }
        // Legacy short form: 8..=64 lowercase/uppercase hex digits.
        let len = suffix.len();
        if (8..=64).contains(&len) && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(Self(raw.to_string()));
        }
        None
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PlanId> for String {
    fn from(id: PlanId) -> Self {
        id.0
    }
}

/// Returns `true` if `id` is a well-formed step id: 1–64 chars drawn from
/// `[A-Za-z0-9._-]`.
pub fn is_valid_step_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_STEP_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// Step state machine
// ---------------------------------------------------------------------------

/// Per-step lifecycle state.
///
/// `Completed`, `Failed`, `Rejected` and `DeadLettered` are terminal: the
/// persisted row is removed and the step's idempotency key is released when
/// one of them is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepState {
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Rejected,
    DeadLettered,
}

impl PlanStepState {
    /// Whether this state ends the step's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::DeadLettered
        )
    }

    /// Snake-case wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for PlanStepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Steps and plans
// ---------------------------------------------------------------------------

/// A single tool invocation within a plan.
///
/// `input` and `metadata` are opaque JSON mappings; the kernel never
/// interprets tool payloads (that is the tool agent's contract).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identifier, unique within the plan. 1–64 chars of `[A-Za-z0-9._-]`.
    pub id: String,
    /// Human-readable description of what the step does.
    pub action: String,
    /// Tool handler name dispatched to the tool agent.
    pub tool: String,
    /// Capability required by the policy enforcer, e.g. `tool.write`.
    pub capability: String,
    /// Display label for the capability.
    #[serde(default)]
    pub capability_label: String,
    /// Ordered set of free-form labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Opaque tool input payload.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Opaque step metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Tool invocation timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Whether the step is held in `waiting_approval` until an operator
    /// resolves it.
    #[serde(default)]
    pub approval_required: bool,
}

fn default_timeout_seconds() -> u64 {
    120
}

impl PlanStep {
    /// Build a minimal step; callers chain field mutation for the rest.
    pub fn new(id: impl Into<String>, action: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            tool: tool.into(),
            capability: "tool.execute".to_string(),
            capability_label: String::new(),
            labels: Vec::new(),
            input: Map::new(),
            metadata: Map::new(),
            timeout_seconds: default_timeout_seconds(),
            approval_required: false,
        }
    }

    /// Set the required capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    /// Require operator approval before the step runs.
    #[must_use]
    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.approval_required = required;
        self
    }
}

/// An ordered sequence of steps produced from a user goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// The free-form goal the plan was derived from. Trimmed, 1..=2048 chars.
    pub goal: String,
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
    /// Owner identity, fixed at creation.
    pub owner: Subject,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Trace id propagated through every message and event of this plan.
    pub trace_id: String,
}

impl Plan {
    /// Deterministic idempotency key for a step of this plan.
    pub fn idempotency_key(plan_id: &str, step_id: &str) -> String {
        format!("{plan_id}:{step_id}")
    }
}
