//! Declarative input validation.
//!
//! Validators return structured issues `[{path, message}]` that feed the
//! `invalid_request` error envelope verbatim, so clients can bind failures
//! back to fields.

use serde::{Deserialize, Serialize};

use maestro_kernel::plan::{is_valid_step_id, PlanId, MAX_GOAL_LEN};

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Dotted path into the request body, e.g. `messages.0.content`.
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Max accepted rationale length on approval bodies.
const MAX_RATIONALE_LEN: usize = 2000;
/// Chat limits.
const MAX_CHAT_MESSAGES: usize = 50;
const MAX_CHAT_CONTENT_LEN: usize = 16_000;
const MAX_MODEL_LEN: usize = 256;

/// Validate and normalise a plan goal: trimmed, 1..=2048 chars.
pub fn validate_goal(goal: &str) -> Result<String, Vec<Issue>> {
    let trimmed = goal.trim();
    if trimmed.is_empty() {
        return Err(vec![Issue::new("goal", "must not be empty")]);
    }
    if trimmed.len() > MAX_GOAL_LEN {
        return Err(vec![Issue::new(
            "goal",
            format!("must be at most {MAX_GOAL_LEN} characters"),
        )]);
    }
    Ok(trimmed.to_string())
}

/// Validate a plan id path segment (`plan-<uuid>` or legacy hex form).
pub fn validate_plan_id(raw: &str) -> Result<PlanId, Vec<Issue>> {
    PlanId::parse(raw).ok_or_else(|| vec![Issue::new("planId", "malformed plan id")])
}

/// Validate a step id path segment.
pub fn validate_step_id(raw: &str) -> Result<String, Vec<Issue>> {
    if is_valid_step_id(raw) {
        Ok(raw.to_string())
    } else {
        Err(vec![Issue::new(
            "stepId",
            "must be 1-64 characters of [A-Za-z0-9._-]",
        )])
    }
}

// ---------------------------------------------------------------------------
// Approval body
// ---------------------------------------------------------------------------

/// Raw approval request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalBody {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Validated approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub approve: bool,
    pub rationale: Option<String>,
}

/// Validate an approval body. `force_reject` is set by the `/reject`
/// endpoint, which overrides whatever the body says.
pub fn validate_approval(body: &ApprovalBody, force_reject: bool) -> Result<ApprovalRequest, Vec<Issue>> {
    let mut issues = Vec::new();

    let approve = if force_reject {
        false
    } else {
        match body.decision.as_deref() {
            None | Some("approve") => true,
            Some("reject") => false,
            Some(_) => {
                issues.push(Issue::new("decision", "must be one of: approve, reject"));
                true
            }
        }
    };

    let rationale = match &body.rationale {
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.len() > MAX_RATIONALE_LEN {
                issues.push(Issue::new(
                    "rationale",
                    format!("must be at most {MAX_RATIONALE_LEN} characters"),
                ));
            }
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        None => None,
    };

    if issues.is_empty() {
        Ok(ApprovalRequest { approve, rationale })
    } else {
        Err(issues)
    }
}

// ---------------------------------------------------------------------------
// Chat body
// ---------------------------------------------------------------------------

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Raw chat request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Validate a chat routing request.
pub fn validate_chat(body: &ChatBody) -> Result<(), Vec<Issue>> {
    let mut issues = Vec::new();

    if body.messages.is_empty() {
        issues.push(Issue::new("messages", "must contain at least one message"));
    }
    if body.messages.len() > MAX_CHAT_MESSAGES {
        issues.push(Issue::new(
            "messages",
            format!("must contain at most {MAX_CHAT_MESSAGES} messages"),
        ));
    }
    for (index, message) in body.messages.iter().enumerate() {
        if !matches!(message.role.as_str(), "system" | "user" | "assistant") {
            issues.push(Issue::new(
                format!("messages.{index}.role"),
                "must be one of: system, user, assistant",
            ));
        }
        if message.content.is_empty() {
            issues.push(Issue::new(
                format!("messages.{index}.content"),
                "must not be empty",
            ));
        } else if message.content.len() > MAX_CHAT_CONTENT_LEN {
            issues.push(Issue::new(
                format!("messages.{index}.content"),
                format!("must be at most {MAX_CHAT_CONTENT_LEN} characters"),
            ));
        }
    }
    if let Some(model) = &body.model {
        if model.len() > MAX_MODEL_LEN {
            issues.push(Issue::new(
                "model",
                format!("must be at most {MAX_MODEL_LEN} characters"),
            ));
        }
    }
    if let Some(temperature) = body.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            issues.push(Issue::new("temperature", "must be between 0 and 2"));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
