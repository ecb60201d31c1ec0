//! Capability policy enforcement.
//!
//! Every mutating or streaming HTTP action and every plan step is gated by a
//! [`CapabilityPolicy`]. The decision is pure: given the action, the
//! required capabilities, the subject, and the run mode, the enforcer
//! returns allow or a structured list of deny reasons — it performs no I/O
//! and has no side effects, so callers evaluate it exactly once per request
//! before any side-effecting work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::RunMode;
use crate::plan::PlanStep;
use crate::subject::Subject;

/// One structured reason behind a deny decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyReason {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    #[serde(default)]
    pub deny: Vec<DenyReason>,
}

impl Decision {
    /// An unconditional allow.
    pub fn allowed() -> Self {
        Self {
            allow: true,
            deny: Vec::new(),
        }
    }

    /// A deny carrying the given reasons.
    pub fn denied(deny: Vec<DenyReason>) -> Self {
        Self { allow: false, deny }
    }
}

/// Everything the enforcer may consider for an HTTP action.
#[derive(Debug, Clone)]
pub struct HttpAction<'a> {
    /// Action name, e.g. `plan.create`, `plan.events`, `plan.approve`.
    pub action: &'a str,
    /// Capabilities the action requires; all must be granted.
    pub required_capabilities: &'a [String],
    /// Acting agent name, when the caller is an agent rather than a user.
    pub agent: Option<&'a str>,
    pub trace_id: &'a str,
    pub subject: Option<&'a Subject>,
    pub run_mode: RunMode,
}

/// Pluggable policy seam.
pub trait CapabilityPolicy: Send + Sync {
    /// Gate an HTTP action before any side-effecting work.
    fn enforce_http_action(&self, action: &HttpAction<'_>) -> Decision;

    /// Gate a plan step before the worker invokes its tool.
    fn enforce_plan_step(&self, step: &PlanStep, subject: Option<&Subject>) -> Decision;
}

// ---------------------------------------------------------------------------
// Embedded rule evaluator
// ---------------------------------------------------------------------------

/// Grants a capability pattern to subjects holding any listed role or scope.
///
/// Patterns are exact capability names or a prefix wildcard such as
/// `tool.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub pattern: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl CapabilityRule {
    fn matches(&self, capability: &str) -> bool {
        pattern_matches(&self.pattern, capability)
    }

    fn grants(&self, subject: &Subject) -> bool {
        self.roles.iter().any(|r| subject.roles.contains(r))
            || self.scopes.iter().any(|s| subject.scopes.contains(s))
    }
}

fn pattern_matches(pattern: &str, capability: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(".*") {
        capability
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
    } else {
        pattern == capability
    }
}

/// The embedded rule evaluator, the concrete [`CapabilityPolicy`].
///
/// Grant order per capability:
///
/// 1. a subject scope equal to the capability (or a wildcard scope covering
///    it);
/// 2. the `admin` role;
/// 3. any configured [`CapabilityRule`] matching the capability whose
///    roles/scopes intersect the subject's.
///
/// The development policy (`allow_anonymous`) is permissive outside
/// enterprise run mode: anonymous callers and ungranted subjects are both
/// admitted, matching single-tenant installs. In `enterprise` run mode a
/// subject is always required and grants are always evaluated.
#[derive(Debug, Clone)]
pub struct RulePolicy {
    allow_anonymous: bool,
    rules: Vec<CapabilityRule>,
}

impl RulePolicy {
    /// Development policy: anonymous allowed, no extra rules.
    pub fn development() -> Self {
        Self {
            allow_anonymous: true,
            rules: Vec::new(),
        }
    }

    /// Enterprise policy: subject required, grants only via scopes, the
    /// `admin` role, or configured rules.
    pub fn enterprise() -> Self {
        Self {
            allow_anonymous: false,
            rules: Vec::new(),
        }
    }

    /// Add a capability rule.
    #[must_use]
    pub fn with_rule(mut self, rule: CapabilityRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn evaluate(
        &self,
        required: &[String],
        subject: Option<&Subject>,
        run_mode: RunMode,
    ) -> Decision {
        let enterprise = run_mode == RunMode::Enterprise;
        let Some(subject) = subject else {
            if !enterprise && self.allow_anonymous {
                return Decision::allowed();
            }
            return Decision::denied(vec![DenyReason {
                reason: "subject required".to_string(),
                capability: None,
            }]);
        };

        // Development policy is permissive: single-tenant installs run
        // without scope grants. Enterprise always evaluates grants.
        if !enterprise && self.allow_anonymous {
            return Decision::allowed();
        }

        let deny: Vec<DenyReason> = required
            .iter()
            .filter(|capability| !self.granted(subject, capability))
            .map(|capability| DenyReason {
                reason: "capability not granted".to_string(),
                capability: Some(capability.clone()),
            })
            .collect();

        if deny.is_empty() {
            Decision::allowed()
        } else {
            Decision::denied(deny)
        }
    }

    fn granted(&self, subject: &Subject, capability: &str) -> bool {
        if subject
            .scopes
            .iter()
            .any(|scope| pattern_matches(scope, capability) || scope == capability)
        {
            return true;
        }
        if subject.roles.contains("admin") {
            return true;
        }
        self.rules
            .iter()
            .any(|rule| rule.matches(capability) && rule.grants(subject))
    }
}

impl CapabilityPolicy for RulePolicy {
    fn enforce_http_action(&self, action: &HttpAction<'_>) -> Decision {
        self.evaluate(action.required_capabilities, action.subject, action.run_mode)
    }

    fn enforce_plan_step(&self, step: &PlanStep, subject: Option<&Subject>) -> Decision {
        // Plan steps inherit the development anonymity rule: a plan that was
        // accepted without a subject runs without one.
        let run_mode = if self.allow_anonymous {
            RunMode::Development
        } else {
            RunMode::Enterprise
        };
        self.evaluate(
            std::slice::from_ref(&step.capability),
            subject,
            run_mode,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject_with(scopes: &[&str], roles: &[&str]) -> Subject {
        let mut s = Subject::anonymous("sess-1");
        s.scopes = scopes.iter().map(|s| s.to_string()).collect();
        s.roles = roles.iter().map(|s| s.to_string()).collect();
        s
    }

    fn action<'a>(caps: &'a [String], subject: Option<&'a Subject>, mode: RunMode) -> HttpAction<'a> {
        HttpAction {
            action: "plan.create",
            required_capabilities: caps,
            agent: None,
            trace_id: "t",
            subject,
            run_mode: mode,
        }
    }

    #[test]
    fn scope_grants_capability() {
        let policy = RulePolicy::enterprise();
        let subject = subject_with(&["plan.create"], &[]);
        let caps = vec!["plan.create".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, Some(&subject), RunMode::Enterprise));
        assert!(decision.allow);
    }

    #[test]
    fn wildcard_scope_grants_capability() {
        let policy = RulePolicy::enterprise();
        let subject = subject_with(&["tool.*"], &[]);
        let caps = vec!["tool.write".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, Some(&subject), RunMode::Enterprise));
        assert!(decision.allow);
    }

    #[test]
    fn admin_role_grants_everything() {
        let policy = RulePolicy::enterprise();
        let subject = subject_with(&[], &["admin"]);
        let caps = vec!["plan.approve".to_string(), "tool.write".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, Some(&subject), RunMode::Enterprise));
        assert!(decision.allow);
    }

    #[test]
    fn missing_capability_yields_structured_deny() {
        let policy = RulePolicy::enterprise();
        let subject = subject_with(&["plan.read"], &[]);
        let caps = vec!["plan.approve".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, Some(&subject), RunMode::Enterprise));
        assert!(!decision.allow);
        assert_eq!(decision.deny.len(), 1);
        assert_eq!(decision.deny[0].capability.as_deref(), Some("plan.approve"));
    }

    #[test]
    fn enterprise_requires_subject() {
        let policy = RulePolicy::development();
        let caps = vec!["plan.create".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, None, RunMode::Enterprise));
        assert!(!decision.allow);
        assert_eq!(decision.deny[0].reason, "subject required");
    }

    #[test]
    fn development_allows_anonymous() {
        let policy = RulePolicy::development();
        let caps = vec!["plan.create".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, None, RunMode::Development));
        assert!(decision.allow);
    }

    #[test]
    fn rule_grants_via_role() {
        let policy = RulePolicy::enterprise().with_rule(CapabilityRule {
            pattern: "tool.*".to_string(),
            roles: ["operator".to_string()].into(),
            scopes: BTreeSet::new(),
        });
        let subject = subject_with(&[], &["operator"]);
        let caps = vec!["tool.write".to_string()];
        let decision = policy.enforce_http_action(&action(&caps, Some(&subject), RunMode::Enterprise));
        assert!(decision.allow);
    }

    #[test]
    fn plan_step_enforcement_uses_step_capability() {
        let policy = RulePolicy::enterprise();
        let step = PlanStep::new("s1", "write file", "fs").with_capability("tool.write");
        let subject = subject_with(&["tool.read"], &[]);
        let decision = policy.enforce_plan_step(&step, Some(&subject));
        assert!(!decision.allow);
        assert_eq!(decision.deny[0].capability.as_deref(), Some("tool.write"));
    }

    #[test]
    fn wildcard_requires_dot_boundary() {
        assert!(pattern_matches("tool.*", "tool.write"));
        assert!(!pattern_matches("tool.*", "toolbox.write"));
        assert!(!pattern_matches("tool.*", "tool"));
    }
}
