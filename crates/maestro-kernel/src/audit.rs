//! Structured audit trail.
//!
//! Audit events are `tracing` events on the dedicated `audit` target, so
//! any subscriber (JSON log shipper, test collector) can route them
//! independently of application logs. Caller identifiers are hashed before
//! they reach the log stream; raw IPs and subject ids never appear in audit
//! output.

use sha2::{Digest, Sha256};

use crate::subject::Subject;

/// Outcome attached to every audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Approved,
    Rejected,
    Denied,
    Failure,
    Success,
}

impl AuditOutcome {
    /// Wire name used in the audit stream.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Denied => "denied",
            Self::Failure => "failure",
            Self::Success => "success",
        }
    }
}

/// Short stable hash of a caller identifier (IP or subject id).
pub fn hash_identifier(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

/// Emit one audit event.
///
/// `action` is the dotted action name (`plan.step.approve`), `detail` a
/// short human-readable summary. `subject` and `ip` are hashed; pass
/// whatever is available.
pub fn record(
    action: &str,
    outcome: AuditOutcome,
    trace_id: &str,
    request_id: Option<&str>,
    subject: Option<&Subject>,
    ip: Option<&str>,
    detail: &str,
) {
    let subject_hash = subject.map(|s| {
        hash_identifier(
            s.user_id
                .as_deref()
                .unwrap_or(s.session_id.as_str()),
        )
    });
    let ip_hash = ip.map(hash_identifier);
    tracing::info!(
        target: "audit",
        action,
        outcome = outcome.as_str(),
        trace_id,
        request_id = request_id.unwrap_or(""),
        subject = subject_hash.as_deref().unwrap_or(""),
        ip = ip_hash.as_deref().unwrap_or(""),
        detail,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_short() {
        let a = hash_identifier("203.0.113.7");
        let b = hash_identifier("203.0.113.7");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, hash_identifier("203.0.113.8"));
    }

    #[test]
    fn record_accepts_minimal_fields() {
        // Emitting must never panic, whatever is missing.
        record(
            "plan.step.approve",
            AuditOutcome::Approved,
            "trace-1",
            None,
            None,
            None,
            "approved via test",
        );
    }
}
