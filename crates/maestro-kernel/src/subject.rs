//! The authenticated principal and its ownership-matching rules.
//!
//! A [`Subject`] is the access-control identity attached to every plan at
//! creation and to every request at session bind. Ownership checks never
//! compare raw session ids alone: a rotated session for the same user must
//! still reach its plans, and service-account plans carry no user identity
//! at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Immutable identity snapshot of the authenticated principal.
///
/// Roles and scopes are owned sets; cloning a subject deep-copies them, so
/// persisted snapshots can never alias a live session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Session the subject was derived from.
    pub session_id: String,
    /// Tenant the session belongs to, when multi-tenant auth is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Stable user identifier (the verified `sub` claim).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Verified email, when present in the claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name. Stripped before persistence (not needed downstream).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Role names granted to the subject.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// OAuth-style scopes granted to the subject.
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Subject {
    /// An anonymous single-tenant subject for development mode.
    pub fn anonymous(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tenant_id: None,
            user_id: None,
            email: None,
            name: None,
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
        }
    }

    /// Snapshot suitable for persistence: identical identity with the
    /// display name dropped.
    pub fn persisted(&self) -> Self {
        let mut copy = self.clone();
        copy.name = None;
        copy
    }
}

/// Ownership predicate between a plan's owner and a requester.
///
/// The match is a multi-predicate OR, checked in order:
///
/// 1. same session id;
/// 2. same user id within the same tenant;
/// 3. same email within the same tenant;
/// 4. same tenant alone, but only when the owner subject carries no user
///    identity (service-account-owned plans).
///
/// Anything else is a mismatch, including two anonymous subjects from
/// different sessions.
pub fn subjects_match(owner: &Subject, requester: &Subject) -> bool {
    if !owner.session_id.is_empty() && owner.session_id == requester.session_id {
        return true;
    }

    let same_tenant = match (&owner.tenant_id, &requester.tenant_id) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    if !same_tenant {
        return false;
    }

    if let (Some(a), Some(b)) = (&owner.user_id, &requester.user_id) {
        if a == b {
            return true;
        }
    }
    if let (Some(a), Some(b)) = (&owner.email, &requester.email) {
        if a == b {
            return true;
        }
    }

    // Tenant-only match is sufficient only for plans owned by a subject with
    // no user identity at all.
    owner.user_id.is_none() && owner.email.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(
        session: &str,
        tenant: Option<&str>,
        user: Option<&str>,
        email: Option<&str>,
    ) -> Subject {
        Subject {
            session_id: session.to_string(),
            tenant_id: tenant.map(String::from),
            user_id: user.map(String::from),
            email: email.map(String::from),
            name: None,
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
        }
    }

    #[test]
    fn same_session_matches() {
        let a = subject("s1", None, None, None);
        let b = subject("s1", Some("t9"), Some("u9"), None);
        assert!(subjects_match(&a, &b));
    }

    #[test]
    fn rotated_session_same_user_same_tenant_matches() {
        let owner = subject("s1", Some("t1"), Some("u1"), None);
        let requester = subject("s2", Some("t1"), Some("u1"), None);
        assert!(subjects_match(&owner, &requester));
    }

    #[test]
    fn same_user_different_tenant_mismatches() {
        let owner = subject("s1", Some("t1"), Some("u1"), None);
        let requester = subject("s2", Some("t2"), Some("u1"), None);
        assert!(!subjects_match(&owner, &requester));
    }

    #[test]
    fn email_plus_tenant_matches() {
        let owner = subject("s1", Some("t1"), Some("u1"), Some("a@x.io"));
        let requester = subject("s2", Some("t1"), Some("u2"), Some("a@x.io"));
        assert!(subjects_match(&owner, &requester));
    }

    #[test]
    fn different_user_same_tenant_mismatches() {
        let owner = subject("s1", Some("t1"), Some("u1"), Some("a@x.io"));
        let requester = subject("s2", Some("t1"), Some("u2"), Some("b@x.io"));
        assert!(!subjects_match(&owner, &requester));
    }

    #[test]
    fn tenant_only_matches_when_owner_has_no_user_identity() {
        let owner = subject("s1", Some("t1"), None, None);
        let requester = subject("s2", Some("t1"), Some("u2"), Some("b@x.io"));
        assert!(subjects_match(&owner, &requester));
    }

    #[test]
    fn tenant_only_does_not_apply_when_owner_has_identity() {
        let owner = subject("s1", Some("t1"), Some("u1"), None);
        let requester = subject("s2", Some("t1"), None, None);
        assert!(!subjects_match(&owner, &requester));
    }

    #[test]
    fn anonymous_subjects_from_different_sessions_mismatch() {
        let a = subject("s1", None, None, None);
        let b = subject("s2", None, None, None);
        assert!(!subjects_match(&a, &b));
    }

    #[test]
    fn persisted_snapshot_strips_name() {
        let mut s = subject("s1", Some("t1"), Some("u1"), None);
        s.name = Some("Ada".into());
        let snap = s.persisted();
        assert!(snap.name.is_none());
        assert_eq!(snap.user_id, s.user_id);
    }
}
