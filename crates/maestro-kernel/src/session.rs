//! Session records and the subject-binding helpers.
//!
//! The gateway extracts a session id from either the `Authorization:
//! Bearer` header or the configured cookie, loads the [`SessionRecord`]
//! from the [`SessionStore`], and maps it to the [`Subject`] every
//! downstream component sees. The store evicts expired entries on access,
//! so a lookup never returns a stale session.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::subject::Subject;

/// Maximum accepted session-id length for the non-uuid alphabet form.
const MAX_SESSION_ID_LEN: usize = 128;

/// A verified session as produced by the identity layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id (uuid).
    pub id: String,
    /// Stable user identifier — the verified `sub` claim.
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// Remaining verified claims, stored opaquely.
    #[serde(default)]
    pub claims: Value,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether the session has lapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Map the session to the plan-facing [`Subject`], stripping PII that
    /// is not needed downstream. Roles and scopes are cloned, never shared.
    pub fn to_plan_subject(&self) -> Subject {
        Subject {
            session_id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            user_id: Some(self.subject.clone()),
            email: self.email.clone(),
            name: None,
            roles: self.roles.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

/// In-memory session store with expiry-on-access semantics.
pub struct SessionStore {
    sessions: DashMap<String, SessionRecord>,
    ttl: Duration,
}

impl SessionStore {
    /// Store whose freshly created sessions live for `ttl_seconds`.
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: Duration::seconds(ttl_seconds.min(i64::MAX as u64) as i64),
        }
    }

    /// Create and store a session for the given identity, returning it.
    pub fn create(
        &self,
        subject: impl Into<String>,
        email: Option<String>,
        tenant_id: Option<String>,
        roles: BTreeSet<String>,
        scopes: BTreeSet<String>,
        claims: Value,
    ) -> SessionRecord {
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            email,
            name: None,
            tenant_id,
            roles,
            scopes,
            claims,
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions.insert(record.id.clone(), record.clone());
        record
    }

    /// Insert a pre-built record (tests and token exchange).
    pub fn insert(&self, record: SessionRecord) {
        self.sessions.insert(record.id.clone(), record);
    }

    /// Look up a session, evicting it if expired. Returns a deep copy;
    /// callers cannot mutate stored state.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let expired = match self.sessions.get(id) {
            Some(record) if record.is_expired() => true,
            Some(record) => return Some(record.clone()),
            None => return None,
        };
        if expired {
            self.sessions.remove(id);
        }
        None
    }

    /// Remove a session outright (logout).
    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Evict all expired sessions. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, record| !record.is_expired());
        before.saturating_sub(self.sessions.len())
    }

    /// Number of live sessions (test hook).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Extraction helpers
// ---------------------------------------------------------------------------

/// Shape-check a session id before any store lookup: a uuid, or 8..=128
/// chars of `[A-Za-z0-9_-]`.
pub fn is_valid_session_id(id: &str) -> bool {
    if Uuid::parse_str(id).is_ok() {
        return true;
    }
    (8..=MAX_SESSION_ID_LEN).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Extract a session id from an `Authorization: Bearer` header value or a
/// `Cookie` header, preferring the bearer token. Returns `None` when
/// neither carries a well-formed id.
pub fn extract_session_id(
    authorization: Option<&str>,
    cookie_header: Option<&str>,
    cookie_name: &str,
) -> Option<String> {
    if let Some(value) = authorization {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if is_valid_session_id(token) {
                return Some(token.to_string());
            }
        }
    }
    let cookies = cookie_header?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        let name = parts.next()?.trim();
        if name != cookie_name {
            continue;
        }
        let value = parts.next().unwrap_or("").trim();
        if is_valid_session_id(value) {
            return Some(value.to_string());
        }
    }
    None
}
