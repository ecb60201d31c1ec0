//! Session binding middleware.
//!
//! Extracts the session id from the bearer header or the configured
//! cookie, loads the record from the session store (which evicts expired
//! entries on access) and attaches a [`SessionContext`] extension. The
//! middleware never rejects by itself — endpoints that require a subject
//! call [`SessionContext::require_subject`], so public routes (health,
//! metrics) stay reachable without auth.

use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;
use maestro_kernel::session::{extract_session_id, SessionRecord};
use maestro_kernel::subject::Subject;

/// Per-request authentication state, available as an [`axum::Extension`].
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// The loaded session, when a valid id resolved to a live record.
    pub record: Option<SessionRecord>,
    /// The plan-facing subject derived from the record.
    pub subject: Option<Subject>,
}

impl SessionContext {
    /// The subject, or `401 unauthorized` when identity is mandatory
    /// (`oidc_enabled`) and no session was bound.
    pub fn require_subject(&self, oidc_enabled: bool) -> Result<Option<&Subject>, ApiError> {
        match (&self.subject, oidc_enabled) {
            (Some(subject), _) => Ok(Some(subject)),
            (None, false) => Ok(None),
            (None, true) => Err(ApiError::Unauthorized("session required".to_string())),
        }
    }
}

/// Middleware: bind the session record to the request.
pub async fn bind(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    let cookie = request
        .headers()
        .get("cookie")
        .and_then(|v| v.to_str().ok());
    let cookie_name = &state.config.auth.oidc.session.cookie_name;

    let context = match extract_session_id(authorization, cookie, cookie_name) {
        Some(id) => match state.sessions.get(&id) {
            Some(record) => {
                let subject = record.to_plan_subject();
                SessionContext {
                    record: Some(record),
                    subject: Some(subject),
                }
            }
            None => SessionContext::default(),
        },
        None => SessionContext::default(),
    };

    request.extensions_mut().insert(context);
    next.run(request).await
}
