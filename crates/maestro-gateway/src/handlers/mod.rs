//! HTTP request handlers.

pub mod approval;
pub mod chat;
pub mod events;
pub mod health;
pub mod plan;

use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use maestro_kernel::subject::{subjects_match, Subject};

/// The owner subject a plan was created with, from the persisted plan
/// metadata. `404` when the plan is unknown.
pub(crate) async fn plan_owner(
    state: &Arc<AppState>,
    plan_id: &str,
) -> ApiResult<Option<Subject>> {
    let metadata = state
        .runtime
        .store()
        .get_plan_metadata(plan_id)
        .await
        .map_err(|err| ApiError::Upstream(format!("state store failed: {err}")))?
        .ok_or_else(|| ApiError::NotFound("plan".to_string()))?;
    Ok(metadata.steps.first().and_then(|meta| meta.subject.clone()))
}

/// Enforce subject-to-plan-owner binding.
///
/// An anonymous requester is permitted only in development mode (the
/// enterprise 401 fires earlier); a plan persisted without an owner
/// subject is single-tenant development data and binds to nobody.
pub(crate) fn enforce_ownership(
    owner: Option<&Subject>,
    requester: Option<&Subject>,
    mismatch_message: &str,
) -> ApiResult<()> {
    match (owner, requester) {
        (Some(owner), Some(requester)) => {
            if subjects_match(owner, requester) {
                Ok(())
            } else {
                Err(ApiError::Forbidden {
                    message: mismatch_message.to_string(),
                    deny: Vec::new(),
                })
            }
        }
        _ => Ok(()),
    }
}

/// Rate-limit identity for a request: subject user id, else session id,
/// else nothing (the ip bucket still applies).
pub(crate) fn caller_identity(subject: Option<&Subject>) -> Option<String> {
    subject.map(|s| {
        s.user_id
            .clone()
            .unwrap_or_else(|| s.session_id.clone())
    })
}
