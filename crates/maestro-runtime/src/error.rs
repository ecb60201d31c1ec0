//! Runtime error types.

use thiserror::Error;

use crate::queue::QueueError;
use maestro_kernel::store::StoreError;

/// Errors surfaced by the plan queue runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The referenced plan or step does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine violation, e.g. approving a step that is not
    /// awaiting approval.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A duplicate submission (idempotency key already reserved).
    #[error("duplicate submission: {0}")]
    Duplicate(String),

    /// The broker rejected or lost the message.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
