//! Crate-level error types for `maestro-kernel`.
//!
//! Each sub-module converts into [`KernelError`] via `#[from]` so the `?`
//! operator composes them automatically.

use thiserror::Error;

/// Crate-level error type for `maestro-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A plan-state persistence error.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// A configuration loading or validation error.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A low-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal error described by a message string.
    #[error("{0}")]
    Internal(String),
}

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;
