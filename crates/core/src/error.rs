//! Engine error model.

use thiserror::Error;

/// Result type used across the engine core.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error.
///
/// The variants mirror how callers are expected to react: a precondition
/// failure is the caller's bug and nothing was mutated, a configuration
/// error means the process model is broken, a conflict is worth retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A required argument was missing or malformed. Raised before any mutation.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The process model or an expression in it cannot be used.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure (stale revision, lease held elsewhere).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A backing repository failed. Nothing about the request was judged.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
