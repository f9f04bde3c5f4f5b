//! Error types for core operations.

use thiserror::Error;

use crate::models::TaskStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid submission or request parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation is not legal in the entity's current state.
    #[error("cannot {action} a task in status {status}")]
    InvalidTransition {
        status: TaskStatus,
        action: &'static str,
    },

    /// The operation was already applied (e.g. reprocessing a dead-letter
    /// entry twice).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}
