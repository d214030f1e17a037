use std::time::Duration;

use thiserror::Error;

/// Result type returned by reconcilers for one work item.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for the item to be processed.
    #[error("timeout after {elapsed:?} reconciling {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Failure that is expected to clear on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Whether requeueing the item may help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_))
    }
}
