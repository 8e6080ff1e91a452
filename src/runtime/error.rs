//! Error types for container runtime operations.
//!
//! `NotFound` is kept distinct from `Failed` so teardown can treat
//! "already gone" as success without matching on message strings.

use std::time::Duration;

/// Errors that can occur talking to the container runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Docker daemon is not running or not accessible.
    #[error("Container runtime is not available: {message}")]
    Unavailable { message: String },

    /// The container, network or image does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The operation exceeded its time budget.
    #[error("Container runtime operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Any other runtime failure (create, start, stop, remove, ...).
    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `Failed` error.
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            operation,
            message: message.into(),
        }
    }

    /// Returns true if the target no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the runtime itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Folds "not found" into success for idempotent teardown calls.
pub(crate) fn ignore_not_found(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
