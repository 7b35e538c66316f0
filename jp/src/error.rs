//! Error types for the worker pool

use std::time::Duration;

use jobstore::StoreError;
use thiserror::Error;

use crate::scheduler::LifecycleState;

/// Errors raised by the worker pool core
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Job execution failed: {0}")]
    Execution(String),

    #[error("Attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Interrupted by shutdown after {attempts} attempts")]
    Interrupted { attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid scheduler state: expected {expected}, was {actual}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },
}

impl PoolError {
    /// Whether this error came from a single failed attempt (and so may be retried)
    pub fn is_attempt_failure(&self) -> bool {
        matches!(self, PoolError::Execution(_) | PoolError::AttemptTimeout(_))
    }
}
