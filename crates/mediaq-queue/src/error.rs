//! Queue error types.

use mediaq_models::TransitionError;
use mediaq_store::StoreError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// A bulk command finished but could not handle every task.
    #[error("{action} skipped {} task(s): {}", .failed.len(), .failed.join("; "))]
    Incomplete {
        action: &'static str,
        failed: Vec<String>,
    },
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_not_found())
    }
}

impl From<TransitionError> for QueueError {
    fn from(e: TransitionError) -> Self {
        Self::Store(StoreError::InvalidTransition(e))
    }
}
