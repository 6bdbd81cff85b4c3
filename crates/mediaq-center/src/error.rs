//! Task center error taxonomy.
//!
//! Store and scheduler errors are folded into the handful of kinds callers
//! act on. Low-level database and IO failures that are not corruption end up
//! as `Internal`.

use mediaq_models::{TaskStatus, TransitionError};
use mediaq_queue::QueueError;
use mediaq_store::StoreError;
use thiserror::Error;

pub type CenterResult<T> = Result<T, CenterError>;

#[derive(Debug, Error)]
pub enum CenterError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    #[error("Maintenance blocked: {0}")]
    MaintenanceBlocked(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Task center is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CenterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn maintenance_blocked(msg: impl Into<String>) -> Self {
        Self::MaintenanceBlocked(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CenterError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CenterError::NotFound(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, CenterError::InvalidTransition { .. })
    }

    /// The store needs a repair, reset or restore.
    pub fn is_store_corruption(&self) -> bool {
        matches!(self, CenterError::StoreCorruption(_))
    }

    pub fn is_maintenance_blocked(&self) -> bool {
        matches!(self, CenterError::MaintenanceBlocked(_))
    }
}

impl From<TransitionError> for CenterError {
    fn from(e: TransitionError) -> Self {
        Self::InvalidTransition {
            from: e.from,
            to: e.to,
        }
    }
}

impl From<StoreError> for CenterError {
    fn from(e: StoreError) -> Self {
        if e.is_corruption() {
            return Self::StoreCorruption(e.to_string());
        }
        match e {
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvalidTransition(t) => t.into(),
            e @ StoreError::ConcurrentModification { .. } => Self::ConcurrentModification(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for CenterError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Store(e) => e.into(),
            QueueError::Validation(msg) => Self::Validation(msg),
            QueueError::ShuttingDown => Self::ShuttingDown,
            e @ QueueError::Incomplete { .. } => Self::Internal(e.to_string()),
        }
    }
}
