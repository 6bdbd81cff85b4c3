//! Task status and the lifecycle state machine.
//!
//! Every status change in the system goes through [`TaskStatus::transition`],
//! which only accepts the edges listed in [`TaskStatus::allowed_transitions`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet submitted to the queue
    #[default]
    Pending,
    /// Waiting for a free concurrency slot
    Queued,
    /// Being executed by the execution collaborator
    Running,
    /// Execution was paused; resuming re-queues the task
    Paused,
    /// Execution finished successfully
    Completed,
    /// Execution failed (may be retried)
    Failed,
    /// Cancelled by the user (may be retried)
    Cancelled,
}

/// Attempted status change that is not an edge of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string representation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Statuses reachable from this one in a single step.
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Queued, TaskStatus::Cancelled],
            TaskStatus::Queued => &[TaskStatus::Running, TaskStatus::Cancelled],
            TaskStatus::Running => &[
                TaskStatus::Paused,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Paused => &[TaskStatus::Queued, TaskStatus::Cancelled],
            TaskStatus::Completed => &[],
            TaskStatus::Failed => &[TaskStatus::Queued],
            TaskStatus::Cancelled => &[TaskStatus::Queued],
        }
    }

    /// Check whether `next` is a valid single-step transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Validate a transition, returning the target status on success.
    pub fn transition(self, next: TaskStatus) -> Result<TaskStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }

    /// Check if this is a terminal state (execution will not continue).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check if the task still occupies or waits for queue capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }

    /// Tasks in these states may be removed by the age-based cleanup sweep.
    pub fn is_cleanable(&self) -> bool {
        self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
