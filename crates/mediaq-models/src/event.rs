//! Task lifecycle events broadcast to subscribers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Task, TaskError, TaskId, TaskStatus};

/// Event types, used for filtering and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    TaskCreated,
    TaskUpdated,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskDeleted,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventType::TaskCreated => "task_created",
            TaskEventType::TaskUpdated => "task_updated",
            TaskEventType::TaskStarted => "task_started",
            TaskEventType::TaskProgress => "task_progress",
            TaskEventType::TaskCompleted => "task_completed",
            TaskEventType::TaskFailed => "task_failed",
            TaskEventType::TaskCancelled => "task_cancelled",
            TaskEventType::TaskDeleted => "task_deleted",
        }
    }
}

/// A change to a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was created
    TaskCreated { task: Task },

    /// Status or editable fields changed (queued, paused, retried, renamed)
    TaskUpdated { task: Task },

    /// A task was admitted to a concurrency slot
    TaskStarted { task_id: TaskId },

    /// Progress reported by the executor
    TaskProgress {
        task_id: TaskId,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },

    /// Execution finished successfully
    TaskCompleted {
        task_id: TaskId,
        outputs: Vec<String>,
        execution_time_ms: u64,
    },

    /// Execution failed or was interrupted
    TaskFailed { task_id: TaskId, error: TaskError },

    /// The task was cancelled
    TaskCancelled { task_id: TaskId },

    /// The task and its logs were deleted
    TaskDeleted { task_id: TaskId },
}

impl TaskEvent {
    pub fn event_type(&self) -> TaskEventType {
        match self {
            TaskEvent::TaskCreated { .. } => TaskEventType::TaskCreated,
            TaskEvent::TaskUpdated { .. } => TaskEventType::TaskUpdated,
            TaskEvent::TaskStarted { .. } => TaskEventType::TaskStarted,
            TaskEvent::TaskProgress { .. } => TaskEventType::TaskProgress,
            TaskEvent::TaskCompleted { .. } => TaskEventType::TaskCompleted,
            TaskEvent::TaskFailed { .. } => TaskEventType::TaskFailed,
            TaskEvent::TaskCancelled { .. } => TaskEventType::TaskCancelled,
            TaskEvent::TaskDeleted { .. } => TaskEventType::TaskDeleted,
        }
    }

    /// ID of the task this event is about.
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::TaskCreated { task } | TaskEvent::TaskUpdated { task } => &task.id,
            TaskEvent::TaskStarted { task_id }
            | TaskEvent::TaskProgress { task_id, .. }
            | TaskEvent::TaskCompleted { task_id, .. }
            | TaskEvent::TaskFailed { task_id, .. }
            | TaskEvent::TaskCancelled { task_id }
            | TaskEvent::TaskDeleted { task_id } => task_id,
        }
    }

    /// Event announcing that `task` entered its current status.
    ///
    /// Terminal and running states get their dedicated events; every other
    /// status change is a plain update carrying the full record.
    pub fn for_status(task: &Task) -> Self {
        match task.status {
            TaskStatus::Running => TaskEvent::TaskStarted {
                task_id: task.id.clone(),
            },
            TaskStatus::Completed => TaskEvent::TaskCompleted {
                task_id: task.id.clone(),
                outputs: task.outputs.clone(),
                execution_time_ms: task.execution_time_ms.unwrap_or_default(),
            },
            TaskStatus::Failed => TaskEvent::TaskFailed {
                task_id: task.id.clone(),
                error: task
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::execution("Unknown error")),
            },
            TaskStatus::Cancelled => TaskEvent::TaskCancelled {
                task_id: task.id.clone(),
            },
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Paused => {
                TaskEvent::TaskUpdated { task: task.clone() }
            }
        }
    }
}

/// Event with bus-assigned ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskEventEnvelope {
    /// Bus-wide sequence number (monotonically increasing)
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TaskEvent,
}
