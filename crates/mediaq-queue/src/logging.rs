//! Structured task logging.
//!
//! Lifecycle messages go to `tracing` with the task ID attached and are also
//! persisted as task log entries so they survive restarts.

use std::sync::Arc;

use tracing::{debug, error, info, warn, Span};

use mediaq_models::{LogLevel, TaskId};
use mediaq_store::TaskStore;

/// Task logger writing to both `tracing` and the task's stored log.
#[derive(Clone)]
pub struct TaskLogger {
    store: Arc<TaskStore>,
    task_id: TaskId,
    operation: String,
}

impl TaskLogger {
    /// Create a logger for a task and the component acting on it.
    pub fn new(store: Arc<TaskStore>, task_id: &TaskId, operation: &str) -> Self {
        Self {
            store,
            task_id: task_id.clone(),
            operation: operation.to_string(),
        }
    }

    /// Emit and persist a message at `level`.
    ///
    /// Failing to persist is logged and otherwise ignored; a task deleted
    /// concurrently simply loses the line.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(task_id = %self.task_id, operation = %self.operation, "{}", message),
            LogLevel::Info => info!(task_id = %self.task_id, operation = %self.operation, "{}", message),
            LogLevel::Warn => warn!(task_id = %self.task_id, operation = %self.operation, "{}", message),
            LogLevel::Error => error!(task_id = %self.task_id, operation = %self.operation, "{}", message),
        }

        if let Err(e) = self.store.append_log(&self.task_id, level, message) {
            if !e.is_not_found() {
                warn!(task_id = %self.task_id, error = %e, "Failed to persist task log entry");
            }
        }
    }

    pub fn log_start(&self, message: &str) {
        self.log(LogLevel::Info, &format!("Task started: {}", message));
    }

    pub fn log_info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn log_warning(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn log_error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn log_completion(&self, message: &str) {
        self.log(LogLevel::Info, &format!("Task completed: {}", message));
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this task.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "task",
            task_id = %self.task_id,
            operation = %self.operation
        )
    }
}
