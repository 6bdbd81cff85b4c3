//! Scheduler configuration.

use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tasks allowed to run at the same time
    pub max_concurrent_tasks: usize,
    /// Threads each execution may use, forwarded to the executor
    pub threads_per_task: usize,
    /// How long a running task gets to acknowledge a pause
    pub pause_timeout: Duration,
    /// How long a running task gets to acknowledge a cancellation
    pub cancel_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            threads_per_task: 2,
            pause_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn with_concurrency(mut self, max_concurrent_tasks: usize, threads_per_task: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self.threads_per_task = threads_per_task;
        self
    }

    pub fn with_timeouts(mut self, pause_timeout: Duration, cancel_timeout: Duration) -> Self {
        self.pause_timeout = pause_timeout;
        self.cancel_timeout = cancel_timeout;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        validate_concurrency(self.max_concurrent_tasks, self.threads_per_task)
    }
}

pub(crate) fn validate_concurrency(max_concurrent_tasks: usize, threads_per_task: usize) -> QueueResult<()> {
    if max_concurrent_tasks == 0 {
        return Err(QueueError::validation("max_concurrent_tasks must be at least 1"));
    }
    if threads_per_task == 0 {
        return Err(QueueError::validation("threads_per_task must be at least 1"));
    }
    Ok(())
}
