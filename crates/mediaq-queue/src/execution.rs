//! Execution collaborator interface.
//!
//! The scheduler never transcodes anything itself. It hands each admitted
//! task to a [`TaskExecutor`] and reacts to the [`ExecutionOutcome`] it
//! resolves to. Pause and cancel requests reach the executor through the
//! [`ExecutionContext`]; honouring them is up to the executor.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

use mediaq_models::{Task, TaskEvent, TaskId};
use mediaq_store::TaskStore;

use crate::progress::ProgressBus;

/// Control request delivered to a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    #[default]
    Run,
    Pause,
    Cancel,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Run => "run",
            ControlSignal::Pause => "pause",
            ControlSignal::Cancel => "cancel",
        }
    }

    /// Combine two requests; cancellation wins over pause.
    pub fn merge(self, other: ControlSignal) -> ControlSignal {
        match (self, other) {
            (ControlSignal::Cancel, _) | (_, ControlSignal::Cancel) => ControlSignal::Cancel,
            (ControlSignal::Pause, _) | (_, ControlSignal::Pause) => ControlSignal::Pause,
            _ => ControlSignal::Run,
        }
    }
}

/// Work handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Task record as admitted (status `running`)
    pub task: Task,
    /// Thread budget for this execution
    pub threads_per_task: usize,
    /// The task was paused earlier in this attempt and is running again
    pub resumed: bool,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { outputs: Vec<String> },
    Failed { message: String },
    /// Stopped in response to a pause request
    Paused,
    /// Stopped in response to a cancel request
    Cancelled,
}

impl ExecutionOutcome {
    pub fn completed(outputs: Vec<String>) -> Self {
        Self::Completed { outputs }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::Failed { .. } => "failed",
            ExecutionOutcome::Paused => "paused",
            ExecutionOutcome::Cancelled => "cancelled",
        }
    }
}

/// Runs media jobs on behalf of the scheduler.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute a task until it finishes or honours a control signal.
    async fn execute(&self, request: ExecutionRequest, ctx: ExecutionContext) -> ExecutionOutcome;
}

/// Writes executor progress while the run is still attached.
pub(crate) struct ProgressReporter {
    store: Arc<TaskStore>,
    bus: Arc<ProgressBus>,
    task_id: TaskId,
    live: Arc<AtomicBool>,
    last: AtomicU8,
}

impl ProgressReporter {
    pub(crate) fn new(
        store: Arc<TaskStore>,
        bus: Arc<ProgressBus>,
        task_id: TaskId,
        live: Arc<AtomicBool>,
        initial: u8,
    ) -> Self {
        Self {
            store,
            bus,
            task_id,
            live,
            last: AtomicU8::new(initial),
        }
    }

    fn report(&self, percent: u8, step: Option<&str>) {
        if !self.live.load(Ordering::SeqCst) {
            return;
        }

        let percent = percent.min(100);
        match self.store.update_progress(&self.task_id, percent, step) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Failed to record progress");
                return;
            }
        }

        let progress = self.last.fetch_max(percent, Ordering::SeqCst).max(percent);
        if self.live.load(Ordering::SeqCst) {
            self.bus.publish(TaskEvent::TaskProgress {
                task_id: self.task_id.clone(),
                progress,
                step: step.map(str::to_string),
            });
        }
    }
}

/// Handle given to an execution for reporting and control.
#[derive(Clone)]
pub struct ExecutionContext {
    task_id: TaskId,
    signal: watch::Receiver<ControlSignal>,
    reporter: Arc<ProgressReporter>,
}

impl ExecutionContext {
    pub(crate) fn new(
        task_id: TaskId,
        signal: watch::Receiver<ControlSignal>,
        reporter: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            task_id,
            signal,
            reporter,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Report progress (0-100) and optionally the current step.
    ///
    /// Ignored once the scheduler has detached this run; progress never
    /// moves backwards.
    pub fn report_progress(&self, percent: u8, step: Option<&str>) {
        self.reporter.report(percent, step);
    }

    /// The latest control request.
    pub fn signal(&self) -> ControlSignal {
        *self.signal.borrow()
    }

    /// Whether the executor has been asked to stop.
    pub fn should_stop(&self) -> bool {
        self.signal() != ControlSignal::Run
    }

    /// Wait until a pause or cancel is requested.
    pub async fn wait_for_signal(&mut self) -> ControlSignal {
        loop {
            let current = *self.signal.borrow_and_update();
            if current != ControlSignal::Run {
                return current;
            }
            if self.signal.changed().await.is_err() {
                // Scheduler gone; treat as cancellation
                return ControlSignal::Cancel;
            }
        }
    }
}
