//! Task center facade.
//!
//! Every mutation of tasks goes through [`TaskCenter`]: creation and edits
//! are handled here, lifecycle commands are forwarded to the scheduler, and
//! store maintenance lives behind [`TaskCenter::maintenance`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use mediaq_models::{
    IntegrityReport, LogEntry, NewTask, Pagination, QueueStatus, StoreStats, Task, TaskEvent,
    TaskFilter, TaskId, TaskPage, TaskStatus, TaskUpdate,
};
use mediaq_queue::{ProgressBus, Scheduler, Subscription, TaskExecutor};
use mediaq_store::TaskStore;

use crate::config::CenterConfig;
use crate::error::{CenterError, CenterResult};
use crate::logging::TaskLogger;
use crate::maintenance::MaintenanceManager;

/// A task a batch command could not apply to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub task_id: TaskId,
    pub error: String,
}

/// Per-task results of a batch command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<TaskId>,
    pub failed: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum BatchOp {
    Start,
    Pause,
    Resume,
    Cancel,
    Retry,
    Delete,
}

impl BatchOp {
    fn as_str(&self) -> &'static str {
        match self {
            BatchOp::Start => "start",
            BatchOp::Pause => "pause",
            BatchOp::Resume => "resume",
            BatchOp::Cancel => "cancel",
            BatchOp::Retry => "retry",
            BatchOp::Delete => "delete",
        }
    }
}

/// Local media task center.
pub struct TaskCenter {
    config: CenterConfig,
    store: Arc<TaskStore>,
    bus: Arc<ProgressBus>,
    scheduler: Scheduler,
    maintenance: MaintenanceManager,
}

impl TaskCenter {
    /// Open the store, recover interrupted work and start admitting.
    ///
    /// A corrupted store does not stop the center from opening; recovery is
    /// skipped so the caller can repair, reset or restore.
    pub async fn open(config: CenterConfig, executor: Arc<dyn TaskExecutor>) -> CenterResult<Self> {
        info!(
            db_path = ?config.db_path,
            max_concurrent_tasks = config.max_concurrent_tasks,
            auto_start = config.auto_start,
            "Opening task center"
        );

        let store = Arc::new(TaskStore::open(config.store_config())?);
        let bus = Arc::new(ProgressBus::new(config.event_capacity));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            executor,
            config.scheduler_config(),
        )?;

        match scheduler.recover().await.map_err(CenterError::from) {
            Ok(report) => info!(
                interrupted = report.interrupted,
                requeued = report.requeued,
                "Task center ready"
            ),
            Err(e) if e.is_store_corruption() => {
                error!(error = %e, "Store is corrupted; recovery skipped until it is repaired");
            }
            Err(e) => return Err(e),
        }

        let maintenance = MaintenanceManager::new(Arc::clone(&store), scheduler.clone());
        Ok(Self {
            config,
            store,
            bus,
            scheduler,
            maintenance,
        })
    }

    pub fn config(&self) -> &CenterConfig {
        &self.config
    }

    pub fn maintenance(&self) -> &MaintenanceManager {
        &self.maintenance
    }

    fn logger(&self, id: &TaskId) -> TaskLogger {
        TaskLogger::new(Arc::clone(&self.store), id, "center")
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Create a task; it is queued right away when auto start is on.
    pub async fn create_task(&self, request: NewTask) -> CenterResult<Task> {
        request.validate().map_err(CenterError::Validation)?;

        let task = Task::new(request);
        self.store.create_task(&task)?;
        self.announce_created(&task);

        if self.config.auto_start {
            return self.start_task(&task.id).await;
        }
        Ok(task)
    }

    /// Create several tasks. Either all are stored or none is.
    pub async fn create_tasks(&self, requests: Vec<NewTask>) -> CenterResult<Vec<Task>> {
        for (index, request) in requests.iter().enumerate() {
            request
                .validate()
                .map_err(|e| CenterError::validation(format!("Task #{}: {}", index + 1, e)))?;
        }

        let tasks: Vec<Task> = requests.into_iter().map(Task::new).collect();
        self.store.create_tasks(&tasks)?;
        for task in &tasks {
            self.announce_created(task);
        }

        if !self.config.auto_start {
            return Ok(tasks);
        }
        let mut started = Vec::with_capacity(tasks.len());
        for task in tasks {
            started.push(self.start_task(&task.id).await?);
        }
        Ok(started)
    }

    fn announce_created(&self, task: &Task) {
        self.bus.publish(TaskEvent::TaskCreated { task: task.clone() });
        self.logger(&task.id)
            .log_info(&format!("Task created: {} ({})", task.name, task.task_type));
    }

    pub async fn start_task(&self, id: &TaskId) -> CenterResult<Task> {
        Ok(self.scheduler.start_task(id).await?)
    }

    pub async fn pause_task(&self, id: &TaskId) -> CenterResult<Task> {
        Ok(self.scheduler.pause_task(id).await?)
    }

    pub async fn resume_task(&self, id: &TaskId) -> CenterResult<Task> {
        Ok(self.scheduler.resume_task(id).await?)
    }

    pub async fn cancel_task(&self, id: &TaskId) -> CenterResult<Task> {
        Ok(self.scheduler.cancel_task(id).await?)
    }

    pub async fn retry_task(&self, id: &TaskId) -> CenterResult<Task> {
        Ok(self.scheduler.retry_task(id).await?)
    }

    /// Delete a task and its logs. Running tasks must be cancelled first.
    pub async fn delete_task(&self, id: &TaskId) -> CenterResult<()> {
        self.scheduler.delete_task(id).await?;
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Edit name, output directory or config of a task that is neither
    /// queued nor running.
    pub async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> CenterResult<Task> {
        let mut task = self.store.get_task(id)?;
        if task.status.is_active() {
            return Err(CenterError::validation(format!(
                "Task {} is {}; pause or cancel it before editing",
                id, task.status
            )));
        }

        let status = task.status;
        task.apply_update(update).map_err(CenterError::Validation)?;
        self.store.update_task(&task, status)?;

        self.bus.publish(TaskEvent::TaskUpdated { task: task.clone() });
        self.logger(id).log_info("Task details updated");
        Ok(task)
    }

    // =========================================================================
    // Batch commands
    // =========================================================================

    pub async fn start_tasks(&self, ids: &[TaskId]) -> BatchOutcome {
        self.run_batch(ids, BatchOp::Start).await
    }

    pub async fn pause_tasks(&self, ids: &[TaskId]) -> BatchOutcome {
        self.run_batch(ids, BatchOp::Pause).await
    }

    pub async fn resume_tasks(&self, ids: &[TaskId]) -> BatchOutcome {
        self.run_batch(ids, BatchOp::Resume).await
    }

    pub async fn cancel_tasks(&self, ids: &[TaskId]) -> BatchOutcome {
        self.run_batch(ids, BatchOp::Cancel).await
    }

    pub async fn retry_tasks(&self, ids: &[TaskId]) -> BatchOutcome {
        self.run_batch(ids, BatchOp::Retry).await
    }

    pub async fn delete_tasks(&self, ids: &[TaskId]) -> BatchOutcome {
        self.run_batch(ids, BatchOp::Delete).await
    }

    async fn run_batch(&self, ids: &[TaskId], op: BatchOp) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for id in ids {
            let result = match op {
                BatchOp::Start => self.start_task(id).await.map(drop),
                BatchOp::Pause => self.pause_task(id).await.map(drop),
                BatchOp::Resume => self.resume_task(id).await.map(drop),
                BatchOp::Cancel => self.cancel_task(id).await.map(drop),
                BatchOp::Retry => self.retry_task(id).await.map(drop),
                BatchOp::Delete => self.delete_task(id).await,
            };

            match result {
                Ok(()) => outcome.succeeded.push(id.clone()),
                Err(e) => {
                    warn!(task_id = %id, op = op.as_str(), error = %e, "Batch operation failed for task");
                    outcome.failed.push(BatchFailure {
                        task_id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            op = op.as_str(),
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Batch operation finished"
        );
        outcome
    }

    // =========================================================================
    // Bulk commands
    // =========================================================================

    /// Queue every pending task, oldest first. Returns how many were queued.
    pub async fn start_all(&self) -> CenterResult<usize> {
        let ids = self.store.task_ids_with_status(TaskStatus::Pending)?;
        Ok(self.start_tasks(&ids).await.succeeded.len())
    }

    /// Halt admission and pause every running task.
    pub async fn pause_all(&self) -> CenterResult<usize> {
        Ok(self.scheduler.pause_all().await?)
    }

    /// Re-queue every paused task and resume admission.
    pub async fn resume_all(&self) -> CenterResult<usize> {
        Ok(self.scheduler.resume_all().await?)
    }

    /// Cancel every task that has not finished. Nothing is deleted.
    pub async fn cancel_all(&self) -> CenterResult<usize> {
        Ok(self.scheduler.cancel_all().await?)
    }

    /// Queue a fresh attempt of every failed task.
    pub async fn retry_all_failed(&self) -> CenterResult<usize> {
        let ids = self.store.task_ids_with_status(TaskStatus::Failed)?;
        Ok(self.retry_tasks(&ids).await.succeeded.len())
    }

    pub async fn set_concurrency(&self, max_concurrent_tasks: usize, threads_per_task: usize) -> CenterResult<()> {
        Ok(self
            .scheduler
            .set_concurrency(max_concurrent_tasks, threads_per_task)
            .await?)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_task(&self, id: &TaskId) -> CenterResult<Task> {
        Ok(self.store.get_task(id)?)
    }

    pub fn list_tasks(&self, filter: &TaskFilter, pagination: Pagination) -> CenterResult<TaskPage> {
        Ok(self.store.list_tasks(filter, pagination)?)
    }

    /// A task's log, oldest first, optionally capped to the latest `limit`.
    pub fn task_logs(&self, id: &TaskId, limit: Option<u32>) -> CenterResult<Vec<LogEntry>> {
        Ok(self.store.task_logs(id, limit)?)
    }

    pub async fn queue_status(&self) -> CenterResult<QueueStatus> {
        Ok(self.scheduler.status().await?)
    }

    pub fn stats(&self) -> CenterResult<StoreStats> {
        self.maintenance.stats()
    }

    /// Receive lifecycle events published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    // =========================================================================
    // Maintenance shortcuts
    // =========================================================================

    pub fn check_integrity(&self) -> CenterResult<IntegrityReport> {
        self.maintenance.check_integrity()
    }

    pub fn cleanup_older_than(&self, days: u32) -> CenterResult<usize> {
        self.maintenance.cleanup_older_than(days)
    }

    pub fn clear_logs(&self, task_id: Option<&TaskId>) -> CenterResult<usize> {
        self.maintenance.clear_logs(task_id)
    }

    /// Stop admitting, wait for running executions up to the shutdown
    /// timeout and close the event bus. Returns `true` if every execution
    /// finished in time.
    pub async fn shutdown(&self) -> bool {
        let drained = self.scheduler.shutdown(self.config.shutdown_timeout).await;
        self.bus.close();
        info!(drained, "Task center stopped");
        drained
    }
}
