//! Task scheduler.
//!
//! Admission is strictly FIFO and serialized by one async mutex. Each
//! admitted task is handed to the [`TaskExecutor`] on its own tokio task; the
//! scheduler only tracks which runs are attached and resolves their outcomes
//! against the store.
//!
//! Pause and cancel are cooperative: the run is signalled and given a bounded
//! time to resolve. A run that does not resolve in time is detached, the
//! store is updated regardless, and anything the run reports later is
//! ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use mediaq_models::{QueueStatus, Task, TaskError, TaskEvent, TaskId, TaskStatus, TransitionError};
use mediaq_store::TaskStore;

use crate::config::{validate_concurrency, SchedulerConfig};
use crate::error::{QueueError, QueueResult};
use crate::execution::{
    ControlSignal, ExecutionContext, ExecutionOutcome, ExecutionRequest, ProgressReporter,
    TaskExecutor,
};
use crate::logging::TaskLogger;
use crate::metrics;
use crate::progress::ProgressBus;

/// Result of reconciling the store with the (empty) set of live runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Tasks found running and marked failed
    pub interrupted: usize,
    /// Tasks found queued and put back in line
    pub requeued: usize,
    /// Running tasks that could not be marked failed
    pub unresolved: usize,
}

/// What prompted a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryCause {
    Startup,
    /// The store contents were replaced; nothing is written to task logs so
    /// the new contents read back as they were.
    StoreSwap,
    Repair,
}

/// An attached execution.
struct RunningTask {
    run_id: u64,
    control: watch::Sender<ControlSignal>,
    done: watch::Sender<bool>,
    live: Arc<AtomicBool>,
    requested: ControlSignal,
}

impl RunningTask {
    /// Stop accepting anything from this run and release its waiters.
    fn detach(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.done.send_replace(true);
    }
}

pub(crate) struct SchedulerState {
    queue: VecDeque<TaskId>,
    running: HashMap<TaskId, RunningTask>,
    max_concurrent: usize,
    threads_per_task: usize,
    admission_paused: bool,
    shutting_down: bool,
}

impl SchedulerState {
    fn can_admit(&self) -> bool {
        !self.admission_paused && !self.shutting_down && self.running.len() < self.max_concurrent
    }

    fn is_attached(&self, id: &TaskId, run_id: u64) -> bool {
        self.running.get(id).map(|r| r.run_id) == Some(run_id)
    }
}

/// Exclusive hold on admission.
///
/// While a guard exists no task is admitted and no execution outcome is
/// recorded. Pass it to [`Scheduler::reload`] after swapping the store, or
/// to [`Scheduler::resync`] after repairing it in place.
pub struct AdmissionGuard {
    state: OwnedMutexGuard<SchedulerState>,
}

impl AdmissionGuard {
    /// Number of attached executions.
    pub fn running(&self) -> usize {
        self.state.running.len()
    }

    pub fn queued(&self) -> usize {
        self.state.queue.len()
    }

    /// Keep admission halted after the guard is released, as `pause_all`
    /// does. `resume_all` lifts it.
    pub fn pause_admission(&mut self) {
        self.state.admission_paused = true;
    }
}

/// Wait for a run's completion flag.
struct PendingAck {
    task_id: TaskId,
    run_id: u64,
    done: watch::Receiver<bool>,
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    loop {
        if *done.borrow_and_update() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}

/// How a running task leaves the `running` state.
enum Resolution {
    Complete(Vec<String>),
    Fail(String),
    Pause,
    Cancel,
}

impl Resolution {
    /// Combine the requested control signal with what the executor reported.
    fn from_outcome(requested: ControlSignal, outcome: ExecutionOutcome) -> Self {
        match (requested, outcome) {
            (ControlSignal::Cancel, _) => Resolution::Cancel,
            (_, ExecutionOutcome::Completed { outputs }) => Resolution::Complete(outputs),
            (_, ExecutionOutcome::Failed { message }) => Resolution::Fail(message),
            (ControlSignal::Pause, _) | (_, ExecutionOutcome::Paused) => Resolution::Pause,
            (ControlSignal::Run, ExecutionOutcome::Cancelled) => Resolution::Cancel,
        }
    }
}

struct Inner {
    store: Arc<TaskStore>,
    bus: Arc<ProgressBus>,
    executor: Arc<dyn TaskExecutor>,
    state: Arc<Mutex<SchedulerState>>,
    pause_timeout: Duration,
    cancel_timeout: Duration,
    next_run: AtomicU64,
    idle: Notify,
}

impl Inner {
    fn logger(&self, id: &TaskId) -> TaskLogger {
        TaskLogger::new(Arc::clone(&self.store), id, "scheduler")
    }

    fn announce(&self, task: &Task) {
        self.bus.publish(TaskEvent::for_status(task));
    }

    fn notify_if_idle(&self, state: &SchedulerState) {
        if state.running.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Fill free slots from the head of the queue.
    fn admit(self: &Arc<Self>, state: &mut SchedulerState) {
        while state.can_admit() {
            let Some(task_id) = state.queue.pop_front() else {
                break;
            };

            let mut task = match self.store.get_task(&task_id) {
                Ok(task) => task,
                Err(e) if e.is_transient() => {
                    error!(task_id = %task_id, error = %e, "Store unavailable, halting admission");
                    state.queue.push_front(task_id);
                    break;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Dropping unreadable queue entry");
                    continue;
                }
            };
            if task.status != TaskStatus::Queued {
                debug!(task_id = %task_id, status = %task.status, "Skipping stale queue entry");
                continue;
            }

            let resumed = task.started_at.is_some();
            if let Err(e) = task.start_running() {
                warn!(task_id = %task_id, error = %e, "Cannot admit task");
                continue;
            }
            if let Err(e) = self.store.update_task(&task, TaskStatus::Queued) {
                if e.is_transient() {
                    error!(task_id = %task_id, error = %e, "Failed to mark task running, keeping it at the head");
                    state.queue.push_front(task_id);
                    break;
                }
                error!(task_id = %task_id, error = %e, "Failed to mark task running");
                continue;
            }

            self.launch(state, task, resumed);
        }

        metrics::set_occupancy(state.running.len(), state.queue.len());
    }

    /// Attach a run for an admitted task and spawn its execution.
    fn launch(self: &Arc<Self>, state: &mut SchedulerState, task: Task, resumed: bool) {
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let (control, signal) = watch::channel(ControlSignal::Run);
        let (done, _) = watch::channel(false);
        let live = Arc::new(AtomicBool::new(true));

        let reporter = Arc::new(ProgressReporter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            task.id.clone(),
            Arc::clone(&live),
            task.progress,
        ));
        let ctx = ExecutionContext::new(task.id.clone(), signal, reporter);

        state.running.insert(
            task.id.clone(),
            RunningTask {
                run_id,
                control,
                done,
                live,
                requested: ControlSignal::Run,
            },
        );

        metrics::record_admitted(task.task_type.as_str());
        self.announce(&task);

        let logger = self.logger(&task.id);
        if resumed {
            logger.log_start(&format!("resuming at {}%", task.progress));
        } else {
            logger.log_start(&format!("{} with {} input(s)", task.task_type, task.inputs.len()));
        }

        let request = ExecutionRequest {
            threads_per_task: state.threads_per_task,
            resumed,
            task,
        };
        let task_id = request.task.id.clone();
        let executor = Arc::clone(&self.executor);
        let inner = Arc::clone(self);

        tokio::spawn(
            async move {
                let execution = tokio::spawn(async move { executor.execute(request, ctx).await });
                let outcome = match execution.await {
                    Ok(outcome) => outcome,
                    Err(e) => ExecutionOutcome::failed(format!("Execution aborted: {}", e)),
                };
                inner.finish(&task_id, run_id, outcome).await;
            }
            .instrument(logger.create_span()),
        );
    }

    /// Record the outcome of a run and admit the next task.
    async fn finish(self: &Arc<Self>, task_id: &TaskId, run_id: u64, outcome: ExecutionOutcome) {
        let mut state = self.state.lock().await;
        if !state.is_attached(task_id, run_id) {
            debug!(
                task_id = %task_id,
                run_id,
                outcome = outcome.as_str(),
                "Ignoring outcome of detached run"
            );
            return;
        }
        let Some(run) = state.running.remove(task_id) else {
            return;
        };
        run.live.store(false, Ordering::SeqCst);

        let resolution = Resolution::from_outcome(run.requested, outcome);
        match self.store.get_task(task_id) {
            Ok(task) if task.status == TaskStatus::Running => {
                let cancel = matches!(resolution, Resolution::Cancel);
                if let Err(e) = self.apply(task, resolution) {
                    error!(task_id = %task_id, error = %e, "Failed to record execution outcome");
                    self.force_out_of_running(task_id, cancel, &e.to_string());
                }
            }
            Ok(task) => {
                debug!(task_id = %task_id, status = %task.status, "Run resolved after status changed");
            }
            Err(e) if e.is_not_found() => {
                debug!(task_id = %task_id, "Run resolved for deleted task");
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Run resolved for unreadable task");
                let cancel = matches!(resolution, Resolution::Cancel);
                self.force_out_of_running(task_id, cancel, &e.to_string());
            }
        }

        self.admit(&mut state);
        run.done.send_replace(true);
        self.notify_if_idle(&state);
    }

    /// Move a running task out of `running` and announce it.
    fn apply(&self, mut task: Task, resolution: Resolution) -> QueueResult<Task> {
        let logger = self.logger(&task.id);

        match resolution {
            Resolution::Complete(outputs) => task.complete(outputs)?,
            Resolution::Fail(message) => task.fail(TaskError::execution(message))?,
            Resolution::Pause => task.pause()?,
            Resolution::Cancel => task.cancel()?,
        }
        self.store.update_task(&task, TaskStatus::Running)?;
        self.announce(&task);

        match task.status {
            TaskStatus::Completed => logger.log_completion(&format!(
                "{} output(s) in {} ms",
                task.outputs.len(),
                task.execution_time_ms.unwrap_or_default()
            )),
            TaskStatus::Failed => {
                let message = task.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default();
                logger.log_error(&format!("Task failed: {}", message));
            }
            TaskStatus::Paused => {
                metrics::record_paused();
                logger.log_info(&format!("Task paused at {}%", task.progress));
            }
            _ => logger.log_info("Task cancelled"),
        }
        if task.is_terminal() {
            metrics::record_finished(
                task.task_type.as_str(),
                task.status.as_str(),
                task.execution_time_ms,
            );
        }

        Ok(task)
    }

    /// Cancel a task that has no attached run.
    fn cancel_idle(&self, mut task: Task) -> QueueResult<Task> {
        let previous = task.status;
        task.cancel()?;
        self.store.update_task(&task, previous)?;
        self.announce(&task);
        self.logger(&task.id).log_info("Task cancelled");
        metrics::record_finished(task.task_type.as_str(), task.status.as_str(), None);
        Ok(task)
    }

    /// Cancel an idle task by ID. A row that no longer decodes is cancelled
    /// with a raw status write.
    fn cancel_idle_id(&self, id: &TaskId, expected: TaskStatus) -> QueueResult<()> {
        match self.store.get_task(id) {
            Ok(task) => self.cancel_idle(task).map(|_| ()),
            Err(e) if e.is_corruption() => {
                warn!(task_id = %id, error = %e, "Cancelling unreadable task");
                if self.force(id, expected, None)? {
                    self.logger(id).log_info("Task cancelled");
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `failed` (with `error`) or `cancelled` without decoding the row,
    /// then announce it. Returns `false` when the row was not in `expected`.
    fn force(&self, id: &TaskId, expected: TaskStatus, error: Option<TaskError>) -> QueueResult<bool> {
        let status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Cancelled
        };
        if !self.store.force_terminal(id, expected, status, error.as_ref())? {
            return Ok(false);
        }

        let event = match error {
            Some(error) => TaskEvent::TaskFailed {
                task_id: id.clone(),
                error,
            },
            None => TaskEvent::TaskCancelled { task_id: id.clone() },
        };
        self.bus.publish(event);
        Ok(true)
    }

    /// Resolve a run whose outcome could not be recorded, so no `running`
    /// row outlives its run.
    fn force_out_of_running(&self, id: &TaskId, cancel: bool, cause: &str) {
        let error = (!cancel)
            .then(|| TaskError::execution(format!("Outcome could not be recorded: {}", cause)));
        match self.force(id, TaskStatus::Running, error) {
            Ok(true) => self
                .logger(id)
                .log_warning(&format!("Task forced out of running: {}", cause)),
            Ok(false) => {}
            Err(e) => error!(task_id = %id, error = %e, "Failed to force task out of running"),
        }
    }

    /// Mark a task found running without an attached run as failed.
    fn interrupt(&self, id: &TaskId, cause: RecoveryCause) -> QueueResult<()> {
        match self.store.get_task(id) {
            Ok(mut task) => {
                task.interrupt()?;
                self.store.update_task(&task, TaskStatus::Running)?;
                self.announce(&task);
            }
            Err(e) if e.is_corruption() => {
                warn!(task_id = %id, error = %e, "Interrupting unreadable task");
                self.force(id, TaskStatus::Running, Some(TaskError::recovery_interrupted()))?;
            }
            Err(e) => return Err(e.into()),
        }

        let message = "Task was running when the application stopped; marked as failed";
        if cause == RecoveryCause::StoreSwap {
            warn!(task_id = %id, "{}", message);
        } else {
            self.logger(id).log_warning(message);
        }
        Ok(())
    }

    /// Signal an attached run. Returns `None` when the task has no run.
    fn request_stop(
        &self,
        state: &mut SchedulerState,
        id: &TaskId,
        signal: ControlSignal,
    ) -> Option<PendingAck> {
        let run = state.running.get_mut(id)?;
        run.requested = run.requested.merge(signal);
        run.control.send_replace(run.requested);
        debug!(task_id = %id, signal = run.requested.as_str(), "Signalled running task");

        Some(PendingAck {
            task_id: id.clone(),
            run_id: run.run_id,
            done: run.done.subscribe(),
        })
    }

    /// Wait for signalled runs to resolve, forcing those that do not.
    async fn await_acks(self: &Arc<Self>, pending: Vec<PendingAck>, signal: ControlSignal, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut overdue = Vec::new();
        for ack in pending {
            if tokio::time::timeout_at(deadline, wait_done(ack.done.clone()))
                .await
                .is_err()
            {
                overdue.push(ack);
            }
        }
        if overdue.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        let mut forced = Vec::new();
        for ack in overdue {
            if !state.is_attached(&ack.task_id, ack.run_id) {
                continue;
            }
            let Some(run) = state.running.remove(&ack.task_id) else {
                continue;
            };
            run.live.store(false, Ordering::SeqCst);

            warn!(
                task_id = %ack.task_id,
                action = signal.as_str(),
                timeout_ms = timeout.as_millis() as u64,
                "Execution did not acknowledge in time, forcing store update"
            );
            metrics::record_forced(run.requested.as_str());

            let resolution = if run.requested == ControlSignal::Cancel {
                Resolution::Cancel
            } else {
                Resolution::Pause
            };
            let cancel = matches!(resolution, Resolution::Cancel);
            match self.store.get_task(&ack.task_id) {
                Ok(task) if task.status == TaskStatus::Running => {
                    if let Err(e) = self.apply(task, resolution) {
                        error!(task_id = %ack.task_id, error = %e, "Failed to force task state");
                        self.force_out_of_running(&ack.task_id, cancel, &e.to_string());
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(task_id = %ack.task_id, error = %e, "Failed to load task to force");
                    self.force_out_of_running(&ack.task_id, cancel, &e.to_string());
                }
            }
            forced.push(run);
        }

        self.admit(&mut state);
        for run in forced {
            run.done.send_replace(true);
        }
        self.notify_if_idle(&state);
    }

    /// Reconcile the store with the attached runs and rebuild the queue.
    ///
    /// Rows that no longer decode do not stop the pass: queued ones are put
    /// in line by ID and dropped at admission, running ones are failed with a
    /// raw status write.
    fn recover(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        cause: RecoveryCause,
    ) -> QueueResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for id in self.store.task_ids_with_status(TaskStatus::Running)? {
            if state.running.contains_key(&id) {
                continue;
            }
            match self.interrupt(&id, cause) {
                Ok(()) => report.interrupted += 1,
                Err(e) => {
                    error!(task_id = %id, error = %e, "Failed to interrupt task");
                    report.unresolved += 1;
                }
            }
        }

        state.queue.clear();
        for id in self.store.task_ids_with_status(TaskStatus::Queued)? {
            state.queue.push_back(id);
            report.requeued += 1;
        }

        metrics::record_interrupted(report.interrupted);
        info!(
            cause = ?cause,
            interrupted = report.interrupted,
            requeued = report.requeued,
            unresolved = report.unresolved,
            admission_paused = state.admission_paused,
            "Recovered scheduler state"
        );

        self.admit(state);
        Ok(report)
    }
}

/// Concurrency-capped FIFO scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler. Nothing is admitted until [`Scheduler::recover`]
    /// or a start command runs.
    pub fn new(
        store: Arc<TaskStore>,
        bus: Arc<ProgressBus>,
        executor: Arc<dyn TaskExecutor>,
        config: SchedulerConfig,
    ) -> QueueResult<Self> {
        config.validate()?;

        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            threads_per_task = config.threads_per_task,
            "Creating task scheduler"
        );

        let state = SchedulerState {
            queue: VecDeque::new(),
            running: HashMap::new(),
            max_concurrent: config.max_concurrent_tasks,
            threads_per_task: config.threads_per_task,
            admission_paused: false,
            shutting_down: false,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                bus,
                executor,
                state: Arc::new(Mutex::new(state)),
                pause_timeout: config.pause_timeout,
                cancel_timeout: config.cancel_timeout,
                next_run: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.inner.bus
    }

    /// Startup recovery: running tasks become failed (`recovery_interrupted`)
    /// and queued tasks are re-admitted in their original order.
    pub async fn recover(&self) -> QueueResult<RecoveryReport> {
        let mut state = self.inner.state.lock().await;
        self.inner.recover(&mut state, RecoveryCause::Startup)
    }

    /// Queue a pending task.
    pub async fn start_task(&self, id: &TaskId) -> QueueResult<Task> {
        self.enqueue(id, Task::submit, "Queued for execution").await
    }

    /// Put a paused task back in the queue.
    pub async fn resume_task(&self, id: &TaskId) -> QueueResult<Task> {
        self.enqueue(id, Task::resume, "Resumed, waiting for a free slot").await
    }

    /// Queue a failed or cancelled task for a fresh attempt.
    pub async fn retry_task(&self, id: &TaskId) -> QueueResult<Task> {
        self.enqueue(id, Task::retry, "Queued for retry").await
    }

    async fn enqueue(
        &self,
        id: &TaskId,
        transition: fn(&mut Task) -> Result<(), TransitionError>,
        message: &str,
    ) -> QueueResult<Task> {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(QueueError::ShuttingDown);
        }

        let mut task = self.inner.store.get_task(id)?;
        let previous = task.status;
        transition(&mut task)?;
        self.inner.store.update_task(&task, previous)?;

        state.queue.push_back(task.id.clone());
        self.inner.announce(&task);
        self.inner.logger(id).log_info(message);
        self.inner.admit(&mut state);
        drop(state);

        Ok(self.inner.store.get_task(id)?)
    }

    /// Pause a running task, waiting up to the pause timeout for the
    /// execution to stop. Returns the task as resolved.
    pub async fn pause_task(&self, id: &TaskId) -> QueueResult<Task> {
        let mut state = self.inner.state.lock().await;
        let task = self.inner.store.get_task(id)?;
        if task.status != TaskStatus::Running {
            return Err(TransitionError {
                from: task.status,
                to: TaskStatus::Paused,
            }
            .into());
        }

        match self.inner.request_stop(&mut state, id, ControlSignal::Pause) {
            Some(ack) => {
                drop(state);
                self.inner
                    .await_acks(vec![ack], ControlSignal::Pause, self.inner.pause_timeout)
                    .await;
            }
            None => {
                self.inner.apply(task, Resolution::Pause)?;
                self.inner.admit(&mut state);
            }
        }

        Ok(self.inner.store.get_task(id)?)
    }

    /// Cancel a task. Running tasks are cancelled cooperatively; the store
    /// ends up `cancelled` even if the execution never acknowledges.
    pub async fn cancel_task(&self, id: &TaskId) -> QueueResult<Task> {
        let mut state = self.inner.state.lock().await;
        let task = self.inner.store.get_task(id)?;

        match task.status {
            TaskStatus::Running => match self.inner.request_stop(&mut state, id, ControlSignal::Cancel) {
                Some(ack) => {
                    drop(state);
                    self.inner
                        .await_acks(vec![ack], ControlSignal::Cancel, self.inner.cancel_timeout)
                        .await;
                }
                None => {
                    self.inner.apply(task, Resolution::Cancel)?;
                    self.inner.admit(&mut state);
                }
            },
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Paused => {
                state.queue.retain(|queued| queued != id);
                self.inner.cancel_idle(task)?;
            }
            other => {
                return Err(TransitionError {
                    from: other,
                    to: TaskStatus::Cancelled,
                }
                .into())
            }
        }

        Ok(self.inner.store.get_task(id)?)
    }

    /// Delete a task that is not running.
    pub async fn delete_task(&self, id: &TaskId) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.store.delete_task(id)?;
        state.queue.retain(|queued| queued != id);
        self.inner.bus.publish(TaskEvent::TaskDeleted { task_id: id.clone() });
        Ok(())
    }

    /// Halt admission and pause every running task. Returns how many
    /// running tasks were asked to pause.
    pub async fn pause_all(&self) -> QueueResult<usize> {
        let mut state = self.inner.state.lock().await;
        state.admission_paused = true;

        let ids: Vec<TaskId> = state.running.keys().cloned().collect();
        let pending: Vec<PendingAck> = ids
            .iter()
            .filter_map(|id| self.inner.request_stop(&mut state, id, ControlSignal::Pause))
            .collect();
        drop(state);

        let count = pending.len();
        info!(count, "Pausing all running tasks");
        self.inner
            .await_acks(pending, ControlSignal::Pause, self.inner.pause_timeout)
            .await;
        Ok(count)
    }

    /// Re-queue every paused task and resume admission.
    pub async fn resume_all(&self) -> QueueResult<usize> {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        state.admission_paused = false;

        let mut resumed = 0;
        let mut failed = Vec::new();
        for id in self.inner.store.task_ids_with_status(TaskStatus::Paused)? {
            let result = self
                .inner
                .store
                .get_task(&id)
                .map_err(QueueError::from)
                .and_then(|mut task| {
                    task.resume()?;
                    self.inner.store.update_task(&task, TaskStatus::Paused)?;
                    Ok(task)
                });
            match result {
                Ok(task) => {
                    state.queue.push_back(task.id.clone());
                    self.inner.announce(&task);
                    self.inner.logger(&task.id).log_info("Resumed, waiting for a free slot");
                    resumed += 1;
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to resume task");
                    failed.push(format!("{}: {}", id, e));
                }
            }
        }

        info!(resumed, skipped = failed.len(), "Resumed admission");
        self.inner.admit(&mut state);

        if !failed.is_empty() {
            return Err(QueueError::Incomplete {
                action: "resume_all",
                failed,
            });
        }
        Ok(resumed)
    }

    /// Cancel every pending, queued and paused task, then every running one.
    /// Nothing is deleted. Returns how many tasks were cancelled or asked to
    /// cancel.
    pub async fn cancel_all(&self) -> QueueResult<usize> {
        let mut state = self.inner.state.lock().await;

        let mut cancelled = 0;
        let mut failed = Vec::new();
        for status in [TaskStatus::Pending, TaskStatus::Queued, TaskStatus::Paused] {
            let ids = match self.inner.store.task_ids_with_status(status) {
                Ok(ids) => ids,
                Err(e) => {
                    error!(status = %status, error = %e, "Failed to list tasks to cancel");
                    failed.push(format!("{} tasks: {}", status, e));
                    continue;
                }
            };
            for id in ids {
                match self.inner.cancel_idle_id(&id, status) {
                    Ok(()) => cancelled += 1,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Failed to cancel task");
                        failed.push(format!("{}: {}", id, e));
                    }
                }
            }
        }
        state.queue.clear();

        let ids: Vec<TaskId> = state.running.keys().cloned().collect();
        let pending: Vec<PendingAck> = ids
            .iter()
            .filter_map(|id| self.inner.request_stop(&mut state, id, ControlSignal::Cancel))
            .collect();
        drop(state);

        cancelled += pending.len();
        info!(cancelled, skipped = failed.len(), "Cancelling all tasks");
        self.inner
            .await_acks(pending, ControlSignal::Cancel, self.inner.cancel_timeout)
            .await;

        if !failed.is_empty() {
            return Err(QueueError::Incomplete {
                action: "cancel_all",
                failed,
            });
        }
        Ok(cancelled)
    }

    /// Change concurrency limits. Raising the cap admits immediately;
    /// lowering it never preempts running tasks.
    pub async fn set_concurrency(&self, max_concurrent_tasks: usize, threads_per_task: usize) -> QueueResult<()> {
        validate_concurrency(max_concurrent_tasks, threads_per_task)?;

        let mut state = self.inner.state.lock().await;
        state.max_concurrent = max_concurrent_tasks;
        state.threads_per_task = threads_per_task;
        info!(max_concurrent_tasks, threads_per_task, "Updated concurrency limits");

        self.inner.admit(&mut state);
        Ok(())
    }

    /// Occupancy snapshot.
    pub async fn status(&self) -> QueueResult<QueueStatus> {
        let state = self.inner.state.lock().await;
        let paused = self.inner.store.count_with_status(TaskStatus::Paused)?;

        Ok(QueueStatus {
            running: state.running.len(),
            queued: state.queue.len(),
            paused: paused as usize,
            max_concurrent_tasks: state.max_concurrent,
            threads_per_task: state.threads_per_task,
            admission_paused: state.admission_paused,
        })
    }

    /// Whether the task has an attached execution.
    pub async fn is_running(&self, id: &TaskId) -> bool {
        self.inner.state.lock().await.running.contains_key(id)
    }

    /// Exclude admission until the guard is dropped or passed to `reload`.
    pub async fn hold_admission(&self) -> AdmissionGuard {
        AdmissionGuard {
            state: Arc::clone(&self.inner.state).lock_owned().await,
        }
    }

    /// Rebuild scheduler state after the store contents were replaced.
    ///
    /// Every attached run is signalled to cancel and detached, then recovery
    /// runs against the new contents without writing task log entries.
    /// Admission resumes when this returns unless
    /// [`AdmissionGuard::pause_admission`] was called.
    pub async fn reload(&self, mut guard: AdmissionGuard) -> QueueResult<RecoveryReport> {
        let state = &mut *guard.state;

        for (task_id, run) in state.running.drain() {
            run.control.send_replace(ControlSignal::Cancel);
            run.detach();
            warn!(task_id = %task_id, run_id = run.run_id, "Detached execution after store swap");
        }
        self.inner.notify_if_idle(state);

        self.inner.recover(state, RecoveryCause::StoreSwap)
    }

    /// Re-read queued and running tasks after an in-place repair. Attached
    /// runs are left alone.
    pub async fn resync(&self, mut guard: AdmissionGuard) -> QueueResult<RecoveryReport> {
        self.inner.recover(&mut guard.state, RecoveryCause::Repair)
    }

    /// Stop admitting and wait up to `timeout` for attached runs to finish.
    /// Returns `true` when every run finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            info!(running = state.running.len(), "Scheduler shutting down");
        }

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.idle.notified();
                if self.inner.state.lock().await.running.is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            let remaining = self.inner.state.lock().await.running.len();
            warn!(remaining, "Shutdown timed out with executions still running");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mediaq_models::{NewTask, TaskErrorKind, TaskInput, TaskType};
    use mediaq_store::StoreConfig;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio_test::{assert_err, assert_ok};

    /// Finishes one execution per released permit; honours signals unless
    /// `stubborn`.
    struct GateExecutor {
        gate: Arc<Semaphore>,
        stubborn: bool,
        started: AtomicUsize,
        resumed: AtomicUsize,
        threads_seen: AtomicUsize,
    }

    impl GateExecutor {
        fn new(stubborn: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                stubborn,
                started: AtomicUsize::new(0),
                resumed: AtomicUsize::new(0),
                threads_seen: AtomicUsize::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl TaskExecutor for GateExecutor {
        async fn execute(&self, request: ExecutionRequest, mut ctx: ExecutionContext) -> ExecutionOutcome {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.threads_seen.store(request.threads_per_task, Ordering::SeqCst);
            if request.resumed {
                self.resumed.fetch_add(1, Ordering::SeqCst);
            }
            ctx.report_progress(40, Some("encoding"));

            let output = format!("{}/{}.mp4", request.task.output_dir, request.task.id);
            if self.stubborn {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                return ExecutionOutcome::completed(vec![output]);
            }

            tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    ExecutionOutcome::completed(vec![output])
                }
                signal = ctx.wait_for_signal() => match signal {
                    ControlSignal::Pause => ExecutionOutcome::Paused,
                    _ => ExecutionOutcome::Cancelled,
                },
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute(&self, _request: ExecutionRequest, _ctx: ExecutionContext) -> ExecutionOutcome {
            panic!("decoder exploded");
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<TaskStore>,
        scheduler: Scheduler,
    }

    fn fixture(executor: Arc<dyn TaskExecutor>, max: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(StoreConfig::in_memory(dir.path())).unwrap());
        let config = SchedulerConfig::default()
            .with_concurrency(max, 3)
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(ProgressBus::default()),
            executor,
            config,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store,
            scheduler,
        }
    }

    fn create(store: &TaskStore, name: &str) -> TaskId {
        let task = Task::new(
            NewTask::new(TaskType::VideoCompress, name, "/tmp/out")
                .with_input(TaskInput::main("/videos/in.mp4")),
        );
        store.create_task(&task).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn status_of(store: &TaskStore, id: &TaskId) -> TaskStatus {
        store.get_task(id).unwrap().status
    }

    #[tokio::test]
    async fn test_admits_fifo_up_to_limit() {
        let executor = GateExecutor::new(false);
        let f = fixture(executor.clone(), 2);
        let ids: Vec<_> = (0..3).map(|i| create(&f.store, &format!("t{}", i))).collect();

        for id in &ids {
            f.scheduler.start_task(id).await.unwrap();
        }

        let status = f.scheduler.status().await.unwrap();
        assert_eq!(status.running, 2);
        assert_eq!(status.queued, 1);
        assert_eq!(status_of(&f.store, &ids[0]), TaskStatus::Running);
        assert_eq!(status_of(&f.store, &ids[1]), TaskStatus::Running);
        assert_eq!(status_of(&f.store, &ids[2]), TaskStatus::Queued);
        assert_eq!(executor.threads_seen.load(Ordering::SeqCst), 3);

        executor.release(1);
        eventually(|| status_of(&f.store, &ids[2]) == TaskStatus::Running).await;
        let done = ids.iter().filter(|id| status_of(&f.store, id) == TaskStatus::Completed).count();
        assert_eq!(done, 1);
    }

    #[tokio::test]
    async fn test_pause_frees_slot_and_resume_reexecutes() {
        let executor = GateExecutor::new(false);
        let f = fixture(executor.clone(), 1);
        let first = create(&f.store, "first");
        let second = create(&f.store, "second");
        f.scheduler.start_task(&first).await.unwrap();
        f.scheduler.start_task(&second).await.unwrap();
        eventually(|| f.store.get_task(&first).unwrap().progress == 40).await;

        let paused = f.scheduler.pause_task(&first).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert_eq!(paused.progress, 40);
        assert_eq!(status_of(&f.store, &second), TaskStatus::Running);

        f.scheduler.resume_task(&first).await.unwrap();
        assert_eq!(status_of(&f.store, &first), TaskStatus::Queued);

        executor.release(1);
        eventually(|| status_of(&f.store, &first) == TaskStatus::Running).await;
        assert_eq!(executor.resumed.load(Ordering::SeqCst), 1);
        assert!(f.store.get_task(&first).unwrap().progress >= 40);
    }

    #[tokio::test]
    async fn test_pause_rejects_non_running() {
        let f = fixture(GateExecutor::new(false), 1);
        let id = create(&f.store, "pending");
        let err = f.scheduler.pause_task(&id).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(mediaq_store::StoreError::InvalidTransition(_))));
        assert_eq!(status_of(&f.store, &id), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_is_forced() {
        let executor = GateExecutor::new(true);
        let f = fixture(executor.clone(), 1);
        let id = create(&f.store, "stubborn");
        f.scheduler.start_task(&id).await.unwrap();

        let task = f.scheduler.cancel_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(f.scheduler.status().await.unwrap().running, 0);

        // The late completion must not resurrect the task
        executor.release(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = f.store.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_removes_from_queue() {
        let f = fixture(GateExecutor::new(false), 1);
        let running = create(&f.store, "running");
        let queued = create(&f.store, "queued");
        f.scheduler.start_task(&running).await.unwrap();
        f.scheduler.start_task(&queued).await.unwrap();

        f.scheduler.cancel_task(&queued).await.unwrap();
        let status = f.scheduler.status().await.unwrap();
        assert_eq!(status.queued, 0);
        assert_eq!(status_of(&f.store, &queued), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recover_interrupts_running_and_requeues_queued() {
        let executor = GateExecutor::new(false);
        let f = fixture(executor.clone(), 1);

        let crashed = create(&f.store, "crashed");
        let waiting = create(&f.store, "waiting");
        let mut task = f.store.get_task(&crashed).unwrap();
        task.submit().unwrap();
        f.store.update_task(&task, TaskStatus::Pending).unwrap();
        task.start_running().unwrap();
        f.store.update_task(&task, TaskStatus::Queued).unwrap();
        let mut task = f.store.get_task(&waiting).unwrap();
        task.submit().unwrap();
        f.store.update_task(&task, TaskStatus::Pending).unwrap();

        let report = f.scheduler.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                interrupted: 1,
                requeued: 1,
                unresolved: 0
            }
        );

        let crashed = f.store.get_task(&crashed).unwrap();
        assert_eq!(crashed.status, TaskStatus::Failed);
        assert_eq!(crashed.error.unwrap().kind, TaskErrorKind::RecoveryInterrupted);
        assert_eq!(status_of(&f.store, &waiting), TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_reload_can_leave_admission_paused() {
        let executor = GateExecutor::new(false);
        let f = fixture(executor.clone(), 1);
        let running = create(&f.store, "running");
        let queued = create(&f.store, "queued");
        f.scheduler.start_task(&running).await.unwrap();
        f.scheduler.start_task(&queued).await.unwrap();
        let logs_before = f.store.stats().unwrap().log_count;

        let mut guard = f.scheduler.hold_admission().await;
        guard.pause_admission();
        let report = f.scheduler.reload(guard).await.unwrap();
        assert_eq!((report.interrupted, report.requeued), (1, 1));

        let status = f.scheduler.status().await.unwrap();
        assert!(status.admission_paused);
        assert_eq!((status.running, status.queued), (0, 1));
        assert_eq!(status_of(&f.store, &running), TaskStatus::Failed);
        assert_eq!(status_of(&f.store, &queued), TaskStatus::Queued);
        assert_eq!(f.store.stats().unwrap().log_count, logs_before);

        assert_eq!(f.scheduler.resume_all().await.unwrap(), 0);
        assert_eq!(status_of(&f.store, &queued), TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_set_concurrency_admits_immediately() {
        let f = fixture(GateExecutor::new(false), 1);
        let ids: Vec<_> = (0..3).map(|i| create(&f.store, &format!("t{}", i))).collect();
        for id in &ids {
            f.scheduler.start_task(id).await.unwrap();
        }
        assert_eq!(f.scheduler.status().await.unwrap().running, 1);

        assert_ok!(f.scheduler.set_concurrency(3, 1).await);
        assert_eq!(f.scheduler.status().await.unwrap().running, 3);

        assert_ok!(f.scheduler.set_concurrency(1, 1).await);
        assert_eq!(f.scheduler.status().await.unwrap().running, 3);

        assert!(matches!(
            f.scheduler.set_concurrency(0, 1).await,
            Err(QueueError::Validation(_))
        ));
        assert_err!(f.scheduler.set_concurrency(2, 0).await);
    }

    #[tokio::test]
    async fn test_pause_all_halts_admission_until_resume_all() {
        let executor = GateExecutor::new(false);
        let f = fixture(executor.clone(), 1);
        let a = create(&f.store, "a");
        let b = create(&f.store, "b");
        f.scheduler.start_task(&a).await.unwrap();
        f.scheduler.start_task(&b).await.unwrap();

        assert_eq!(f.scheduler.pause_all().await.unwrap(), 1);
        let status = f.scheduler.status().await.unwrap();
        assert!(status.admission_paused);
        assert_eq!(status.running, 0);
        assert_eq!(status.queued, 1);
        assert_eq!(status.paused, 1);

        assert_eq!(f.scheduler.resume_all().await.unwrap(), 1);
        let status = f.scheduler.status().await.unwrap();
        assert!(!status.admission_paused);
        assert_eq!(status.running, 1);
        assert_eq!(status_of(&f.store, &b), TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_task() {
        let f = fixture(Arc::new(PanickingExecutor), 1);
        let id = create(&f.store, "boom");
        f.scheduler.start_task(&id).await.unwrap();

        eventually(|| status_of(&f.store, &id) == TaskStatus::Failed).await;
        let task = f.store.get_task(&id).unwrap();
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_runs() {
        let executor = GateExecutor::new(true);
        let f = fixture(executor.clone(), 1);
        let id = create(&f.store, "slow");
        f.scheduler.start_task(&id).await.unwrap();

        assert!(!f.scheduler.shutdown(Duration::from_millis(50)).await);
        executor.release(1);
        assert!(f.scheduler.shutdown(Duration::from_secs(2)).await);
        assert_eq!(status_of(&f.store, &id), TaskStatus::Completed);

        let other = create(&f.store, "late");
        assert!(matches!(
            f.scheduler.start_task(&other).await,
            Err(QueueError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_reload_detaches_runs() {
        let executor = GateExecutor::new(true);
        let f = fixture(executor.clone(), 1);
        let id = create(&f.store, "swapped");
        f.scheduler.start_task(&id).await.unwrap();

        let guard = f.scheduler.hold_admission().await;
        assert_eq!(guard.running(), 1);
        let report = f.scheduler.reload(guard).await.unwrap();
        assert_eq!(report.interrupted, 1);
        assert!(!f.scheduler.is_running(&id).await);

        executor.release(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status_of(&f.store, &id), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_resync_keeps_attached_runs() {
        let executor = GateExecutor::new(false);
        let f = fixture(executor.clone(), 1);
        let running = create(&f.store, "running");
        let waiting = create(&f.store, "waiting");
        f.scheduler.start_task(&running).await.unwrap();
        f.scheduler.start_task(&waiting).await.unwrap();

        let guard = f.scheduler.hold_admission().await;
        assert_eq!(guard.queued(), 1);
        let report = f.scheduler.resync(guard).await.unwrap();
        assert_eq!(report.interrupted, 0);
        assert_eq!(report.requeued, 1);
        assert!(f.scheduler.is_running(&running).await);

        executor.release(1);
        eventually(|| status_of(&f.store, &waiting) == TaskStatus::Running).await;
        assert_eq!(status_of(&f.store, &running), TaskStatus::Completed);
    }
}
