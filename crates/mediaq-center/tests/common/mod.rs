#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use mediaq_center::{
    CenterConfig, ControlSignal, ExecutionContext, ExecutionOutcome, ExecutionRequest, NewTask,
    Pagination, TaskCenter, TaskExecutor, TaskFilter, TaskInput, TaskStatus, TaskType,
};

/// Completes one execution per released permit. Honours pause and cancel
/// unless built with [`MockExecutor::stubborn`].
pub struct MockExecutor {
    gate: Semaphore,
    stubborn: bool,
    failures_left: AtomicUsize,
    started: AtomicUsize,
    resumed: AtomicUsize,
}

impl MockExecutor {
    fn build(stubborn: bool, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            stubborn,
            failures_left: AtomicUsize::new(failures),
            started: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(false, 0)
    }

    pub fn stubborn() -> Arc<Self> {
        Self::build(true, 0)
    }

    /// The first `n` executions fail straight away.
    pub fn failing(n: usize) -> Arc<Self> {
        Self::build(false, n)
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest, mut ctx: ExecutionContext) -> ExecutionOutcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        if request.resumed {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return ExecutionOutcome::failed("ffmpeg exited with status 1");
        }

        ctx.report_progress(25, Some("decoding"));
        let output = format!("{}/{}.mp4", request.task.output_dir, request.task.name);

        if self.stubborn {
            self.pass_gate().await;
            return ExecutionOutcome::completed(vec![output]);
        }

        tokio::select! {
            _ = self.pass_gate() => {
                ctx.report_progress(100, Some("done"));
                ExecutionOutcome::completed(vec![output])
            }
            signal = ctx.wait_for_signal() => match signal {
                ControlSignal::Pause => ExecutionOutcome::Paused,
                _ => ExecutionOutcome::Cancelled,
            },
        }
    }
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("mediaq.db")
}

/// File-backed config with short control timeouts.
pub fn config(dir: &TempDir, max_concurrent_tasks: usize) -> CenterConfig {
    let mut config = CenterConfig {
        db_path: Some(db_path(dir)),
        backup_dir: dir.path().join("backups"),
        ..CenterConfig::default()
    }
    .with_concurrency(max_concurrent_tasks, 2)
    .with_timeouts(Duration::from_millis(300), Duration::from_millis(300));
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

/// Overwrite columns of a task row behind the store's back.
pub fn tamper(dir: &TempDir, task: &mediaq_center::TaskId, assignments: &str) {
    let conn = rusqlite::Connection::open(db_path(dir)).unwrap();
    let changed = conn
        .execute(
            &format!("UPDATE tasks SET {} WHERE id = ?1", assignments),
            [task.as_str()],
        )
        .unwrap();
    assert_eq!(changed, 1);
}

/// Status column as stored, for rows that no longer decode.
pub fn raw_status(dir: &TempDir, task: &mediaq_center::TaskId) -> String {
    let conn = rusqlite::Connection::open(db_path(dir)).unwrap();
    conn.query_row(
        "SELECT status FROM tasks WHERE id = ?1",
        [task.as_str()],
        |row| row.get(0),
    )
    .unwrap()
}

pub async fn open(config: CenterConfig, executor: &Arc<MockExecutor>) -> TaskCenter {
    let executor: Arc<dyn TaskExecutor> = executor.clone();
    TaskCenter::open(config, executor).await.unwrap()
}

pub fn video_task(name: &str) -> NewTask {
    NewTask::new(TaskType::VideoCompress, name, "/tmp/mediaq-out")
        .with_input(TaskInput::main(format!("/videos/{}.mov", name)))
}

pub fn count(center: &TaskCenter, status: TaskStatus) -> u64 {
    center
        .list_tasks(&TaskFilter::default().with_status(status), Pagination::default())
        .unwrap()
        .total
}

pub fn status_of(center: &TaskCenter, task: &mediaq_center::TaskId) -> TaskStatus {
    center.get_task(task).unwrap().status
}

pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
