mod common;

use std::time::Duration;

use common::{
    config, db_path, eventually, open, raw_status, status_of, tamper, video_task, MockExecutor,
};
use mediaq_center::{LogLevel, Task, TaskErrorKind, TaskStatus};
use mediaq_store::{StoreConfig, TaskStore};

fn seed_store(dir: &tempfile::TempDir) -> TaskStore {
    TaskStore::open(StoreConfig::new(db_path(dir), dir.path().join("backups"))).unwrap()
}

#[tokio::test]
async fn test_reopen_after_crash_recovers_tasks() {
    let dir = tempfile::tempdir().unwrap();

    let (crashed, first_queued, second_queued, paused) = {
        let store = seed_store(&dir);

        let mut crashed = Task::new(video_task("crashed"));
        crashed.submit().unwrap();
        crashed.start_running().unwrap();
        crashed.record_progress(60, Some("encoding".into()));

        let mut paused = Task::new(video_task("paused"));
        paused.submit().unwrap();
        paused.start_running().unwrap();
        paused.pause().unwrap();

        let mut first = Task::new(video_task("first"));
        first.submit().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let mut second = Task::new(video_task("second"));
        second.submit().unwrap();

        // Inserted out of queue order on purpose
        for task in [&crashed, &second, &paused, &first] {
            store.create_task(task).unwrap();
        }
        (crashed.id, first.id, second.id, paused.id)
    };

    let executor = MockExecutor::new();
    let center = open(config(&dir, 1), &executor).await;

    let task = center.get_task(&crashed).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.progress, 60);
    let error = task.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::RecoveryInterrupted);

    let logs = center.task_logs(&crashed, None).unwrap();
    assert!(logs.iter().any(|l| l.level == LogLevel::Warn));

    assert_eq!(status_of(&center, &first_queued), TaskStatus::Running);
    assert_eq!(status_of(&center, &second_queued), TaskStatus::Queued);
    assert_eq!(status_of(&center, &paused), TaskStatus::Paused);

    let status = center.queue_status().await.unwrap();
    assert_eq!((status.running, status.queued, status.paused), (1, 1, 1));

    executor.release(1);
    eventually(|| status_of(&center, &second_queued) == TaskStatus::Running).await;

    let retried = center.retry_task(&crashed).await.unwrap();
    assert_eq!(retried.progress, 0);
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test]
async fn test_unclean_drop_is_recovered_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let executor = MockExecutor::stubborn();

    let id = {
        let center = open(config(&dir, 1), &executor).await;
        let id = center.create_task(video_task("abandoned")).await.unwrap().id;
        assert_eq!(status_of(&center, &id), TaskStatus::Running);
        id
    };

    let reopened = open(config(&dir, 1), &MockExecutor::new()).await;
    let task = reopened.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, TaskErrorKind::RecoveryInterrupted);
}

#[tokio::test]
async fn test_opens_with_corrupted_rows() {
    let dir = tempfile::tempdir().unwrap();

    let (id, waiting) = {
        let store = seed_store(&dir);
        let mut task = Task::new(video_task("mangled"));
        task.submit().unwrap();
        task.start_running().unwrap();
        store.create_task(&task).unwrap();

        let mut waiting = Task::new(video_task("waiting"));
        waiting.submit().unwrap();
        store.create_task(&waiting).unwrap();
        (task.id, waiting.id)
    };
    {
        let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
        conn.execute(
            "UPDATE tasks SET config_json = '{not json' WHERE id = ?1",
            [id.as_str()],
        )
        .unwrap();
    }

    let executor = MockExecutor::new();
    let center = open(config(&dir, 1), &executor).await;
    assert!(center.get_task(&id).unwrap_err().is_store_corruption());
    assert!(!center.check_integrity().unwrap().healthy);

    // The unreadable row is still taken out of running and does not block the queue
    assert_eq!(raw_status(&dir, &id), "failed");
    assert_eq!(status_of(&center, &waiting), TaskStatus::Running);

    let report = center.maintenance().repair().await.unwrap();
    assert!(report.healthy, "{:?}", report.remaining_errors);

    let task = center.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, TaskErrorKind::RecoveryInterrupted);
}

#[tokio::test]
async fn test_cancel_all_cancels_undecodable_rows() {
    let dir = tempfile::tempdir().unwrap();
    let executor = MockExecutor::new();
    let center = open(config(&dir, 1), &executor).await;
    let running = center.create_task(video_task("running")).await.unwrap().id;
    let broken = center.create_task(video_task("broken")).await.unwrap().id;
    assert_eq!(status_of(&center, &broken), TaskStatus::Queued);

    tamper(&dir, &broken, "config_json = '{oops'");

    assert_eq!(center.cancel_all().await.unwrap(), 2);
    assert_eq!(status_of(&center, &running), TaskStatus::Cancelled);
    assert_eq!(raw_status(&dir, &broken), "cancelled");

    let status = center.queue_status().await.unwrap();
    assert_eq!((status.running, status.queued), (0, 0));
}

#[tokio::test]
async fn test_resume_all_reports_undecodable_rows() {
    let dir = tempfile::tempdir().unwrap();
    let executor = MockExecutor::new();
    let center = open(config(&dir, 2), &executor).await;
    let broken = center.create_task(video_task("broken")).await.unwrap().id;
    let fine = center.create_task(video_task("fine")).await.unwrap().id;
    assert_eq!(center.pause_all().await.unwrap(), 2);

    tamper(&dir, &broken, "outputs_json = 'nope'");

    let err = center.resume_all().await.unwrap_err();
    assert!(
        err.to_string().contains("resume_all skipped 1 task(s)"),
        "{}",
        err
    );
    assert_eq!(status_of(&center, &fine), TaskStatus::Running);
    assert_eq!(raw_status(&dir, &broken), "paused");
    assert!(!center.queue_status().await.unwrap().admission_paused);
}

#[tokio::test]
async fn test_outcome_for_unreadable_row_frees_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let executor = MockExecutor::new();
    let center = open(config(&dir, 1), &executor).await;
    let first = center.create_task(video_task("first")).await.unwrap().id;
    let second = center.create_task(video_task("second")).await.unwrap().id;

    tamper(&dir, &first, "config_json = '{oops'");
    executor.release(1);

    eventually(|| raw_status(&dir, &first) == "failed").await;
    eventually(|| status_of(&center, &second) == TaskStatus::Running).await;
    assert_eq!(center.queue_status().await.unwrap().running, 1);
}
