//! Task center configuration.

use std::path::PathBuf;
use std::time::Duration;

use mediaq_queue::{SchedulerConfig, DEFAULT_BUS_CAPACITY};
use mediaq_store::StoreConfig;

/// Task center configuration.
#[derive(Debug, Clone)]
pub struct CenterConfig {
    /// SQLite file; `None` keeps the store in memory
    pub db_path: Option<PathBuf>,
    /// Directory backups are written to
    pub backup_dir: PathBuf,
    /// Backups kept before the oldest are pruned (0 keeps all)
    pub max_backups: usize,
    /// Maximum tasks running at once
    pub max_concurrent_tasks: usize,
    /// Thread budget handed to each execution
    pub threads_per_task: usize,
    /// Queue newly created tasks right away
    pub auto_start: bool,
    /// How long a pause waits for the execution to stop
    pub pause_timeout: Duration,
    /// How long a cancel waits for the execution to stop
    pub cancel_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("data/mediaq.db")),
            backup_dir: PathBuf::from("data/backups"),
            max_backups: 10,
            max_concurrent_tasks: 2,
            threads_per_task: 2,
            auto_start: true,
            pause_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            event_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

impl CenterConfig {
    /// Create config from environment variables (and `.env` if present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let db_path = match std::env::var("MEDIAQ_DB_PATH") {
            Ok(path) if path == ":memory:" => None,
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from("data/mediaq.db")),
        };

        Self {
            db_path,
            backup_dir: std::env::var("MEDIAQ_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/backups")),
            max_backups: std::env::var("MEDIAQ_MAX_BACKUPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            max_concurrent_tasks: std::env::var("MEDIAQ_MAX_CONCURRENT_TASKS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            threads_per_task: std::env::var("MEDIAQ_THREADS_PER_TASK")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            auto_start: std::env::var("MEDIAQ_AUTO_START")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            pause_timeout: Duration::from_secs(
                std::env::var("MEDIAQ_PAUSE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            cancel_timeout: Duration::from_secs(
                std::env::var("MEDIAQ_CANCEL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("MEDIAQ_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            event_capacity: std::env::var("MEDIAQ_EVENT_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BUS_CAPACITY),
        }
    }

    /// In-memory store with backups under `backup_dir`. Handy for tests and
    /// throwaway sessions.
    pub fn in_memory(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: None,
            backup_dir: backup_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, max_concurrent_tasks: usize, threads_per_task: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self.threads_per_task = threads_per_task;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_timeouts(mut self, pause_timeout: Duration, cancel_timeout: Duration) -> Self {
        self.pause_timeout = pause_timeout;
        self.cancel_timeout = cancel_timeout;
        self
    }

    pub fn store_config(&self) -> StoreConfig {
        let config = match &self.db_path {
            Some(path) => StoreConfig::new(path, &self.backup_dir),
            None => StoreConfig::in_memory(&self.backup_dir),
        };
        config.with_max_backups(self.max_backups)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_concurrency(self.max_concurrent_tasks, self.threads_per_task)
            .with_timeouts(self.pause_timeout, self.cancel_timeout)
    }
}
