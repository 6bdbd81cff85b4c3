//! Local media task center.
//!
//! This crate ties the store and the scheduler together:
//! - [`TaskCenter`]: the single entry point for task commands and queries
//! - [`MaintenanceManager`]: statistics, integrity, backups, reset, cleanup
//! - [`CenterConfig`]: environment driven configuration
//! - [`logging::init_tracing`]: tracing subscriber setup
//!
//! Media work itself is delegated to a [`TaskExecutor`] supplied by the
//! embedding application.

pub mod center;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;

pub use center::{BatchFailure, BatchOutcome, TaskCenter};
pub use config::CenterConfig;
pub use error::{CenterError, CenterResult};
pub use maintenance::MaintenanceManager;

pub use mediaq_models::{
    BackupRecord, IntegrityReport, LogEntry, LogLevel, NewTask, Pagination, QueueStatus,
    RepairReport, StoreStats, Task, TaskError, TaskErrorKind, TaskEvent, TaskEventEnvelope,
    TaskFilter, TaskId, TaskInput, TaskPage, TaskStatus, TaskType, TaskUpdate,
};
pub use mediaq_queue::{
    ControlSignal, ExecutionContext, ExecutionOutcome, ExecutionRequest, RecoveryReport,
    Subscription, TaskExecutor,
};
