//! Shared data models for the mediaq task center.
//!
//! This crate provides Serde-serializable types for:
//! - Tasks, inputs and recorded errors
//! - The task status state machine
//! - Task log entries
//! - Lifecycle events
//! - Listing filters, queue snapshots and maintenance reports

pub mod event;
pub mod log;
pub mod maintenance;
pub mod query;
pub mod status;
pub mod task;

// Re-export common types
pub use event::{TaskEvent, TaskEventEnvelope, TaskEventType};
pub use log::{LogEntry, LogLevel};
pub use maintenance::{BackupRecord, IntegrityReport, RepairReport, StoreStats};
pub use query::{Pagination, QueueStatus, TaskFilter, TaskPage, MAX_PAGE_SIZE};
pub use status::{TaskStatus, TransitionError};
pub use task::{NewTask, Task, TaskError, TaskErrorKind, TaskId, TaskInput, TaskType, TaskUpdate};
