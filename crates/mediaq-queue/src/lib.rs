//! Task scheduling for the mediaq task center.
//!
//! This crate provides:
//! - A concurrency-capped FIFO scheduler with cooperative pause/cancel
//! - Crash recovery of interrupted and queued tasks
//! - The execution collaborator interface
//! - Lifecycle event fan-out to subscribers
//! - Task log writing and scheduler metrics

pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{QueueError, QueueResult};
pub use execution::{ControlSignal, ExecutionContext, ExecutionOutcome, ExecutionRequest, TaskExecutor};
pub use logging::TaskLogger;
pub use progress::{ProgressBus, Subscription, DEFAULT_BUS_CAPACITY};
pub use scheduler::{AdmissionGuard, RecoveryReport, Scheduler};
