//! Scheduler metrics.

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const TASKS_ADMITTED_TOTAL: &str = "mediaq_tasks_admitted_total";
    pub const TASKS_FINISHED_TOTAL: &str = "mediaq_tasks_finished_total";
    pub const TASKS_PAUSED_TOTAL: &str = "mediaq_tasks_paused_total";
    pub const TASKS_INTERRUPTED_TOTAL: &str = "mediaq_tasks_interrupted_total";
    pub const TASKS_FORCED_TOTAL: &str = "mediaq_tasks_forced_total";
    pub const TASKS_RUNNING: &str = "mediaq_tasks_running";
    pub const TASKS_QUEUED: &str = "mediaq_tasks_queued";
    pub const TASK_EXECUTION_SECONDS: &str = "mediaq_task_execution_seconds";
}

pub fn record_admitted(task_type: &str) {
    counter!(names::TASKS_ADMITTED_TOTAL, "task_type" => task_type.to_string()).increment(1);
}

/// Record a task reaching a terminal status.
pub fn record_finished(task_type: &str, status: &str, execution_ms: Option<u64>) {
    let labels = [
        ("task_type", task_type.to_string()),
        ("status", status.to_string()),
    ];
    counter!(names::TASKS_FINISHED_TOTAL, &labels).increment(1);
    if let Some(ms) = execution_ms {
        histogram!(names::TASK_EXECUTION_SECONDS, &labels).record(ms as f64 / 1000.0);
    }
}

pub fn record_paused() {
    counter!(names::TASKS_PAUSED_TOTAL).increment(1);
}

pub fn record_interrupted(count: usize) {
    counter!(names::TASKS_INTERRUPTED_TOTAL).increment(count as u64);
}

/// Record a pause or cancel that was not acknowledged in time.
pub fn record_forced(action: &str) {
    counter!(names::TASKS_FORCED_TOTAL, "action" => action.to_string()).increment(1);
}

pub fn set_occupancy(running: usize, queued: usize) {
    gauge!(names::TASKS_RUNNING).set(running as f64);
    gauge!(names::TASKS_QUEUED).set(queued as f64);
}
