//! Listing filters and queue snapshots.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Task, TaskStatus, TaskType};

/// Largest page a listing query returns.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Filter for task listing. Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskFilter {
    #[serde(default)]
    pub statuses: Vec<TaskStatus>,
    #[serde(default)]
    pub task_types: Vec<TaskType>,
    /// Substring matched against the task name or ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_types.push(task_type);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Search text with surrounding whitespace removed, if any remains.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Page request, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.page_size as u64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// One page of tasks plus the total number of matches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Snapshot of scheduler occupancy. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QueueStatus {
    pub running: usize,
    pub queued: usize,
    pub paused: usize,
    pub max_concurrent_tasks: usize,
    pub threads_per_task: usize,
    /// True between `pause_all` and `resume_all`
    pub admission_paused: bool,
}
