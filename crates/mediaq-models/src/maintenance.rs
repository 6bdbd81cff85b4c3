//! Store statistics, integrity reports and backup records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Size and content summary of the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StoreStats {
    /// Logical database size in bytes (page count x page size)
    pub file_size: u64,
    pub task_count: u64,
    pub log_count: u64,
    /// Total number of produced output files across all tasks
    pub output_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_task: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_task: Option<DateTime<Utc>>,
}

/// Result of a structural validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            healthy: errors.is_empty(),
            errors,
        }
    }
}

/// Result of a best-effort repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RepairReport {
    /// Fixes that were applied
    pub actions: Vec<String>,
    /// Integrity state after the repair
    pub healthy: bool,
    /// Corruption remains that only a reset (or restore) can clear
    pub need_reset: bool,
    /// Problems still present after the repair
    pub remaining_errors: Vec<String>,
}

/// A point-in-time snapshot of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackupRecord {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    /// Human readable size.
    pub fn format_size(&self) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
        let mut size = self.size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
