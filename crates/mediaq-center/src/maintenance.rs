//! Store maintenance: statistics, integrity, backups, reset and cleanup.
//!
//! Operations that swap or rewrite the store hold the scheduler's admission
//! guard so no task is admitted or resolved against half-replaced contents.

use std::sync::Arc;

use tracing::{info, warn};

use mediaq_models::{BackupRecord, IntegrityReport, RepairReport, StoreStats, TaskId};
use mediaq_queue::{AdmissionGuard, RecoveryReport, Scheduler};
use mediaq_store::TaskStore;

use crate::error::{CenterError, CenterResult};

/// Maintenance operations on the task store.
#[derive(Clone)]
pub struct MaintenanceManager {
    store: Arc<TaskStore>,
    scheduler: Scheduler,
}

impl MaintenanceManager {
    pub fn new(store: Arc<TaskStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    pub fn stats(&self) -> CenterResult<StoreStats> {
        Ok(self.store.stats()?)
    }

    pub fn check_integrity(&self) -> CenterResult<IntegrityReport> {
        Ok(self.store.check_integrity()?)
    }

    /// Fix what can be fixed in place, then re-read the queue.
    pub async fn repair(&self) -> CenterResult<RepairReport> {
        let guard = self.scheduler.hold_admission().await;
        let report = self.store.repair()?;
        if report.need_reset {
            warn!(
                remaining = report.remaining_errors.len(),
                "Repair left corruption behind; reset or restore required"
            );
            return Ok(report);
        }

        self.scheduler.resync(guard).await?;
        Ok(report)
    }

    /// Drop every task and log. Refused while tasks run unless `force`.
    pub async fn reset(&self, force: bool) -> CenterResult<RecoveryReport> {
        let guard = self.guard_swap("reset the store", force).await?;
        self.store.reset()?;
        info!(force, "Store reset");
        Ok(self.scheduler.reload(guard).await?)
    }

    pub async fn create_backup(&self, label: Option<&str>) -> CenterResult<BackupRecord> {
        let _guard = self.scheduler.hold_admission().await;
        Ok(self.store.create_backup(label)?)
    }

    pub fn list_backups(&self) -> CenterResult<Vec<BackupRecord>> {
        Ok(self.store.list_backups()?)
    }

    pub fn delete_backup(&self, name: &str) -> CenterResult<()> {
        Ok(self.store.delete_backup(name)?)
    }

    /// Replace the store with a backup. Refused while tasks run unless
    /// `force`; forced runs are detached and their tasks marked interrupted.
    ///
    /// Admission stays paused afterwards so the restored contents read back
    /// unchanged; `resume_all` starts the restored queue.
    pub async fn restore_backup(&self, name: &str, force: bool) -> CenterResult<RecoveryReport> {
        let mut guard = self.guard_swap("restore a backup", force).await?;
        self.store.restore_backup(name)?;
        info!(backup = %name, force, "Store restored, admission paused");
        guard.pause_admission();
        Ok(self.scheduler.reload(guard).await?)
    }

    /// Delete terminal tasks older than `days`. Returns how many were removed.
    pub fn cleanup_older_than(&self, days: u32) -> CenterResult<usize> {
        Ok(self.store.cleanup_older_than(days)?)
    }

    /// Clear one task's log, or every log when `task_id` is `None`.
    pub fn clear_logs(&self, task_id: Option<&TaskId>) -> CenterResult<usize> {
        Ok(self.store.clear_logs(task_id)?)
    }

    async fn guard_swap(&self, action: &str, force: bool) -> CenterResult<AdmissionGuard> {
        let guard = self.scheduler.hold_admission().await;
        let running = guard.running();
        if running > 0 && !force {
            return Err(CenterError::maintenance_blocked(format!(
                "Cannot {} while {} task(s) are running",
                action, running
            )));
        }
        if running > 0 {
            warn!(running, action, "Forcing maintenance over running tasks");
        }
        Ok(guard)
    }
}
