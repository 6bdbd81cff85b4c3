//! Point-in-time backups of the task store.
//!
//! Backups are standalone SQLite files written with the online backup API, so
//! they can be taken while the store is open. Restoring copies a validated
//! backup back into the live connection page by page.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use mediaq_models::BackupRecord;

use crate::error::{StoreError, StoreResult};
use crate::schema::{has_task_tables, initialize_schema};
use crate::store::TaskStore;

const BACKUP_EXTENSION: &str = "db";
const BACKUP_PREFIX: &str = "tasks";

/// Check a backup name supplied by a caller and strip a trailing extension.
fn normalize_name(name: &str) -> StoreResult<&str> {
    let name = name.trim();
    let name = name
        .strip_suffix(&format!(".{}", BACKUP_EXTENSION))
        .unwrap_or(name);

    if name.is_empty() {
        return Err(StoreError::validation("Backup name is required"));
    }
    if name.contains(['/', '\\']) || name.contains("..") || name.starts_with('.') {
        return Err(StoreError::validation(format!("Invalid backup name: {}", name)));
    }
    Ok(name)
}

/// Keep label characters that are safe in a file name.
fn sanitize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

fn backup_failed(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::backup_failed(format!("{}: {}", context, e))
}

fn record_for(path: &Path) -> StoreResult<Option<BackupRecord>> {
    if path.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXTENSION) {
        return Ok(None);
    }
    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };

    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Ok(None);
    }
    let created_at: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(Some(BackupRecord {
        name: name.to_string(),
        path: path.to_path_buf(),
        size: metadata.len(),
        created_at,
    }))
}

impl TaskStore {
    fn backup_path(&self, name: &str) -> PathBuf {
        self.backup_dir()
            .join(format!("{}.{}", name, BACKUP_EXTENSION))
    }

    /// Write a backup of the current store contents.
    pub fn create_backup(&self, label: Option<&str>) -> StoreResult<BackupRecord> {
        fs::create_dir_all(self.backup_dir())?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S-%3f");
        let base = match label.map(sanitize_label).filter(|l| !l.is_empty()) {
            Some(label) => format!("{}-{}-{}", BACKUP_PREFIX, timestamp, label),
            None => format!("{}-{}", BACKUP_PREFIX, timestamp),
        };

        let mut name = base.clone();
        let mut suffix = 1;
        while self.backup_path(&name).exists() {
            suffix += 1;
            name = format!("{}-{}", base, suffix);
        }
        let path = self.backup_path(&name);

        {
            let conn = self.conn();
            let mut dst = Connection::open(&path)
                .map_err(|e| backup_failed("Failed to create backup file", e))?;
            let backup = Backup::new(&conn, &mut dst)
                .map_err(|e| backup_failed("Failed to start backup", e))?;
            backup
                .step(-1)
                .map_err(|e| backup_failed("Failed to copy store", e))?;
        }

        let record = record_for(&path)?
            .ok_or_else(|| StoreError::backup_failed(format!("Backup {} was not written", name)))?;

        info!(
            backup = %record.name,
            size = %record.format_size(),
            "Created store backup"
        );

        self.prune_backups()?;
        Ok(record)
    }

    /// Backups in the backup directory, newest first.
    pub fn list_backups(&self) -> StoreResult<Vec<BackupRecord>> {
        let dir = self.backup_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(dir)? {
            if let Some(record) = record_for(&entry?.path())? {
                backups.push(record);
            }
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    /// Replace the store contents with a backup.
    ///
    /// The backup is validated before anything is touched; a damaged backup
    /// leaves the live store unchanged.
    pub fn restore_backup(&self, name: &str) -> StoreResult<()> {
        let name = normalize_name(name)?;
        let path = self.backup_path(name);
        if !path.is_file() {
            return Err(StoreError::not_found(format!("backup {}", name)));
        }

        let src = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| backup_failed("Failed to open backup", e))?;
        validate_backup(&src, name)?;

        let mut conn = self.conn();
        {
            let backup = Backup::new(&src, &mut conn)
                .map_err(|e| backup_failed("Failed to start restore", e))?;
            backup
                .step(-1)
                .map_err(|e| backup_failed("Failed to copy backup", e))?;
        }
        initialize_schema(&conn)?;

        info!(backup = %name, "Restored store from backup");
        Ok(())
    }

    /// Remove a backup file.
    pub fn delete_backup(&self, name: &str) -> StoreResult<()> {
        let name = normalize_name(name)?;
        let path = self.backup_path(name);
        if !path.is_file() {
            return Err(StoreError::not_found(format!("backup {}", name)));
        }
        fs::remove_file(&path)?;
        info!(backup = %name, "Deleted store backup");
        Ok(())
    }

    /// Drop the oldest backups beyond the configured limit.
    fn prune_backups(&self) -> StoreResult<()> {
        let max = self.config().max_backups;
        if max == 0 {
            return Ok(());
        }

        let backups = self.list_backups()?;
        for stale in backups.iter().skip(max) {
            if let Err(e) = fs::remove_file(&stale.path) {
                warn!(backup = %stale.name, error = %e, "Failed to prune old backup");
            }
        }
        Ok(())
    }
}

fn validate_backup(src: &Connection, name: &str) -> StoreResult<()> {
    let invalid = |detail: String| {
        StoreError::corruption(format!("Backup {} failed validation: {}", name, detail))
    };

    let result: String = src
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| invalid(e.to_string()))?;
    if result != "ok" {
        return Err(invalid(result));
    }
    if !has_task_tables(src).map_err(|e| invalid(e.to_string()))? {
        return Err(invalid("task tables are missing".to_string()));
    }
    Ok(())
}
