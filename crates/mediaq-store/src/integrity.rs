//! Integrity checks, best-effort repair and reset.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::{info, warn};

use mediaq_models::{IntegrityReport, RepairReport, TaskErrorKind, TaskStatus, TaskType};

use crate::error::{StoreError, StoreResult};
use crate::schema::{has_task_tables, initialize_schema};
use crate::store::TaskStore;

fn quoted(values: impl Iterator<Item = &'static str>) -> String {
    values
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_list() -> String {
    quoted(TaskStatus::ALL.iter().map(|s| s.as_str()))
}

fn type_list() -> String {
    quoted(TaskType::ALL.iter().map(|t| t.as_str()))
}

fn error_kind_list() -> String {
    quoted(
        [TaskErrorKind::Execution, TaskErrorKind::RecoveryInterrupted]
            .iter()
            .map(|k| k.as_str()),
    )
}

/// SQL fragment true when `column` does not hold a JSON array.
fn not_json_array(column: &str) -> String {
    format!(
        "(CASE WHEN json_valid({c}) THEN json_type({c}) END) IS NOT 'array'",
        c = column
    )
}

/// SQL fragment true when `outputs_json` is a non-empty JSON array.
fn has_outputs() -> String {
    "json_array_length(CASE WHEN json_valid(outputs_json) THEN outputs_json ELSE '[]' END) > 0"
        .to_string()
}

/// Row-level checks, each selecting `(id, detail)` of offending rows.
fn domain_checks() -> Vec<(&'static str, String)> {
    vec![
        (
            "has unknown status",
            format!("SELECT id, status FROM tasks WHERE status NOT IN ({})", status_list()),
        ),
        (
            "has unknown type",
            format!(
                "SELECT id, task_type FROM tasks WHERE task_type NOT IN ({})",
                type_list()
            ),
        ),
        (
            "has progress out of range",
            "SELECT id, CAST(progress AS TEXT) FROM tasks
             WHERE typeof(progress) != 'integer' OR progress < 0 OR progress > 100"
                .to_string(),
        ),
        (
            "has undecodable JSON in",
            format!(
                "SELECT id, CASE
                    WHEN {inputs} THEN 'inputs'
                    WHEN {outputs} THEN 'outputs'
                    ELSE 'config' END
                 FROM tasks WHERE {inputs} OR {outputs} OR NOT json_valid(config_json)",
                inputs = not_json_array("inputs_json"),
                outputs = not_json_array("outputs_json"),
            ),
        ),
        (
            "carries outputs while",
            format!(
                "SELECT id, status FROM tasks
                 WHERE status != 'completed' AND {}",
                has_outputs()
            ),
        ),
        (
            "has unknown error kind",
            format!(
                "SELECT id, error_kind FROM tasks
                 WHERE error_kind IS NOT NULL AND error_kind NOT IN ({})",
                error_kind_list()
            ),
        ),
    ]
}

/// Collect every problem found in the store.
///
/// Checks that cannot run are reported as errors themselves, so a badly
/// damaged file still produces a report instead of failing the call.
fn collect_errors(conn: &Connection) -> Vec<String> {
    let mut errors = Vec::new();

    match has_task_tables(conn) {
        Ok(true) => {}
        Ok(false) => {
            errors.push("Task tables are missing".to_string());
            return errors;
        }
        Err(e) => {
            errors.push(format!("Schema unreadable: {}", e));
            return errors;
        }
    }

    if let Err(e) = sqlite_integrity(conn, &mut errors) {
        errors.push(format!("integrity_check failed: {}", e));
    }
    if let Err(e) = foreign_key_violations(conn, &mut errors) {
        errors.push(format!("foreign_key_check failed: {}", e));
    }

    for (label, sql) in domain_checks() {
        let result = conn.prepare(&sql).and_then(|mut stmt| {
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        });

        match result {
            Ok(rows) => {
                for (id, detail) in rows {
                    errors.push(format!(
                        "Task {} {} '{}'",
                        id,
                        label,
                        detail.unwrap_or_default()
                    ));
                }
            }
            Err(e) => errors.push(format!("Check '{}' failed: {}", label, e)),
        }
    }

    errors
}

fn sqlite_integrity(conn: &Connection, errors: &mut Vec<String>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for row in rows {
        let line = row?;
        if line != "ok" {
            errors.push(format!("SQLite integrity: {}", line));
        }
    }
    Ok(())
}

fn foreign_key_violations(conn: &Connection, errors: &mut Vec<String>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for table in tables {
        *counts.entry(table).or_default() += 1;
    }
    for (table, count) in counts {
        errors.push(format!("{} orphaned row(s) in {}", count, table));
    }
    Ok(())
}

/// Apply every repair that SQL can express, recording what changed.
fn apply_repairs(conn: &mut Connection, actions: &mut Vec<String>) -> StoreResult<()> {
    if !has_task_tables(conn)? {
        initialize_schema(conn)?;
        actions.push("Recreated missing task tables".to_string());
    }

    let tx = conn.transaction()?;
    let mut record = |what: &str, changed: usize| {
        if changed > 0 {
            actions.push(format!("{}: {} row(s)", what, changed));
        }
    };

    record(
        "Deleted tasks of unknown type",
        tx.execute(
            &format!("DELETE FROM tasks WHERE task_type NOT IN ({})", type_list()),
            [],
        )?,
    );
    record(
        "Deleted tasks with undecodable inputs",
        tx.execute(
            &format!("DELETE FROM tasks WHERE {}", not_json_array("inputs_json")),
            [],
        )?,
    );
    record(
        "Deleted orphaned log entries",
        tx.execute(
            "DELETE FROM task_logs WHERE task_id NOT IN (SELECT id FROM tasks)",
            [],
        )?,
    );
    record(
        "Marked tasks with unknown status as failed",
        tx.execute(
            &format!(
                "UPDATE tasks SET
                    status = 'failed',
                    error_kind = 'execution',
                    error_message = 'Status was unreadable and reset by repair',
                    completed_at = COALESCE(completed_at, updated_at),
                    execution_time_ms = COALESCE(execution_time_ms, attempt_elapsed_ms),
                    last_resumed_at = NULL
                 WHERE status NOT IN ({})",
                status_list()
            ),
            [],
        )?,
    );
    record(
        "Clamped progress",
        tx.execute(
            "UPDATE tasks SET progress = MIN(MAX(CAST(progress AS INTEGER), 0), 100)
             WHERE typeof(progress) != 'integer' OR progress < 0 OR progress > 100",
            [],
        )?,
    );
    record(
        "Reset undecodable outputs",
        tx.execute(
            &format!(
                "UPDATE tasks SET outputs_json = '[]' WHERE {}",
                not_json_array("outputs_json")
            ),
            [],
        )?,
    );
    record(
        "Reset undecodable config",
        tx.execute(
            "UPDATE tasks SET config_json = '{}' WHERE NOT json_valid(config_json)",
            [],
        )?,
    );
    record(
        "Cleared outputs of unfinished tasks",
        tx.execute(
            &format!(
                "UPDATE tasks SET outputs_json = '[]' WHERE status != 'completed' AND {}",
                has_outputs()
            ),
            [],
        )?,
    );
    record(
        "Normalized unknown error kinds",
        tx.execute(
            &format!(
                "UPDATE tasks SET error_kind = 'execution'
                 WHERE error_kind IS NOT NULL AND error_kind NOT IN ({})",
                error_kind_list()
            ),
            [],
        )?,
    );
    tx.commit()?;

    conn.execute_batch("REINDEX;")?;
    actions.push("Rebuilt indexes".to_string());
    conn.execute_batch("VACUUM;")?;
    actions.push("Compacted database".to_string());

    Ok(())
}

impl TaskStore {
    /// Validate store structure and task rows.
    pub fn check_integrity(&self) -> StoreResult<IntegrityReport> {
        let conn = self.conn();
        let report = IntegrityReport::from_errors(collect_errors(&conn));
        if !report.healthy {
            warn!(errors = report.errors.len(), "Store integrity check found problems");
        }
        Ok(report)
    }

    /// Best-effort repair.
    ///
    /// Anything still wrong afterwards needs a reset (or a restore) to clear,
    /// which is reported through `need_reset`.
    pub fn repair(&self) -> StoreResult<RepairReport> {
        let mut conn = self.conn();
        let mut actions = Vec::new();
        let mut aborted = None;

        if let Err(e) = apply_repairs(&mut conn, &mut actions) {
            match e {
                StoreError::Sqlite(e) => {
                    warn!(error = %e, "Repair stopped early");
                    aborted = Some(format!("Repair stopped early: {}", e));
                }
                other => return Err(other),
            }
        }

        let mut remaining = collect_errors(&conn);
        remaining.extend(aborted);

        info!(
            actions = actions.len(),
            remaining = remaining.len(),
            "Store repair finished"
        );

        Ok(RepairReport {
            actions,
            healthy: remaining.is_empty(),
            need_reset: !remaining.is_empty(),
            remaining_errors: remaining,
        })
    }

    /// Wipe every task and log, leaving an empty store.
    ///
    /// When the file is too damaged to drop its tables, it is deleted and
    /// created afresh.
    pub fn reset(&self) -> StoreResult<()> {
        let mut conn = self.conn();

        let wiped = conn
            .execute_batch("DROP TABLE IF EXISTS task_logs; DROP TABLE IF EXISTS tasks;")
            .and_then(|_| initialize_schema(&conn))
            .and_then(|_| conn.execute_batch("VACUUM;"));

        if let Err(e) = wiped {
            let Some(path) = self.config().db_path.clone() else {
                return Err(e.into());
            };
            warn!(error = %e, path = %path.display(), "Recreating store file");

            // Release the file before removing it
            *conn = Connection::open_in_memory()?;
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let fresh = Connection::open(&path)?;
            initialize_schema(&fresh)?;
            *conn = fresh;
        }

        info!("Task store reset");
        Ok(())
    }
}
