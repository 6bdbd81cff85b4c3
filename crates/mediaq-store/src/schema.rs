//! Table definitions.

use rusqlite::Connection;

/// Schema version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Columns selected for every task read, in `RawTaskRow` order.
pub const TASK_COLUMNS: &str = "id, task_type, name, status, progress, current_step, \
     created_at, started_at, completed_at, execution_time_ms, total_execution_time_ms, \
     output_dir, inputs_json, outputs_json, config_json, error_kind, error_message, \
     retry_count, enqueued_at, last_resumed_at, attempt_elapsed_ms, updated_at";

/// Apply connection settings and create tables if missing.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY NOT NULL,
            task_type TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            progress INTEGER NOT NULL DEFAULT 0,
            current_step TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            execution_time_ms INTEGER,
            total_execution_time_ms INTEGER NOT NULL DEFAULT 0,
            output_dir TEXT NOT NULL,
            inputs_json TEXT NOT NULL DEFAULT '[]',
            outputs_json TEXT NOT NULL DEFAULT '[]',
            config_json TEXT NOT NULL DEFAULT '{}',
            error_kind TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER,
            last_resumed_at INTEGER,
            attempt_elapsed_ms INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);

        CREATE TABLE IF NOT EXISTS task_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);",
    )?;

    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Check that a connection holds a mediaq task store.
pub fn has_task_tables(conn: &Connection) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('tasks', 'task_logs')",
        [],
        |row| row.get(0),
    )?;
    Ok(count == 2)
}
