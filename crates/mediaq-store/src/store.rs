//! Durable task and log storage.
//!
//! All access goes through a single SQLite connection guarded by a mutex, so
//! writes are serialized and multi-statement reads observe one snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::{debug, info, warn};

use mediaq_models::{
    LogEntry, LogLevel, Pagination, StoreStats, Task, TaskError, TaskErrorKind, TaskFilter,
    TaskId, TaskInput, TaskPage, TaskStatus, TaskType,
};

use crate::error::{StoreError, StoreResult};
use crate::schema::{initialize_schema, TASK_COLUMNS};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file. `None` keeps the store in memory.
    pub db_path: Option<PathBuf>,
    /// Directory backups are written to
    pub backup_dir: PathBuf,
    /// Backups kept after creating a new one (0 keeps all)
    pub max_backups: usize,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(db_path.into()),
            backup_dir: backup_dir.into(),
            max_backups: 10,
        }
    }

    pub fn in_memory(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: None,
            backup_dir: backup_dir.into(),
            max_backups: 10,
        }
    }

    pub fn with_max_backups(mut self, max: usize) -> Self {
        self.max_backups = max;
        self
    }
}

/// SQLite-backed task store.
pub struct TaskStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl TaskStore {
    /// Open (or create) the store described by `config`.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let conn = match &config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        initialize_schema(&conn)?;

        info!(
            db_path = ?config.db_path,
            backup_dir = %config.backup_dir.display(),
            "Opened task store"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    /// Exclusive access to the connection.
    ///
    /// A panic while holding the lock cannot leave a half-applied write
    /// behind (SQLite rolls back the open transaction), so poisoning is
    /// ignored.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Insert a new task record.
    pub fn create_task(&self, task: &Task) -> StoreResult<TaskId> {
        validate_record(task)?;
        let conn = self.conn();
        insert_task(&conn, task)?;
        debug!(task_id = %task.id, task_type = %task.task_type, "Created task");
        Ok(task.id.clone())
    }

    /// Insert several task records atomically.
    pub fn create_tasks(&self, tasks: &[Task]) -> StoreResult<Vec<TaskId>> {
        for task in tasks {
            validate_record(task)?;
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for task in tasks {
            insert_task(&tx, task)?;
        }
        tx.commit()?;

        Ok(tasks.iter().map(|t| t.id.clone()).collect())
    }

    /// Fetch a task by ID.
    pub fn get_task(&self, id: &TaskId) -> StoreResult<Task> {
        let conn = self.conn();
        load_task(&conn, id)
    }

    /// Write back a task whose status change was validated by the state machine.
    ///
    /// The stored status must still be `expected`; otherwise another writer
    /// got there first and the write is refused.
    pub fn update_task(&self, task: &Task, expected: TaskStatus) -> StoreResult<()> {
        validate_write(task)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let actual = status_of(&tx, &task.id)?;
        if actual != expected {
            return Err(StoreError::ConcurrentModification {
                id: task.id.to_string(),
                expected,
                actual,
            });
        }
        if expected != task.status {
            expected.transition(task.status)?;
        }

        let inputs_json = serde_json::to_string(&task.inputs)?;
        let outputs_json = serde_json::to_string(&task.outputs)?;
        let config_json = serde_json::to_string(&task.config)?;

        tx.execute(
            "UPDATE tasks SET
                name = ?2, status = ?3, progress = ?4, current_step = ?5,
                started_at = ?6, completed_at = ?7, execution_time_ms = ?8,
                total_execution_time_ms = ?9, output_dir = ?10, inputs_json = ?11,
                outputs_json = ?12, config_json = ?13, error_kind = ?14, error_message = ?15,
                retry_count = ?16, enqueued_at = ?17, last_resumed_at = ?18,
                attempt_elapsed_ms = ?19, updated_at = ?20
             WHERE id = ?1",
            params![
                task.id.as_str(),
                task.name,
                task.status.as_str(),
                task.progress as i64,
                task.current_step,
                task.started_at.map(to_millis),
                task.completed_at.map(to_millis),
                task.execution_time_ms.map(|v| v as i64),
                task.total_execution_time_ms as i64,
                task.output_dir,
                inputs_json,
                outputs_json,
                config_json,
                task.error.as_ref().map(|e| e.kind.as_str()),
                task.error.as_ref().map(|e| e.message.as_str()),
                task.retry_count as i64,
                task.enqueued_at.map(to_millis),
                task.last_resumed_at.map(to_millis),
                task.attempt_elapsed_ms as i64,
                to_millis(task.updated_at),
            ],
        )?;
        tx.commit()?;

        debug!(task_id = %task.id, from = %expected, to = %task.status, "Updated task");
        Ok(())
    }

    /// Record progress for a running task.
    ///
    /// Progress never moves backwards. Returns `false` when the task is not
    /// running (or no longer exists) and nothing was written.
    pub fn update_progress(&self, id: &TaskId, progress: u8, step: Option<&str>) -> StoreResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET
                progress = MAX(progress, ?2),
                current_step = COALESCE(?3, current_step),
                updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id.as_str(), progress.min(100) as i64, step, to_millis(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// List tasks matching `filter`, newest first.
    pub fn list_tasks(&self, filter: &TaskFilter, pagination: Pagination) -> StoreResult<TaskPage> {
        let pagination = Pagination::new(pagination.page, pagination.page_size);

        let mut where_sql = String::from(" WHERE 1=1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders: Vec<_> = filter.statuses.iter().map(|_| "?").collect();
            where_sql.push_str(&format!(" AND status IN ({})", placeholders.join(",")));
            for status in &filter.statuses {
                args.push(Box::new(status.as_str()));
            }
        }

        if !filter.task_types.is_empty() {
            let placeholders: Vec<_> = filter.task_types.iter().map(|_| "?").collect();
            where_sql.push_str(&format!(" AND task_type IN ({})", placeholders.join(",")));
            for task_type in &filter.task_types {
                args.push(Box::new(task_type.as_str()));
            }
        }

        if let Some(search) = filter.search_term() {
            let pattern = format!("%{}%", escape_like(search));
            where_sql.push_str(" AND (name LIKE ? ESCAPE '\\' OR id LIKE ? ESCAPE '\\')");
            args.push(Box::new(pattern.clone()));
            args.push(Box::new(pattern));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let arg_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let total: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM tasks{}", where_sql),
            arg_refs.as_slice(),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM tasks{} ORDER BY created_at DESC, rowid DESC LIMIT {} OFFSET {}",
            TASK_COLUMNS,
            where_sql,
            pagination.page_size,
            pagination.offset()
        );
        let tasks = query_tasks(&tx, &sql, arg_refs.as_slice())?;
        tx.commit()?;

        Ok(TaskPage {
            tasks,
            total: total.max(0) as u64,
            page: pagination.page,
            page_size: pagination.page_size,
        })
    }

    /// All tasks in `status`, in queue order (oldest enqueue first).
    pub fn tasks_with_status(&self, status: TaskStatus) -> StoreResult<Vec<Task>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = ?1
             ORDER BY COALESCE(enqueued_at, created_at) ASC, rowid ASC",
            TASK_COLUMNS
        );
        query_tasks(&conn, &sql, &[&status.as_str() as &dyn ToSql])
    }

    /// IDs of the tasks in `status`, in queue order.
    ///
    /// Only the ID column is read, so rows that no longer decode are still
    /// listed.
    pub fn task_ids_with_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks WHERE status = ?1
             ORDER BY COALESCE(enqueued_at, created_at) ASC, rowid ASC",
        )?;
        let ids = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(TaskId).collect())
    }

    /// Move a task to `failed` or `cancelled` without decoding its row.
    ///
    /// The open running segment is folded into the attempt's execution time.
    /// Returns `false` when the stored status was no longer `expected`.
    pub fn force_terminal(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> StoreResult<bool> {
        if !matches!(status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(StoreError::validation(format!("Cannot force a task to {}", status)));
        }
        expected.transition(status)?;

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET
                status = ?3,
                error_kind = ?4,
                error_message = ?5,
                current_step = NULL,
                outputs_json = '[]',
                attempt_elapsed_ms = attempt_elapsed_ms + COALESCE(MAX(?6 - last_resumed_at, 0), 0),
                execution_time_ms = attempt_elapsed_ms + COALESCE(MAX(?6 - last_resumed_at, 0), 0),
                total_execution_time_ms = total_execution_time_ms
                    + attempt_elapsed_ms + COALESCE(MAX(?6 - last_resumed_at, 0), 0),
                last_resumed_at = NULL,
                completed_at = ?6,
                updated_at = ?6
             WHERE id = ?1 AND status = ?2",
            params![
                id.as_str(),
                expected.as_str(),
                status.as_str(),
                error.map(|e| e.kind.as_str()),
                error.map(|e| e.message.as_str()),
                to_millis(Utc::now()),
            ],
        )?;

        if changed > 0 {
            warn!(task_id = %id, from = %expected, to = %status, "Forced task status");
        }
        Ok(changed > 0)
    }

    /// Number of tasks in `status`.
    pub fn count_with_status(&self, status: TaskStatus) -> StoreResult<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Delete a task and its logs. Running tasks cannot be deleted.
    pub fn delete_task(&self, id: &TaskId) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let status = status_of(&tx, id)?;
        if status == TaskStatus::Running {
            return Err(StoreError::validation(format!(
                "Task {} is running; cancel it before deleting",
                id
            )));
        }

        tx.execute("DELETE FROM task_logs WHERE task_id = ?1", params![id.as_str()])?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;

        debug!(task_id = %id, "Deleted task");
        Ok(())
    }

    /// Delete finished tasks older than `days`.
    ///
    /// Only completed, failed and cancelled tasks are eligible; age is
    /// measured from completion, or creation for tasks that never finished
    /// an attempt.
    pub fn cleanup_older_than(&self, days: u32) -> StoreResult<usize> {
        let cutoff = to_millis(Utc::now() - ChronoDuration::days(days as i64));
        let terminal = "('completed', 'failed', 'cancelled')";

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM task_logs WHERE task_id IN (
                    SELECT id FROM tasks
                    WHERE status IN {} AND COALESCE(completed_at, created_at) < ?1)",
                terminal
            ),
            params![cutoff],
        )?;
        let removed = tx.execute(
            &format!(
                "DELETE FROM tasks WHERE status IN {} AND COALESCE(completed_at, created_at) < ?1",
                terminal
            ),
            params![cutoff],
        )?;
        tx.commit()?;

        info!(days, removed, "Cleaned up old tasks");
        Ok(removed)
    }

    // =========================================================================
    // Logs
    // =========================================================================

    /// Append a log line to a task.
    pub fn append_log(&self, task_id: &TaskId, level: LogLevel, message: &str) -> StoreResult<LogEntry> {
        let conn = self.conn();
        status_of(&conn, task_id)?;

        let timestamp = Utc::now();
        conn.execute(
            "INSERT INTO task_logs (task_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![task_id.as_str(), to_millis(timestamp), level.as_str(), message],
        )?;

        Ok(LogEntry {
            id: conn.last_insert_rowid(),
            task_id: task_id.clone(),
            timestamp,
            level,
            message: message.to_string(),
        })
    }

    /// Log lines of a task in insertion order, optionally only the latest `limit`.
    pub fn task_logs(&self, task_id: &TaskId, limit: Option<u32>) -> StoreResult<Vec<LogEntry>> {
        let conn = self.conn();
        status_of(&conn, task_id)?;

        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT id, task_id, timestamp, level, message FROM (
                SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id.as_str(), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, task_id, timestamp, level, message) = row.map_err(decode_error)?;
            entries.push(LogEntry {
                id,
                timestamp: from_millis(&task_id, "timestamp", timestamp)?,
                level: LogLevel::parse(&level).ok_or_else(|| {
                    StoreError::corruption(format!("log {} has unknown level '{}'", id, level))
                })?,
                task_id: TaskId(task_id),
                message,
            });
        }
        Ok(entries)
    }

    /// Remove log lines of one task, or of every task. Returns rows removed.
    pub fn clear_logs(&self, task_id: Option<&TaskId>) -> StoreResult<usize> {
        let conn = self.conn();
        let removed = match task_id {
            Some(id) => conn.execute("DELETE FROM task_logs WHERE task_id = ?1", params![id.as_str()])?,
            None => conn.execute("DELETE FROM task_logs", [])?,
        };
        info!(task_id = ?task_id.map(|t| t.as_str()), removed, "Cleared task logs");
        Ok(removed)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Summary of store contents.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn();

        let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

        let (task_count, oldest, newest, output_count): (i64, Option<i64>, Option<i64>, i64) = conn
            .query_row(
                "SELECT COUNT(*), MIN(created_at), MAX(created_at),
                        COALESCE(SUM(CASE WHEN json_valid(outputs_json)
                                          THEN json_array_length(outputs_json) ELSE 0 END), 0)
                 FROM tasks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let log_count: i64 = conn.query_row("SELECT COUNT(*) FROM task_logs", [], |row| row.get(0))?;

        Ok(StoreStats {
            file_size: (page_count.max(0) * page_size.max(0)) as u64,
            task_count: task_count.max(0) as u64,
            log_count: log_count.max(0) as u64,
            output_count: output_count.max(0) as u64,
            oldest_task: oldest.and_then(DateTime::from_timestamp_millis),
            newest_task: newest.and_then(DateTime::from_timestamp_millis),
        })
    }
}

// =============================================================================
// Row helpers
// =============================================================================

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(id: &str, field: &str, value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::corruption(format!("{} has invalid {} ({})", id, field, value)))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Map column decoding failures to corruption of the affected rows.
fn decode_error(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::InvalidColumnType(idx, name, ty) => StoreError::corruption(format!(
            "column {} ({}) has unexpected type {}",
            name, idx, ty
        )),
        rusqlite::Error::FromSqlConversionFailure(idx, ty, err) => StoreError::corruption(format!(
            "column {} ({}) could not be decoded: {}",
            idx, ty, err
        )),
        other => StoreError::Sqlite(other),
    }
}

/// Create-time checks on a full record.
fn validate_record(task: &Task) -> StoreResult<()> {
    validate_write(task)?;
    if task.name.trim().is_empty() {
        return Err(StoreError::validation("Task name is required"));
    }
    if task.output_dir.trim().is_empty() {
        return Err(StoreError::validation("Output directory is required"));
    }
    if task.inputs.len() < task.task_type.min_inputs() {
        return Err(StoreError::validation(format!(
            "{} requires at least {} input(s)",
            task.task_type,
            task.task_type.min_inputs()
        )));
    }
    if task.inputs.iter().any(|i| i.path.trim().is_empty()) {
        return Err(StoreError::validation("Input paths must not be empty"));
    }
    Ok(())
}

/// Checks every write must pass, including status changes on rows that
/// predate the current create-time rules.
fn validate_write(task: &Task) -> StoreResult<()> {
    if task.id.as_str().trim().is_empty() {
        return Err(StoreError::validation("Task ID is required"));
    }
    if task.progress > 100 {
        return Err(StoreError::validation("Progress must be within 0-100"));
    }
    if !task.outputs.is_empty() && task.status != TaskStatus::Completed {
        return Err(StoreError::validation("Only completed tasks may carry outputs"));
    }
    Ok(())
}

fn insert_task(conn: &Connection, task: &Task) -> StoreResult<()> {
    let inputs_json = serde_json::to_string(&task.inputs)?;
    let outputs_json = serde_json::to_string(&task.outputs)?;
    let config_json = serde_json::to_string(&task.config)?;

    let result = conn.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            TASK_COLUMNS
        ),
        params![
            task.id.as_str(),
            task.task_type.as_str(),
            task.name,
            task.status.as_str(),
            task.progress as i64,
            task.current_step,
            to_millis(task.created_at),
            task.started_at.map(to_millis),
            task.completed_at.map(to_millis),
            task.execution_time_ms.map(|v| v as i64),
            task.total_execution_time_ms as i64,
            task.output_dir,
            inputs_json,
            outputs_json,
            config_json,
            task.error.as_ref().map(|e| e.kind.as_str()),
            task.error.as_ref().map(|e| e.message.as_str()),
            task.retry_count as i64,
            task.enqueued_at.map(to_millis),
            task.last_resumed_at.map(to_millis),
            task.attempt_elapsed_ms as i64,
            to_millis(task.updated_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::validation(format!("Task {} already exists", task.id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Current status of a task, `NotFound` if it does not exist.
fn status_of(conn: &Connection, id: &TaskId) -> StoreResult<TaskStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(decode_error)?;

    let raw = raw.ok_or_else(|| StoreError::not_found(format!("task {}", id)))?;
    TaskStatus::parse(&raw)
        .ok_or_else(|| StoreError::corruption(format!("task {} has unknown status '{}'", id, raw)))
}

fn load_task(conn: &Connection, id: &TaskId) -> StoreResult<Task> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    let raw = conn
        .query_row(&sql, params![id.as_str()], RawTaskRow::from_row)
        .optional()
        .map_err(decode_error)?;

    raw.ok_or_else(|| StoreError::not_found(format!("task {}", id)))?
        .into_task()
}

fn query_tasks(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> StoreResult<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, RawTaskRow::from_row)?;

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.map_err(decode_error)?.into_task()?);
    }
    Ok(tasks)
}

/// A task row as stored, before domain decoding.
struct RawTaskRow {
    id: String,
    task_type: String,
    name: String,
    status: String,
    progress: i64,
    current_step: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    execution_time_ms: Option<i64>,
    total_execution_time_ms: i64,
    output_dir: String,
    inputs_json: String,
    outputs_json: String,
    config_json: String,
    error_kind: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    enqueued_at: Option<i64>,
    last_resumed_at: Option<i64>,
    attempt_elapsed_ms: i64,
    updated_at: i64,
}

impl RawTaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            progress: row.get(4)?,
            current_step: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            execution_time_ms: row.get(9)?,
            total_execution_time_ms: row.get(10)?,
            output_dir: row.get(11)?,
            inputs_json: row.get(12)?,
            outputs_json: row.get(13)?,
            config_json: row.get(14)?,
            error_kind: row.get(15)?,
            error_message: row.get(16)?,
            retry_count: row.get(17)?,
            enqueued_at: row.get(18)?,
            last_resumed_at: row.get(19)?,
            attempt_elapsed_ms: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        let id = self.id;
        let corrupt = |what: String| StoreError::corruption(format!("task {} {}", id, what));

        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("has unknown status '{}'", self.status)))?;
        let task_type = TaskType::parse(&self.task_type)
            .ok_or_else(|| corrupt(format!("has unknown type '{}'", self.task_type)))?;
        let progress = u8::try_from(self.progress)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| corrupt(format!("has progress out of range ({})", self.progress)))?;

        let inputs: Vec<TaskInput> = serde_json::from_str(&self.inputs_json)
            .map_err(|e| corrupt(format!("has undecodable inputs: {}", e)))?;
        let outputs: Vec<String> = serde_json::from_str(&self.outputs_json)
            .map_err(|e| corrupt(format!("has undecodable outputs: {}", e)))?;
        let config: serde_json::Value = serde_json::from_str(&self.config_json)
            .map_err(|e| corrupt(format!("has undecodable config: {}", e)))?;

        let error = match self.error_kind {
            Some(kind) => Some(TaskError {
                kind: TaskErrorKind::parse(&kind)
                    .ok_or_else(|| corrupt(format!("has unknown error kind '{}'", kind)))?,
                message: self.error_message.unwrap_or_default(),
            }),
            None => None,
        };

        let ts = |field: &str, v: i64| from_millis(&id, field, v);
        let opt_ts = |field: &str, v: Option<i64>| v.map(|v| from_millis(&id, field, v)).transpose();

        Ok(Task {
            created_at: ts("created_at", self.created_at)?,
            started_at: opt_ts("started_at", self.started_at)?,
            completed_at: opt_ts("completed_at", self.completed_at)?,
            enqueued_at: opt_ts("enqueued_at", self.enqueued_at)?,
            last_resumed_at: opt_ts("last_resumed_at", self.last_resumed_at)?,
            updated_at: ts("updated_at", self.updated_at)?,
            task_type,
            name: self.name,
            status,
            progress,
            current_step: self.current_step,
            execution_time_ms: self.execution_time_ms.map(|v| v.max(0) as u64),
            total_execution_time_ms: self.total_execution_time_ms.max(0) as u64,
            output_dir: self.output_dir,
            inputs,
            outputs,
            config,
            error,
            retry_count: self.retry_count.clamp(0, u32::MAX as i64) as u32,
            attempt_elapsed_ms: self.attempt_elapsed_ms.max(0) as u64,
            id: TaskId(id.clone()),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mediaq_models::NewTask;

    pub(crate) fn memory_store() -> TaskStore {
        let dir = std::env::temp_dir().join("mediaq-store-unit");
        TaskStore::open(StoreConfig::in_memory(dir)).unwrap()
    }

    pub(crate) fn sample_task(name: &str) -> Task {
        Task::new(
            NewTask::new(TaskType::VideoResize, name, "/tmp/out")
                .with_input(TaskInput::main("/videos/in.mp4"))
                .with_config(serde_json::json!({ "width": 1280, "height": 720 })),
        )
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let store = memory_store();
        let task = sample_task("resize");
        let id = store.create_task(&task).unwrap();

        let loaded = store.get_task(&id).unwrap();
        assert_eq!(loaded.name, "resize");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.config["width"], 1280);
        assert_eq!(loaded.inputs, task.inputs);
        assert_eq!(loaded.created_at.timestamp_millis(), task.created_at.timestamp_millis());
    }

    #[test]
    fn test_create_rejects_missing_fields() {
        let store = memory_store();
        let mut task = sample_task("x");
        task.inputs.clear();
        assert!(matches!(store.create_task(&task), Err(StoreError::Validation(_))));

        let mut task = sample_task("x");
        task.output_dir = String::new();
        assert!(matches!(store.create_task(&task), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_duplicate_id_is_validation_error() {
        let store = memory_store();
        let task = sample_task("dup");
        store.create_task(&task).unwrap();
        assert!(matches!(store.create_task(&task), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_get_unknown_task_is_not_found() {
        let store = memory_store();
        let err = store.get_task(&TaskId::from("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_enforces_state_machine() {
        let store = memory_store();
        let mut task = sample_task("sm");
        store.create_task(&task).unwrap();

        // Bypass the model checks to simulate an illegal patch
        task.status = TaskStatus::Completed;
        task.outputs = vec!["/tmp/out/x.mp4".into()];
        let err = store.update_task(&task, TaskStatus::Pending).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_update_detects_concurrent_modification() {
        let store = memory_store();
        let mut task = sample_task("cm");
        store.create_task(&task).unwrap();

        task.submit().unwrap();
        store.update_task(&task, TaskStatus::Pending).unwrap();

        // A second writer still believes the task is pending
        let mut stale = task.clone();
        stale.status = TaskStatus::Pending;
        stale.cancel().unwrap();
        let err = store.update_task(&stale, TaskStatus::Pending).unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentModification { .. }));
    }

    #[test]
    fn test_progress_only_while_running_and_monotonic() {
        let store = memory_store();
        let mut task = sample_task("p");
        store.create_task(&task).unwrap();
        assert!(!store.update_progress(&task.id, 10, None).unwrap());

        task.submit().unwrap();
        store.update_task(&task, TaskStatus::Pending).unwrap();
        task.start_running().unwrap();
        store.update_task(&task, TaskStatus::Queued).unwrap();

        assert!(store.update_progress(&task.id, 50, Some("encoding")).unwrap());
        assert!(store.update_progress(&task.id, 30, None).unwrap());
        let loaded = store.get_task(&task.id).unwrap();
        assert_eq!(loaded.progress, 50);
        assert_eq!(loaded.current_step.as_deref(), Some("encoding"));
    }

    #[test]
    fn test_list_filters_and_paginates() {
        let store = memory_store();
        for i in 0..7 {
            let mut task = sample_task(&format!("clip {}", i));
            if i % 2 == 0 {
                task.task_type = TaskType::VideoCompress;
            }
            store.create_task(&task).unwrap();
        }

        let page = store
            .list_tasks(&TaskFilter::default(), Pagination::new(1, 3))
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.tasks.len(), 3);
        assert_eq!(page.tasks[0].name, "clip 6");

        let last = store
            .list_tasks(&TaskFilter::default(), Pagination::new(3, 3))
            .unwrap();
        assert_eq!(last.tasks.len(), 1);

        let compress = store
            .list_tasks(
                &TaskFilter::default().with_type(TaskType::VideoCompress),
                Pagination::default(),
            )
            .unwrap();
        assert_eq!(compress.total, 4);

        let search = store
            .list_tasks(&TaskFilter::default().with_search("clip 3"), Pagination::default())
            .unwrap();
        assert_eq!(search.total, 1);

        let none = store
            .list_tasks(
                &TaskFilter::default().with_status(TaskStatus::Running),
                Pagination::default(),
            )
            .unwrap();
        assert_eq!(none.total, 0);
    }

    #[test]
    fn test_search_escapes_wildcards() {
        let store = memory_store();
        store.create_task(&sample_task("100% done")).unwrap();
        store.create_task(&sample_task("1000 frames")).unwrap();

        let page = store
            .list_tasks(&TaskFilter::default().with_search("100%"), Pagination::default())
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].name, "100% done");
    }

    #[test]
    fn test_delete_removes_logs() {
        let store = memory_store();
        let task = sample_task("d");
        store.create_task(&task).unwrap();
        store.append_log(&task.id, LogLevel::Info, "created").unwrap();
        store.append_log(&task.id, LogLevel::Warn, "slow input").unwrap();
        assert_eq!(store.stats().unwrap().log_count, 2);

        store.delete_task(&task.id).unwrap();
        assert_eq!(store.stats().unwrap().log_count, 0);
        assert!(store.delete_task(&task.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_running_is_refused() {
        let store = memory_store();
        let mut task = sample_task("r");
        store.create_task(&task).unwrap();
        task.submit().unwrap();
        store.update_task(&task, TaskStatus::Pending).unwrap();
        task.start_running().unwrap();
        store.update_task(&task, TaskStatus::Queued).unwrap();

        assert!(matches!(store.delete_task(&task.id), Err(StoreError::Validation(_))));
        assert!(store.get_task(&task.id).is_ok());
    }

    #[test]
    fn test_task_logs_limit_keeps_latest() {
        let store = memory_store();
        let task = sample_task("logs");
        store.create_task(&task).unwrap();
        for i in 0..5 {
            store.append_log(&task.id, LogLevel::Info, &format!("line {}", i)).unwrap();
        }

        let all = store.task_logs(&task.id, None).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].message, "line 0");

        let tail = store.task_logs(&task.id, Some(2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 3");
        assert_eq!(tail[1].message, "line 4");

        assert!(store
            .append_log(&TaskId::from("ghost"), LogLevel::Info, "x")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_clear_logs_counts_rows() {
        let store = memory_store();
        let a = sample_task("a");
        let b = sample_task("b");
        store.create_tasks(&[a.clone(), b.clone()]).unwrap();
        store.append_log(&a.id, LogLevel::Info, "1").unwrap();
        store.append_log(&a.id, LogLevel::Info, "2").unwrap();
        store.append_log(&b.id, LogLevel::Info, "3").unwrap();

        assert_eq!(store.clear_logs(Some(&a.id)).unwrap(), 2);
        assert_eq!(store.clear_logs(None).unwrap(), 1);
    }

    #[test]
    fn test_cleanup_spares_active_tasks() {
        let store = memory_store();
        let old = Utc::now() - ChronoDuration::days(30);

        for status in TaskStatus::ALL {
            let mut task = sample_task(status.as_str());
            task.status = status;
            task.created_at = old;
            if status.is_terminal() {
                task.completed_at = Some(old);
            }
            if status == TaskStatus::Completed {
                task.outputs = vec!["/tmp/out/done.mp4".into()];
            }
            store.create_task(&task).unwrap();
        }

        let removed = store.cleanup_older_than(7).unwrap();
        assert_eq!(removed, 3);

        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Paused,
        ] {
            assert_eq!(store.count_with_status(status).unwrap(), 1, "{} removed", status);
        }
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert_eq!(store.count_with_status(status).unwrap(), 0);
        }
    }

    #[test]
    fn test_cleanup_keeps_recent_finished_tasks() {
        let store = memory_store();
        let mut task = sample_task("recent");
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        store.create_task(&task).unwrap();

        assert_eq!(store.cleanup_older_than(1).unwrap(), 0);
    }

    #[test]
    fn test_stats_counts_outputs() {
        let store = memory_store();
        let mut done = sample_task("done");
        done.status = TaskStatus::Completed;
        done.outputs = vec!["a.mp4".into(), "b.mp4".into()];
        store.create_task(&done).unwrap();
        store.create_task(&sample_task("pending")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.task_count, 2);
        assert_eq!(stats.output_count, 2);
        assert!(stats.file_size > 0);
        assert!(stats.oldest_task.is_some());
        assert!(stats.oldest_task <= stats.newest_task);
    }

    #[test]
    fn test_corrupt_row_only_fails_its_reads() {
        let store = memory_store();
        let good = sample_task("good");
        let bad = sample_task("bad");
        store.create_tasks(&[good.clone(), bad.clone()]).unwrap();
        store
            .conn()
            .execute(
                "UPDATE tasks SET status = 'exploded' WHERE id = ?1",
                params![bad.id.as_str()],
            )
            .unwrap();

        assert!(store.get_task(&good.id).is_ok());
        assert!(store.get_task(&bad.id).unwrap_err().is_corruption());
    }

    #[test]
    fn test_tasks_with_status_orders_by_enqueue_time() {
        let store = memory_store();
        let mut first = sample_task("first");
        let mut second = sample_task("second");
        first.submit().unwrap();
        second.submit().unwrap();
        second.enqueued_at = first.enqueued_at.map(|t| t - ChronoDuration::seconds(5));
        store.create_tasks(&[first.clone(), second.clone()]).unwrap();

        let queued = store.tasks_with_status(TaskStatus::Queued).unwrap();
        assert_eq!(queued[0].id, second.id);
        assert_eq!(queued[1].id, first.id);
    }

    #[test]
    fn test_status_writes_skip_create_time_rules() {
        let store = memory_store();
        let task = sample_task("legacy");
        store.create_task(&task).unwrap();
        store
            .conn()
            .execute(
                "UPDATE tasks SET inputs_json = '[]' WHERE id = ?1",
                params![task.id.as_str()],
            )
            .unwrap();

        let mut legacy = store.get_task(&task.id).unwrap();
        assert!(legacy.inputs.is_empty());
        legacy.cancel().unwrap();
        store.update_task(&legacy, TaskStatus::Pending).unwrap();
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_ids_listed_for_undecodable_rows() {
        let store = memory_store();
        let good = sample_task("good");
        let bad = sample_task("bad");
        store.create_tasks(&[good.clone(), bad.clone()]).unwrap();
        store
            .conn()
            .execute(
                "UPDATE tasks SET config_json = '{oops' WHERE id = ?1",
                params![bad.id.as_str()],
            )
            .unwrap();

        assert!(store.tasks_with_status(TaskStatus::Pending).unwrap_err().is_corruption());
        let ids = store.task_ids_with_status(TaskStatus::Pending).unwrap();
        assert_eq!(ids, vec![good.id, bad.id]);
    }

    #[test]
    fn test_force_terminal_without_decoding() {
        let store = memory_store();
        let mut task = sample_task("forced");
        task.submit().unwrap();
        task.start_running().unwrap();
        task.last_resumed_at = task.last_resumed_at.map(|t| t - ChronoDuration::seconds(2));
        store.create_task(&task).unwrap();
        store
            .conn()
            .execute(
                "UPDATE tasks SET config_json = '{oops' WHERE id = ?1",
                params![task.id.as_str()],
            )
            .unwrap();

        let error = TaskError::execution("outcome could not be recorded");
        assert!(store
            .force_terminal(&task.id, TaskStatus::Running, TaskStatus::Failed, Some(&error))
            .unwrap());
        assert!(!store
            .force_terminal(&task.id, TaskStatus::Running, TaskStatus::Cancelled, None)
            .unwrap());

        let (status, kind, elapsed): (String, Option<String>, Option<i64>) = store
            .conn()
            .query_row(
                "SELECT status, error_kind, execution_time_ms FROM tasks WHERE id = ?1",
                params![task.id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "failed");
        assert_eq!(kind.as_deref(), Some("execution"));
        assert!(elapsed.unwrap() >= 2000);
    }

    #[test]
    fn test_force_terminal_respects_state_machine() {
        let store = memory_store();
        let task = sample_task("pending");
        store.create_task(&task).unwrap();

        let err = store
            .force_terminal(&task.id, TaskStatus::Pending, TaskStatus::Failed, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        assert!(store
            .force_terminal(&task.id, TaskStatus::Pending, TaskStatus::Completed, None)
            .is_err());
        assert!(store
            .force_terminal(&task.id, TaskStatus::Pending, TaskStatus::Cancelled, None)
            .unwrap());
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    }
}
