//! Task records and their lifecycle operations.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::status::{TaskStatus, TransitionError};

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of media job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    /// Concatenate or composite several videos into one
    VideoMerge,
    /// Change video resolution
    VideoResize,
    /// Re-encode video at a lower bitrate
    VideoCompress,
    /// Cut a video into segments
    VideoSlice,
    /// Change image dimensions
    ImageResize,
    /// Re-encode images at a lower quality
    ImageCompress,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::VideoMerge,
        TaskType::VideoResize,
        TaskType::VideoCompress,
        TaskType::VideoSlice,
        TaskType::ImageResize,
        TaskType::ImageCompress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::VideoMerge => "videoMerge",
            TaskType::VideoResize => "videoResize",
            TaskType::VideoCompress => "videoCompress",
            TaskType::VideoSlice => "videoSlice",
            TaskType::ImageResize => "imageResize",
            TaskType::ImageCompress => "imageCompress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Minimum number of inputs a job of this kind needs.
    pub fn min_inputs(&self) -> usize {
        match self {
            TaskType::VideoMerge => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One input file of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskInput {
    /// Path to the source file
    pub path: String,
    /// Role of the file within the job (e.g. "main", "overlay", "audio")
    #[serde(default = "default_input_role")]
    pub role: String,
}

fn default_input_role() -> String {
    "main".to_string()
}

impl TaskInput {
    pub fn new(path: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            role: role.into(),
        }
    }

    /// Input with the default "main" role.
    pub fn main(path: impl Into<String>) -> Self {
        Self::new(path, default_input_role())
    }
}

/// Category of an error recorded on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The execution collaborator reported a failure
    Execution,
    /// The task was running when the process stopped
    RecoveryInterrupted,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::Execution => "execution",
            TaskErrorKind::RecoveryInterrupted => "recovery_interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(TaskErrorKind::Execution),
            "recovery_interrupted" => Some(TaskErrorKind::RecoveryInterrupted),
            _ => None,
        }
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
        }
    }

    pub fn recovery_interrupted() -> Self {
        Self {
            kind: TaskErrorKind::RecoveryInterrupted,
            message: "Task was running when the application stopped. Retry to run it again.".into(),
        }
    }
}

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewTask {
    pub task_type: TaskType,
    pub name: String,
    pub output_dir: String,
    pub inputs: Vec<TaskInput>,
    /// Job parameters, passed to the execution collaborator untouched
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NewTask {
    pub fn new(task_type: TaskType, name: impl Into<String>, output_dir: impl Into<String>) -> Self {
        Self {
            task_type,
            name: name.into(),
            output_dir: output_dir.into(),
            inputs: Vec::new(),
            config: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_input(mut self, input: TaskInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Validate the request.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Task name is required".to_string());
        }

        if self.output_dir.trim().is_empty() {
            return Err("Output directory is required".to_string());
        }

        if self.inputs.len() < self.task_type.min_inputs() {
            return Err(format!(
                "{} requires at least {} input(s), got {}",
                self.task_type,
                self.task_type.min_inputs(),
                self.inputs.len()
            ));
        }

        if self.inputs.iter().any(|i| i.path.trim().is_empty()) {
            return Err("Input paths must not be empty".to_string());
        }

        Ok(())
    }
}

/// Editable fields of a task that is not queued or running.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// A batch media job tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// Unique task ID
    pub id: TaskId,

    /// Job kind
    pub task_type: TaskType,

    /// Display name
    pub name: String,

    /// Lifecycle status
    pub status: TaskStatus,

    /// Progress (0-100), monotonic while running
    pub progress: u8,

    /// Current processing step reported by the executor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the current attempt first started running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Running time of the latest attempt, set on reaching a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,

    /// Running time accumulated over every attempt
    #[serde(default)]
    pub total_execution_time_ms: u64,

    /// Directory outputs are written to
    pub output_dir: String,

    /// Ordered input files
    pub inputs: Vec<TaskInput>,

    /// Produced files, only populated when completed
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Opaque job parameters
    #[serde(default)]
    pub config: serde_json::Value,

    /// Error (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Number of explicit retries
    #[serde(default)]
    pub retry_count: u32,

    /// When the task last entered the queue (FIFO order key)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    /// Start of the current running segment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_resumed_at: Option<DateTime<Utc>>,

    /// Running time of the current attempt accumulated across pauses
    #[serde(default)]
    pub attempt_elapsed_ms: u64,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task from a validated request.
    pub fn new(request: NewTask) -> Self {
        let now = Utc::now();
        let config = if request.config.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            request.config
        };

        Self {
            id: TaskId::new(),
            task_type: request.task_type,
            name: request.name.trim().to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            total_execution_time_ms: 0,
            output_dir: request.output_dir,
            inputs: request.inputs,
            outputs: Vec::new(),
            config,
            error: None,
            retry_count: 0,
            enqueued_at: None,
            last_resumed_at: None,
            attempt_elapsed_ms: 0,
            updated_at: now,
        }
    }

    fn set_status(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn expect_status(&self, expected: TaskStatus, next: TaskStatus) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to: next,
            })
        }
    }

    /// Fold the open running segment into the attempt's elapsed time.
    fn close_segment(&mut self) {
        if let Some(since) = self.last_resumed_at.take() {
            let elapsed = (Utc::now() - since).num_milliseconds().max(0) as u64;
            self.attempt_elapsed_ms += elapsed;
        }
    }

    fn finish_attempt(&mut self) {
        self.completed_at = Some(Utc::now());
        self.execution_time_ms = Some(self.attempt_elapsed_ms);
        self.total_execution_time_ms += self.attempt_elapsed_ms;
    }

    /// Submit a pending task to the queue.
    pub fn submit(&mut self) -> Result<(), TransitionError> {
        self.expect_status(TaskStatus::Pending, TaskStatus::Queued)?;
        self.set_status(TaskStatus::Queued)?;
        self.enqueued_at = Some(Utc::now());
        Ok(())
    }

    /// Put a paused task back into the queue.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.expect_status(TaskStatus::Paused, TaskStatus::Queued)?;
        self.set_status(TaskStatus::Queued)?;
        self.enqueued_at = Some(Utc::now());
        Ok(())
    }

    /// Admit the task to a concurrency slot.
    pub fn start_running(&mut self) -> Result<(), TransitionError> {
        self.set_status(TaskStatus::Running)?;
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.last_resumed_at = Some(now);
        Ok(())
    }

    /// Record progress. Ignored unless running; never moves backwards.
    pub fn record_progress(&mut self, progress: u8, step: Option<String>) {
        if self.status != TaskStatus::Running {
            return;
        }
        self.progress = self.progress.max(progress.min(100));
        if step.is_some() {
            self.current_step = step;
        }
        self.updated_at = Utc::now();
    }

    /// Pause a running task.
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.set_status(TaskStatus::Paused)?;
        self.close_segment();
        Ok(())
    }

    /// Mark the task as completed with its produced outputs.
    pub fn complete(&mut self, outputs: Vec<String>) -> Result<(), TransitionError> {
        self.set_status(TaskStatus::Completed)?;
        self.close_segment();
        self.progress = 100;
        self.current_step = None;
        self.outputs = outputs;
        self.error = None;
        self.finish_attempt();
        Ok(())
    }

    /// Mark the task as failed.
    pub fn fail(&mut self, error: TaskError) -> Result<(), TransitionError> {
        self.set_status(TaskStatus::Failed)?;
        self.close_segment();
        self.error = Some(error);
        self.finish_attempt();
        Ok(())
    }

    /// Demote a task that was running when the process stopped.
    ///
    /// The interrupted segment has no reliable end time, so it does not
    /// count towards execution time.
    pub fn interrupt(&mut self) -> Result<(), TransitionError> {
        self.set_status(TaskStatus::Failed)?;
        self.last_resumed_at = None;
        self.error = Some(TaskError::recovery_interrupted());
        self.finish_attempt();
        Ok(())
    }

    /// Cancel the task.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.set_status(TaskStatus::Cancelled)?;
        self.close_segment();
        self.finish_attempt();
        Ok(())
    }

    /// Re-queue a failed or cancelled task for a fresh attempt.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        if !matches!(self.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(TransitionError {
                from: self.status,
                to: TaskStatus::Queued,
            });
        }
        self.set_status(TaskStatus::Queued)?;
        self.progress = 0;
        self.current_step = None;
        self.error = None;
        self.outputs.clear();
        self.started_at = None;
        self.completed_at = None;
        self.execution_time_ms = None;
        self.attempt_elapsed_ms = 0;
        self.last_resumed_at = None;
        self.retry_count += 1;
        self.enqueued_at = Some(Utc::now());
        Ok(())
    }

    /// Apply editable fields. Callers decide which statuses allow edits.
    pub fn apply_update(&mut self, update: TaskUpdate) -> Result<(), String> {
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err("Task name is required".to_string());
            }
            self.name = name.trim().to_string();
        }
        if let Some(output_dir) = update.output_dir {
            if output_dir.trim().is_empty() {
                return Err("Output directory is required".to_string());
            }
            self.output_dir = output_dir;
        }
        if let Some(config) = update.config {
            self.config = config;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
