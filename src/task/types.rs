use crate::env;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Core task structure: identity, scheduling metadata, lifecycle timestamps and results
#[derive(Serialize, Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Option<TaskInput>,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip)]
    pub(crate) body: TaskBody,
}

/// Task status. `Pending` is the only initial state; the last three are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued and waiting for a worker slot
    Pending,
    /// Handed to a worker slot
    Running,
    /// Body returned successfully
    Completed,
    /// Body returned an error or panicked
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

/// Task priority levels; higher value means more urgent
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical = 4,
    High = 3,
    #[default]
    Normal = 2,
    Low = 1,
}

/// Opaque key/value payload handed to the task body
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskInput {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Result produced once by the worker that executed the task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskOutput {
    pub result: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Errors surfaced synchronously by the task engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Task engine is not running")]
    NotRunning,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} was already submitted")]
    DuplicateTask(TaskId),

    #[error("Task {id} is not pending (status: {status})")]
    NotPending { id: TaskId, status: TaskStatus },

    #[error("Task {id} cannot be retried: {reason}")]
    NotRetryable { id: TaskId, reason: String },
}

/// The "do work" function carried by a task.
///
/// Implementations receive a copy of the task's input and return a JSON
/// result. Any error or panic is captured by the engine and recorded on the
/// task; it never escapes the worker slot.
#[async_trait]
pub trait TaskWork: Send + Sync {
    async fn run(&self, input: TaskInput) -> anyhow::Result<serde_json::Value>;
}

/// Shareable handle to a task's work
#[derive(Clone)]
pub struct TaskBody(Arc<dyn TaskWork>);

struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> TaskWork for FnWork<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    async fn run(&self, input: TaskInput) -> anyhow::Result<serde_json::Value> {
        (self.0)(input).await
    }
}

struct NoopWork;

#[async_trait]
impl TaskWork for NoopWork {
    async fn run(&self, _input: TaskInput) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

impl TaskBody {
    /// Wrap a [`TaskWork`] implementation
    pub fn new<W: TaskWork + 'static>(work: W) -> Self {
        Self(Arc::new(work))
    }

    /// Build a body from an async closure
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self(Arc::new(FnWork(f)))
    }

    /// Body that does nothing and returns `null`
    pub fn noop() -> Self {
        Self(Arc::new(NoopWork))
    }

    pub(crate) async fn run(&self, input: TaskInput) -> anyhow::Result<serde_json::Value> {
        self.0.run(input).await
    }
}

impl Default for TaskBody {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskBody")
    }
}

impl Task {
    /// Create a new pending task with normal priority
    pub fn new(name: impl Into<String>, body: TaskBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: env::DEFAULT_MAX_RETRIES,
            body,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check if task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if task is currently running
    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// A task may be retried only after failing, while it has retries left
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Get task age since creation
    pub fn age(&self) -> Duration {
        Utc::now().signed_duration_since(self.created_at)
    }

    /// Wall-clock execution time, if the task has started
    pub fn runtime(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(started))
    }

    pub(crate) fn mark_running(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub(crate) fn mark_completed(&mut self, output: TaskOutput) -> bool {
        if !self.finish(TaskStatus::Completed) {
            return false;
        }
        self.output = Some(output);
        true
    }

    pub(crate) fn mark_failed(&mut self, error: String) -> bool {
        if !self.finish(TaskStatus::Failed) {
            return false;
        }
        self.output = Some(TaskOutput::failure(error.clone()));
        self.error = Some(error);
        true
    }

    pub(crate) fn mark_cancelled(&mut self) -> bool {
        self.finish(TaskStatus::Cancelled)
    }

    /// Put a failed task back into the pending state for another attempt
    pub(crate) fn reset_for_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.output = None;
        self.error = None;
        true
    }

    fn finish(&mut self, status: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl TaskPriority {
    /// Get numeric value for comparisons and logging
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(TaskPriority::Critical),
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            other => Err(format!(
                "invalid priority: {other} (expected critical, high, normal or low)"
            )),
        }
    }
}

impl TaskInput {
    pub fn new() -> Self {
        Self {
            data: serde_json::Map::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Build an input from a JSON object; non-object values are stored under `"value"`
    pub fn from_value(value: serde_json::Value) -> Self {
        let data = match value {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            data,
            ..Self::new()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

impl Default for TaskInput {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskOutput {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result,
            success: true,
            error: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::Null,
            success: false,
            error: Some(error.into()),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}
