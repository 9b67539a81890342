//! TaskResult: the uniform result channel.
//!
//! Callers never see task failures as Rust errors from `submit_task`; every
//! outcome (success, handler error, timeout, cancel, rejected enqueue) ends up
//! here, and the same shape is what the distributed path publishes to the
//! shared result cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;
use super::state::TaskStatus;

/// Classification of a task-level failure.
///
/// Serialized as SCREAMING_SNAKE_CASE to match the status names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// `func_name` is not in the receiver's registry.
    UnregisteredFunction,

    /// The handler returned an error (or panicked).
    Execution,

    /// The handler exceeded `config.timeout`.
    Timeout,

    Cancelled,

    /// The local queue was full at submission or re-queue time.
    QueueFull,

    /// The shared store could not be reached.
    Infrastructure,
}

impl ErrorKind {
    /// Only handler-side failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Execution | ErrorKind::Timeout)
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unregistered(func_name: &str) -> Self {
        Self::new(
            ErrorKind::UnregisteredFunction,
            format!("unregistered task function: {func_name}"),
        )
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("task execution timed out after {:.3}s", after.as_secs_f64()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task was cancelled")
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Snapshot of a task as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,

    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Wall-clock time between the first start and completion, if both happened.
    pub fn run_time(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}
