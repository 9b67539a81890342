//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a task (also reused for workflows and workflow steps).
///
/// State transitions:
/// - Pending -> Running -> Success | Failure | Cancelled
/// - Pending -> Running -> Retry -> Pending (loop until max_retries)
/// - Pending | Retry -> Cancelled (cancelled while waiting in a queue)
/// - Pending | Retry -> Failure (could not be enqueued)
///
/// Success / Failure / Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in a queue.
    Pending,

    /// Currently being executed by a worker.
    Running,

    Success,

    /// Failed permanently (no retries left, or not retryable).
    Failure,

    /// Attempt failed; waiting for the retry delay before re-queue.
    Retry,

    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failure)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Cancelled)
                | (Running, Retry)
                | (Retry, Pending)
                | (Retry, Cancelled)
                | (Retry, Failure)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
