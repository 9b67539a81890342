//! TaskLedger: latest known state of every task submitted to (or run by) this
//! manager.
//!
//! - Queues hold copies of tasks; the ledger is what callers read.
//! - A terminal entry is never overwritten, so a worker that finishes after
//!   a cancel cannot resurrect the task.
//! - While a local task runs, its cancellation token lives here so that
//!   `cancel` can reach the worker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::{SkeinError, Task, TaskId, TaskResult, TaskStatus};
use crate::observability::StatusCounts;

#[derive(Debug)]
struct LedgerEntry {
    task: Task,
    distributed: bool,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Default)]
pub struct TaskLedger {
    entries: Mutex<HashMap<TaskId, LedgerEntry>>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly submitted task.
    pub fn insert(&self, task: Task, distributed: bool) {
        self.entries().insert(
            task.id,
            LedgerEntry {
                task,
                distributed,
                cancel: None,
            },
        );
    }

    /// Replace the stored copy unless the stored one is already terminal.
    ///
    /// Unknown ids are ignored (a peer's distributed task). Returns whether the
    /// update was applied.
    pub fn update(&self, task: &Task) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&task.id) else {
            return false;
        };
        if entry.task.status.is_terminal() {
            return false;
        }
        entry.task = task.clone();
        if task.status != TaskStatus::Running {
            entry.cancel = None;
        }
        true
    }

    /// Claim a dequeued task for execution.
    ///
    /// Returns `false` when the task must be skipped because this ledger
    /// already has it in a terminal state (cancelled while queued). On
    /// success the running copy and its cancel token are stored.
    pub fn begin_attempt(&self, task: &Task, cancel: CancellationToken) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(&task.id) {
            Some(entry) if entry.task.status.is_terminal() => false,
            Some(entry) => {
                entry.task = task.clone();
                entry.cancel = Some(cancel);
                true
            }
            None => true,
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskResult> {
        self.entries().get(&task_id).map(|e| e.task.to_result())
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.entries().get(&task_id).map(|e| e.task.status)
    }

    pub fn is_distributed(&self, task_id: TaskId) -> Option<bool> {
        self.entries().get(&task_id).map(|e| e.distributed)
    }

    /// Fold a result published elsewhere (shared result cache) into the entry.
    pub fn absorb_result(&self, result: &TaskResult) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&result.task_id) else {
            return;
        };
        if entry.task.status.is_terminal() {
            return;
        }
        let task = &mut entry.task;
        task.status = result.status;
        task.result = result.result.clone();
        task.error = result.error.clone();
        task.retry_count = result.retry_count;
        task.worker_id = result.worker_id.clone();
        task.started_at = result.started_at;
        task.completed_at = result.completed_at;
    }

    /// Cancel a local task.
    ///
    /// Running: the worker's token is triggered and the entry becomes
    /// CANCELLED right away. Pending / Retry: the entry becomes CANCELLED and
    /// the worker skips it on dequeue.
    pub fn cancel(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<TaskResult, SkeinError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(&task_id)
            .ok_or(SkeinError::TaskNotFound(task_id))?;

        if entry.distributed {
            return Err(SkeinError::CancelUnsupported(task_id));
        }
        if entry.task.status.is_terminal() {
            return Err(SkeinError::TaskFinished {
                task_id,
                status: entry.task.status,
            });
        }

        if let Some(token) = entry.cancel.take() {
            token.cancel();
        }
        entry.task.mark_cancelled(now)?;
        Ok(entry.task.to_result())
    }

    pub fn counts(&self) -> StatusCounts {
        self.entries().values().map(|e| e.task.status).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
