//! Errors.
//!
//! Task-level failures are data (`TaskFailure` in a `TaskResult`), not errors.
//! The enums here cover the API surface and infrastructure:
//! - `SkeinError`: manager operations (unknown ids, duplicate workers, ...)
//! - `QueueError`: local queue full / empty
//! - `StoreError`: shared store unreachable / undecodable entries
//! - `RegistryError`, `WorkflowError`: configuration mistakes caught up front

use thiserror::Error;

use super::ids::{TaskId, WorkflowId};
use super::state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for {task_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue '{queue}' is full (maxsize={maxsize})")]
    Full { queue: String, maxsize: usize },

    #[error("queue '{queue}' is empty")]
    Empty { queue: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unreachable: {0}")]
    Unreachable(String),

    #[error("shared store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("duplicate workflow step '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected among steps {0:?}")]
    CycleDetected(Vec<String>),

    #[error("step '{step}' cannot run: dependency '{dependency}' is {status}")]
    DependencyNotSatisfied {
        step: String,
        dependency: String,
        status: TaskStatus,
    },
}

#[derive(Debug, Error)]
pub enum SkeinError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker already exists: {0}")]
    DuplicateWorker(String),

    #[error("no task registered under '{0}'")]
    UnknownFunction(String),

    #[error("cancelling distributed task {0} is not supported")]
    CancelUnsupported(TaskId),

    #[error("task {task_id} already finished with status {status}")]
    TaskFinished { task_id: TaskId, status: TaskStatus },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}
