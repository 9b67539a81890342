//! Domain model: ids, tasks, statuses, results, errors.

pub mod errors;
pub mod ids;
pub mod result;
pub mod state;
pub mod task;

pub use self::errors::{
    InvalidTransition, QueueError, RegistryError, SkeinError, StoreError, WorkflowError,
};
pub use self::ids::{TaskId, WorkflowId};
pub use self::result::{ErrorKind, TaskFailure, TaskResult};
pub use self::state::TaskStatus;
pub use self::task::{Task, TaskArgs, TaskCommand, TaskConfig, TaskPriority};
