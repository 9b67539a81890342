//! Task, its policy, and the serializable command descriptor.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::errors::InvalidTransition;
use super::ids::TaskId;
use super::result::{TaskFailure, TaskResult};
use super::state::TaskStatus;

/// Task priority. Ordering is LOW < NORMAL < HIGH < URGENT.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Immutable policy attached to a task at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub max_retries: u32,

    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    pub priority: TaskPriority,
    pub queue_name: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            priority: TaskPriority::Normal,
            queue_name: "default".to_string(),
        }
    }
}

impl TaskConfig {
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }
}

/// Durations as floating-point seconds (`timeout = 0.5`).
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Positional and named arguments handed to a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Decode the named arguments into a typed struct.
    pub fn decode_kwargs<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.kwargs.clone()))
    }
}

/// What to run: a registry key plus arguments.
///
/// This is the only form in which work crosses a process boundary. The
/// receiver resolves `func_name` against its own registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCommand {
    pub func_name: String,

    #[serde(flatten)]
    pub args: TaskArgs,
}

/// A unit of work plus its lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub command: TaskCommand,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
    pub worker_id: Option<String>,
}

impl Task {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        command: TaskCommand,
        config: TaskConfig,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            command,
            config,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            result: None,
            error: None,
            worker_id: None,
        }
    }

    pub fn func_name(&self) -> &str {
        &self.command.func_name
    }

    pub fn priority(&self) -> TaskPriority {
        self.config.priority
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Pending -> Running. `started_at` keeps the first attempt's time.
    pub fn start_attempt(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running)?;
        let created_at = self.created_at;
        self.started_at.get_or_insert(now.max(created_at));
        self.worker_id = Some(worker_id.to_string());
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        value: Value,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Success)?;
        self.result = Some(value);
        self.error = None;
        self.finish(now);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failure)?;
        self.error = Some(failure);
        self.finish(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Cancelled)?;
        self.error = Some(TaskFailure::cancelled());
        self.finish(now);
        Ok(())
    }

    /// Running -> Retry. The failure is kept so callers can see why.
    pub fn schedule_retry(&mut self, failure: TaskFailure) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Retry)?;
        self.retry_count += 1;
        self.error = Some(failure);
        Ok(())
    }

    /// Retry -> Pending.
    pub fn requeue(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Pending)
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        let floor = self.started_at.unwrap_or(self.created_at);
        self.completed_at.get_or_insert(now.max(floor));
    }

    pub fn to_result(&self) -> TaskResult {
        TaskResult {
            task_id: self.id,
            name: self.name.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            retry_count: self.retry_count,
            worker_id: self.worker_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}
