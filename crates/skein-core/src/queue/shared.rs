//! SharedQueueStore - 共有ストア上のキュー / 結果キャッシュ / ロック
//!
//! Key layout (all prefixed by the namespace):
//! - `<ns>:queue:<name>`  sorted set, score = priority value, member = JSON entry
//! - `<ns>:result:<id>`   TaskResult JSON with TTL
//! - `<ns>:lock:<id>`     owner worker id with TTL (SET NX EX)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{StoreError, Task, TaskId, TaskPriority, TaskResult};
use crate::ports::SharedBackend;

/// What actually sits in the sorted set.
#[derive(Debug, Serialize, Deserialize)]
struct QueueEntry {
    task: Task,
    priority: TaskPriority,
    enqueued_at: DateTime<Utc>,
}

/// Queue, result-cache and lock operations over a [`SharedBackend`].
#[derive(Clone)]
pub struct SharedQueueStore {
    backend: Arc<dyn SharedBackend>,
    namespace: String,
}

impl SharedQueueStore {
    pub fn new(backend: Arc<dyn SharedBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn queue_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue_name)
    }

    fn result_key(&self, task_id: TaskId) -> String {
        format!("{}:result:{}", self.namespace, task_id)
    }

    fn lock_key(&self, task_id: TaskId) -> String {
        format!("{}:lock:{}", self.namespace, task_id)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }

    /// Push a task; higher priority pops first.
    pub async fn enqueue(&self, task: &Task, queue_name: &str) -> Result<(), StoreError> {
        let entry = QueueEntry {
            task: task.clone(),
            priority: task.priority(),
            enqueued_at: Utc::now(),
        };
        let member = serde_json::to_string(&entry)?;
        self.backend
            .zadd(
                &self.queue_key(queue_name),
                f64::from(entry.priority.value()),
                member,
            )
            .await
    }

    /// Pop the top task, waiting up to `timeout`.
    ///
    /// An entry that does not decode is dropped (it has already left the set)
    /// and reported as `None`.
    pub async fn dequeue(
        &self,
        queue_name: &str,
        timeout: Duration,
    ) -> Result<Option<Task>, StoreError> {
        let key = self.queue_key(queue_name);
        let Some((member, _score)) = self.backend.bzpopmax(&key, timeout).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<QueueEntry>(&member) {
            Ok(entry) => Ok(Some(entry.task)),
            Err(err) => {
                warn!(queue = %queue_name, error = %err, "dropping undecodable queue entry");
                Ok(None)
            }
        }
    }

    pub async fn queue_len(&self, queue_name: &str) -> Result<usize, StoreError> {
        self.backend.zcard(&self.queue_key(queue_name)).await
    }

    /// Take the per-task lock. `false` means someone else holds it.
    pub async fn acquire_lock(
        &self,
        task_id: TaskId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.backend
            .set_nx_ex(&self.lock_key(task_id), owner.to_string(), ttl)
            .await
    }

    pub async fn release_lock(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.backend.del(&self.lock_key(task_id)).await
    }

    pub async fn set_result(&self, result: &TaskResult, ttl: Duration) -> Result<(), StoreError> {
        let value = serde_json::to_string(result)?;
        self.backend
            .setex(&self.result_key(result.task_id), ttl, value)
            .await
    }

    pub async fn get_result(&self, task_id: TaskId) -> Result<Option<TaskResult>, StoreError> {
        match self.backend.get(&self.result_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskArgs, TaskCommand, TaskConfig, TaskStatus};
    use crate::impls::InMemoryBackend;
    use serde_json::json;
    use ulid::Ulid;

    fn store() -> (Arc<InMemoryBackend>, SharedQueueStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = SharedQueueStore::new(backend.clone(), "test");
        (backend, store)
    }

    fn task(name: &str, priority: TaskPriority) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            name,
            TaskCommand {
                func_name: "echo".to_string(),
                args: TaskArgs::new().arg(name),
            },
            TaskConfig::default().with_priority(priority),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn highest_priority_pops_first() {
        let (_, store) = store();
        store.enqueue(&task("low", TaskPriority::Low), "q").await.unwrap();
        store.enqueue(&task("urgent", TaskPriority::Urgent), "q").await.unwrap();
        store.enqueue(&task("normal", TaskPriority::Normal), "q").await.unwrap();
        assert_eq!(store.queue_len("q").await.unwrap(), 3);

        let mut names = Vec::new();
        while let Some(t) = store.dequeue("q", Duration::ZERO).await.unwrap() {
            names.push(t.name);
        }
        assert_eq!(names, vec!["urgent", "normal", "low"]);
    }

    #[tokio::test]
    async fn task_survives_the_round_trip() {
        let (_, store) = store();
        let original = task("t", TaskPriority::High);
        store.enqueue(&original, "q").await.unwrap();

        let popped = store.dequeue("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped, original);
    }

    #[tokio::test]
    async fn keys_are_namespaced() {
        let (backend, store) = store();
        store.enqueue(&task("t", TaskPriority::Normal), "jobs").await.unwrap();
        assert_eq!(backend.zcard("test:queue:jobs").await.unwrap(), 1);
        assert_eq!(backend.zcard("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_entry_is_dropped() {
        let (backend, store) = store();
        backend
            .zadd("test:queue:q", 2.0, "not json".to_string())
            .await
            .unwrap();

        assert!(store.dequeue("q", Duration::ZERO).await.unwrap().is_none());
        assert_eq!(store.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let (_, store) = store();
        let id = TaskId::from_ulid(Ulid::new());
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_lock(id, "w1", ttl).await.unwrap());
        assert!(!store.acquire_lock(id, "w2", ttl).await.unwrap());
        store.release_lock(id).await.unwrap();
        assert!(store.acquire_lock(id, "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn result_cache_round_trip() {
        let (_, store) = store();
        let mut t = task("t", TaskPriority::Normal);
        t.start_attempt("w1", Utc::now()).unwrap();
        t.mark_succeeded(json!(42), Utc::now()).unwrap();

        assert!(store.get_result(t.id).await.unwrap().is_none());
        store
            .set_result(&t.to_result(), Duration::from_secs(60))
            .await
            .unwrap();

        let cached = store.get_result(t.id).await.unwrap().unwrap();
        assert_eq!(cached.status, TaskStatus::Success);
        assert_eq!(cached.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn offline_store_surfaces_unreachable() {
        let (backend, store) = store();
        backend.set_online(false);
        let err = store
            .enqueue(&task("t", TaskPriority::Normal), "q")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
    }
}
