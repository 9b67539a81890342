//! In-process priority queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::Mutex;

use crate::domain::{QueueError, Task, TaskPriority};

/// Heap entry.
///
/// Canonical tie-break rule: higher priority first, then lower insertion
/// sequence first (FIFO among equals). `BinaryHeap` is a max-heap, so the
/// "greatest" entry is the one served next.
#[derive(Debug)]
struct QueuedTask {
    priority: TaskPriority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

/// Priority-ordered, FIFO-within-priority queue of pending tasks.
///
/// `put`/`get` are O(log n) and never wait: a full queue fails `put`, an
/// empty one fails `get`, and callers poll.
pub struct PriorityTaskQueue {
    name: String,
    /// 0 = unbounded.
    maxsize: usize,
    state: Mutex<QueueState>,
}

impl PriorityTaskQueue {
    pub fn new(name: impl Into<String>, maxsize: usize) -> Self {
        Self {
            name: name.into(),
            maxsize,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    /// Insert a task. Fails with [`QueueError::Full`] when bounded and full.
    pub async fn put(&self, task: Task) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if self.maxsize > 0 && state.heap.len() >= self.maxsize {
            return Err(QueueError::Full {
                queue: self.name.clone(),
                maxsize: self.maxsize,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedTask {
            priority: task.priority(),
            seq,
            task,
        });
        Ok(())
    }

    /// Remove the next task. Fails with [`QueueError::Empty`] when empty.
    pub async fn get(&self) -> Result<Task, QueueError> {
        let mut state = self.state.lock().await;
        state
            .heap
            .pop()
            .map(|entry| entry.task)
            .ok_or_else(|| QueueError::Empty {
                queue: self.name.clone(),
            })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskArgs, TaskCommand, TaskConfig, TaskId};
    use chrono::Utc;
    use rstest::rstest;
    use std::sync::Arc;
    use ulid::Ulid;

    fn task(name: &str, priority: TaskPriority) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            name,
            TaskCommand {
                func_name: "noop".to_string(),
                args: TaskArgs::new(),
            },
            TaskConfig::default().with_priority(priority),
            Utc::now(),
        )
    }

    async fn drain(queue: &PriorityTaskQueue) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(t) = queue.get().await {
            names.push(t.name);
        }
        names
    }

    #[rstest]
    #[case(&[("low", TaskPriority::Low), ("high", TaskPriority::High), ("normal", TaskPriority::Normal)],
           &["high", "normal", "low"])]
    #[case(&[("a", TaskPriority::Normal), ("b", TaskPriority::Normal), ("c", TaskPriority::Normal)],
           &["a", "b", "c"])]
    #[case(&[("n1", TaskPriority::Normal), ("u", TaskPriority::Urgent), ("n2", TaskPriority::Normal), ("l", TaskPriority::Low)],
           &["u", "n1", "n2", "l"])]
    #[tokio::test]
    async fn serves_by_priority_then_fifo(
        #[case] input: &[(&str, TaskPriority)],
        #[case] expected: &[&str],
    ) {
        let queue = PriorityTaskQueue::new("default", 0);
        for (name, priority) in input {
            queue.put(task(name, *priority)).await.unwrap();
        }
        assert_eq!(drain(&queue).await, expected);
    }

    #[tokio::test]
    async fn get_on_empty_queue_fails() {
        let queue = PriorityTaskQueue::new("default", 0);
        assert!(queue.is_empty().await);
        assert_eq!(
            queue.get().await.unwrap_err(),
            QueueError::Empty {
                queue: "default".to_string()
            }
        );
    }

    #[tokio::test]
    async fn bounded_queue_rejects_when_full() {
        let queue = PriorityTaskQueue::new("small", 2);
        queue.put(task("a", TaskPriority::Low)).await.unwrap();
        queue.put(task("b", TaskPriority::Low)).await.unwrap();

        let err = queue.put(task("c", TaskPriority::Urgent)).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { maxsize: 2, .. }));
        assert_eq!(queue.len().await, 2);

        queue.get().await.unwrap();
        queue.put(task("c", TaskPriority::Urgent)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_puts_keep_every_task() {
        let queue = Arc::new(PriorityTaskQueue::new("default", 0));
        let mut joins = Vec::new();
        for i in 0..50 {
            let queue = Arc::clone(&queue);
            joins.push(tokio::spawn(async move {
                queue
                    .put(task(&format!("t{i}"), TaskPriority::Normal))
                    .await
                    .unwrap();
            }));
        }
        for j in joins {
            j.await.unwrap();
        }
        assert_eq!(queue.len().await, 50);
    }
}
