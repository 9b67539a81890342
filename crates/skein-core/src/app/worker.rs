//! TaskWorker - タスク実行ループ
//!
//! # フロー
//! 1. source（ローカル queue / 共有ストア）から 1 件取る
//! 2. （分散）ロック取得 → 結果キャッシュ済みならスキップ
//! 3. ledger で claim（キュー待ち中に cancel 済みならスキップ）
//! 4. registry から handler を引き、timeout / cancel 付きで実行
//! 5. 失敗かつ retry 可能なら RETRY → 遅延後に再投入
//! 6. ledger 更新 →（分散）結果 publish → ロック解放
//!
//! インフラ障害はログ + backoff で処理し、ループは落としません。
//! backoff は連続失敗ごとに倍増し（上限 `max_error_backoff`）、dequeue 成功でリセット。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::domain::{
    ErrorKind, QueueError, StoreError, Task, TaskFailure, TaskId, TaskStatus,
};
use crate::ports::Clock;
use crate::queue::{PriorityTaskQueue, RetryPolicy, SharedQueueStore, TaskLedger};
use crate::typed::handler::panic_message;
use crate::typed::{HandlerError, TaskRegistry};

/// Where a worker takes tasks from (and puts retries back).
#[derive(Clone)]
pub enum TaskSource {
    Local(Arc<PriorityTaskQueue>),
    Shared {
        store: SharedQueueStore,
        queue_name: String,
    },
}

impl TaskSource {
    pub fn queue_name(&self) -> &str {
        match self {
            TaskSource::Local(queue) => queue.name(),
            TaskSource::Shared { queue_name, .. } => queue_name,
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, TaskSource::Shared { .. })
    }

    async fn next(
        &self,
        dequeue_timeout: Duration,
        stop: &CancellationToken,
    ) -> Result<Option<Task>, StoreError> {
        match self {
            TaskSource::Local(queue) => Ok(queue.get().await.ok()),
            TaskSource::Shared { store, queue_name } => {
                tokio::select! {
                    _ = stop.cancelled() => Ok(None),
                    popped = store.dequeue(queue_name, dequeue_timeout) => popped,
                }
            }
        }
    }

    /// Put a task back. The failure kind tells the caller how to record it.
    async fn requeue(&self, task: &Task) -> Result<(), TaskFailure> {
        match self {
            TaskSource::Local(queue) => queue.put(task.clone()).await.map_err(|err| match err {
                QueueError::Full { .. } => TaskFailure::new(ErrorKind::QueueFull, err.to_string()),
                QueueError::Empty { .. } => {
                    TaskFailure::new(ErrorKind::Infrastructure, err.to_string())
                }
            }),
            TaskSource::Shared { store, queue_name } => store
                .enqueue(task, queue_name)
                .await
                .map_err(|err| TaskFailure::new(ErrorKind::Infrastructure, err.to_string())),
        }
    }
}

/// Shared between the worker loop and whoever holds the [`WorkerHandle`].
#[derive(Debug)]
pub struct WorkerStats {
    running: AtomicBool,
    processed_count: AtomicU64,
    error_count: AtomicU64,
    current_task: Mutex<Option<TaskId>>,
    start_time: DateTime<Utc>,
}

impl WorkerStats {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            running: AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            current_task: Mutex::new(None),
            start_time,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_task(&self) -> Option<TaskId> {
        *self
            .current_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_current_task(&self, task_id: Option<TaskId>) {
        *self
            .current_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = task_id;
    }

    fn count_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Clears `current_task` when dropped, also when the attempt unwinds.
struct CurrentTaskGuard<'a> {
    stats: &'a WorkerStats,
}

impl<'a> CurrentTaskGuard<'a> {
    fn set(stats: &'a WorkerStats, task_id: TaskId) -> Self {
        stats.set_current_task(Some(task_id));
        Self { stats }
    }
}

impl Drop for CurrentTaskGuard<'_> {
    fn drop(&mut self) {
        self.stats.set_current_task(None);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatsView {
    pub worker_id: String,
    pub queue_name: String,
    pub distributed: bool,
    pub running: bool,
    pub processed_count: u64,
    pub error_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,

    pub start_time: DateTime<Utc>,
    pub uptime_secs: f64,
}

/// What one execution attempt ended with.
enum Attempt {
    Succeeded(Value),
    Failed(TaskFailure),
    Cancelled,
}

pub struct TaskWorker {
    worker_id: String,
    source: TaskSource,
    registry: Arc<TaskRegistry>,
    ledger: Arc<TaskLedger>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    stop: CancellationToken,
    backoff: RetryPolicy,
    error_streak: AtomicU32,
}

impl TaskWorker {
    pub fn new(
        worker_id: impl Into<String>,
        source: TaskSource,
        registry: Arc<TaskRegistry>,
        ledger: Arc<TaskLedger>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let stats = Arc::new(WorkerStats::new(clock.now()));
        let backoff = RetryPolicy::exponential(
            config.error_backoff(),
            2.0,
            config.max_error_backoff().max(config.error_backoff()),
        );
        Self {
            worker_id: worker_id.into(),
            source,
            registry,
            ledger,
            clock,
            config,
            stats,
            stop: CancellationToken::new(),
            backoff,
            error_streak: AtomicU32::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Start the loop on the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let handle = WorkerHandle {
            worker_id: self.worker_id.clone(),
            queue_name: self.source.queue_name().to_string(),
            distributed: self.source.is_distributed(),
            stats: Arc::clone(&self.stats),
            stop: self.stop.clone(),
            join: Mutex::new(None),
        };
        // Flag before spawning so health checks right after start see it.
        self.stats.running.store(true, Ordering::SeqCst);
        let join = tokio::spawn(self.run());
        *handle.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
        handle
    }

    /// Loop until stopped. The current task always finishes first.
    pub async fn run(self) {
        self.stats.running.store(true, Ordering::SeqCst);
        info!(
            worker_id = %self.worker_id,
            queue = %self.source.queue_name(),
            distributed = self.source.is_distributed(),
            "worker started"
        );

        while !self.stop.is_cancelled() {
            match self
                .source
                .next(self.config.dequeue_timeout(), &self.stop)
                .await
            {
                Ok(Some(task)) => {
                    self.error_streak.store(0, Ordering::Relaxed);
                    self.handle(task).await;
                }
                Ok(None) => {
                    self.error_streak.store(0, Ordering::Relaxed);
                    // The shared source already waited inside the blocking pop.
                    if !self.source.is_distributed() {
                        self.pause(self.config.poll_interval()).await;
                    }
                }
                Err(err) => {
                    error!(worker_id = %self.worker_id, error = %err, "dequeue failed");
                    self.stats.count_error();
                    self.back_off().await;
                }
            }
        }

        self.stats.running.store(false, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Delay before the next attempt after `streak` consecutive errors.
    fn error_delay(&self, streak: u32) -> Duration {
        self.backoff.next_delay(streak)
    }

    async fn back_off(&self) {
        let streak = self.error_streak.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.error_delay(streak);
        debug!(worker_id = %self.worker_id, streak, delay_ms = delay.as_millis() as u64, "backing off");
        self.pause(delay).await;
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn handle(&self, task: Task) {
        match &self.source {
            TaskSource::Local(_) => {
                self.process(task).await;
            }
            TaskSource::Shared { store, .. } => self.handle_distributed(store, task).await,
        }
    }

    /// lock -> (skip if already done) -> execute -> publish -> release
    async fn handle_distributed(&self, store: &SharedQueueStore, task: Task) {
        let task_id = task.id;
        match store
            .acquire_lock(task_id, &self.worker_id, self.config.lock_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker_id = %self.worker_id, task_id = %task_id, "lock held elsewhere, skipping");
                return;
            }
            Err(err) => {
                error!(worker_id = %self.worker_id, task_id = %task_id, error = %err, "lock acquisition failed");
                self.stats.count_error();
                self.back_off().await;
                return;
            }
        }

        match store.get_result(task_id).await {
            Ok(Some(_)) => {
                debug!(worker_id = %self.worker_id, task_id = %task_id, "result already published, skipping");
            }
            Ok(None) => {
                if let Some(done) = self.process(task).await {
                    if let Err(err) = store
                        .set_result(&done.to_result(), self.config.result_ttl())
                        .await
                    {
                        error!(worker_id = %self.worker_id, task_id = %task_id, error = %err, "result publish failed");
                        self.stats.count_error();
                    }
                }
            }
            Err(err) => {
                error!(worker_id = %self.worker_id, task_id = %task_id, error = %err, "result lookup failed");
                self.stats.count_error();
            }
        }

        if let Err(err) = store.release_lock(task_id).await {
            warn!(worker_id = %self.worker_id, task_id = %task_id, error = %err, "lock release failed");
        }
    }

    /// Run one attempt. Returns the task when it reached a terminal status.
    async fn process(&self, mut task: Task) -> Option<Task> {
        if let Err(err) = task.start_attempt(&self.worker_id, self.clock.now()) {
            warn!(worker_id = %self.worker_id, error = %err, "dequeued task is not runnable");
            self.stats.count_error();
            return None;
        }

        let cancel = CancellationToken::new();
        if !self.ledger.begin_attempt(&task, cancel.clone()) {
            debug!(worker_id = %self.worker_id, task_id = %task.id, "task cancelled while queued, skipping");
            return None;
        }

        let _current = CurrentTaskGuard::set(&self.stats, task.id);
        debug!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            func = %task.func_name(),
            attempt = task.retry_count + 1,
            "task started"
        );

        let attempt = self.execute(&task, &cancel).await;
        let now = self.clock.now();

        let applied = match attempt {
            Attempt::Succeeded(value) => task.mark_succeeded(value, now),
            Attempt::Cancelled => task.mark_cancelled(now),
            Attempt::Failed(failure)
                if failure.kind.is_retryable() && task.retry_count < task.config.max_retries =>
            {
                match task.schedule_retry(failure) {
                    Ok(()) => {
                        self.stats.count_error();
                        self.ledger.update(&task);
                        self.schedule_requeue(task);
                        return None;
                    }
                    Err(err) => Err(err),
                }
            }
            Attempt::Failed(failure) => task.mark_failed(failure, now),
        };
        if let Err(err) = applied {
            warn!(worker_id = %self.worker_id, error = %err, "could not record task outcome");
            self.stats.count_error();
            return None;
        }

        self.stats.processed_count.fetch_add(1, Ordering::Relaxed);
        match task.status {
            TaskStatus::Success => {
                debug!(worker_id = %self.worker_id, task_id = %task.id, "task succeeded");
            }
            status => {
                self.stats.count_error();
                let reason = task.error.as_ref().map(ToString::to_string).unwrap_or_default();
                warn!(worker_id = %self.worker_id, task_id = %task.id, %status, %reason, "task did not succeed");
            }
        }

        self.ledger.update(&task);
        Some(task)
    }

    /// Execute the handler on its own task, bounded by the timeout and the
    /// cancel token. Either way out aborts the handler.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Attempt {
        let Some(handler) = self.registry.get(task.func_name()) else {
            return Attempt::Failed(TaskFailure::unregistered(task.func_name()));
        };

        let args = task.command.args.clone();
        let running = tokio::spawn(async move { handler.invoke(args).await });
        let abort = running.abort_handle();
        let timeout = task.config.timeout;

        tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                Attempt::Cancelled
            }
            finished = tokio::time::timeout(timeout, running) => match finished {
                Err(_elapsed) => {
                    abort.abort();
                    Attempt::Failed(TaskFailure::timeout(timeout))
                }
                Ok(Ok(Ok(value))) => Attempt::Succeeded(value),
                Ok(Ok(Err(HandlerError(message)))) => {
                    Attempt::Failed(TaskFailure::execution(message))
                }
                Ok(Err(join)) if join.is_panic() => Attempt::Failed(TaskFailure::execution(
                    format!("handler panicked: {}", panic_message(join.into_panic())),
                )),
                Ok(Err(join)) => Attempt::Failed(TaskFailure::execution(join.to_string())),
            }
        }
    }

    /// RETRY -> (delay) -> PENDING -> back into the source.
    fn schedule_requeue(&self, mut task: Task) {
        let delay = RetryPolicy::for_task(&task.config).next_delay(task.retry_count);
        let source = self.source.clone();
        let ledger = Arc::clone(&self.ledger);
        let clock = Arc::clone(&self.clock);
        info!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            retry = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "task scheduled for retry"
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if ledger.status(task.id) == Some(TaskStatus::Cancelled) {
                debug!(task_id = %task.id, "retry dropped, task was cancelled");
                return;
            }
            if task.requeue().is_err() {
                return;
            }
            ledger.update(&task);

            if let Err(failure) = source.requeue(&task).await {
                error!(task_id = %task.id, error = %failure, "retry could not be re-queued");
                if task.mark_failed(failure, clock.now()).is_ok() {
                    ledger.update(&task);
                }
            }
        });
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle {
    worker_id: String,
    queue_name: String,
    distributed: bool,
    stats: Arc<WorkerStats>,
    stop: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.stats.is_running()
    }

    /// Ask the loop to exit after its current task.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait for the loop to exit.
    pub async fn stop_and_join(&self) {
        self.stop();
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                error!(worker_id = %self.worker_id, error = %err, "worker loop ended abnormally");
            }
        }
        self.stats.running.store(false, Ordering::SeqCst);
    }

    pub fn view(&self, now: DateTime<Utc>) -> WorkerStatsView {
        let uptime = (now - self.stats.start_time)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        WorkerStatsView {
            worker_id: self.worker_id.clone(),
            queue_name: self.queue_name.clone(),
            distributed: self.distributed,
            running: self.stats.is_running(),
            processed_count: self.stats.processed_count.load(Ordering::Relaxed),
            error_count: self.stats.error_count.load(Ordering::Relaxed),
            current_task: self.stats.current_task(),
            start_time: self.stats.start_time,
            uptime_secs: uptime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskArgs, TaskCommand, TaskConfig, TaskPriority};
    use crate::impls::InMemoryBackend;
    use crate::ports::SystemClock;
    use crate::typed::FnHandler;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use ulid::Ulid;

    struct Fixture {
        queue: Arc<PriorityTaskQueue>,
        registry: Arc<TaskRegistry>,
        ledger: Arc<TaskLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(PriorityTaskQueue::new("default", 0)),
                registry: Arc::new(TaskRegistry::new()),
                ledger: Arc::new(TaskLedger::new()),
            }
        }

        fn config() -> WorkerConfig {
            WorkerConfig {
                poll_interval_ms: 5,
                error_backoff_ms: 5,
                dequeue_timeout_ms: 20,
                ..WorkerConfig::default()
            }
        }

        fn worker(&self, id: &str, source: TaskSource) -> TaskWorker {
            self.worker_with(id, source, Self::config())
        }

        fn worker_with(&self, id: &str, source: TaskSource, config: WorkerConfig) -> TaskWorker {
            TaskWorker::new(
                id,
                source,
                Arc::clone(&self.registry),
                Arc::clone(&self.ledger),
                Arc::new(SystemClock),
                config,
            )
        }

        fn local_worker(&self, id: &str) -> TaskWorker {
            self.worker(id, TaskSource::Local(Arc::clone(&self.queue)))
        }

        async fn submit(&self, func: &str, config: TaskConfig) -> TaskId {
            let task = task(func, config);
            let id = task.id;
            self.ledger.insert(task.clone(), false);
            self.queue.put(task).await.unwrap();
            id
        }

        async fn wait_terminal(&self, id: TaskId) -> crate::domain::TaskResult {
            for _ in 0..500 {
                if let Some(result) = self.ledger.get(id).filter(|r| r.is_terminal()) {
                    return result;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task {id} did not finish");
        }
    }

    fn task(func: &str, config: TaskConfig) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            func,
            TaskCommand {
                func_name: func.to_string(),
                args: TaskArgs::new().arg(42),
            },
            config,
            Utc::now(),
        )
    }

    fn register_echo(registry: &TaskRegistry) {
        registry
            .register(
                "echo",
                Arc::new(FnHandler::new(|args: TaskArgs| async move {
                    Ok::<_, HandlerError>(args.positional(0).cloned().unwrap_or(Value::Null))
                })),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn runs_registered_handler() {
        let fx = Fixture::new();
        register_echo(&fx.registry);
        let id = fx.submit("echo", TaskConfig::default()).await;

        let handle = fx.local_worker("w1").spawn();
        let result = fx.wait_terminal(id).await;
        handle.stop_and_join().await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.result, Some(json!(42)));
        assert_eq!(result.worker_id.as_deref(), Some("w1"));
        assert!(result.started_at.is_some() && result.completed_at >= result.started_at);

        let view = handle.view(Utc::now());
        assert!(!view.running);
        assert_eq!(view.processed_count, 1);
        assert_eq!(view.current_task, None);
    }

    #[tokio::test]
    async fn unregistered_function_fails_without_retry() {
        let fx = Fixture::new();
        let config = TaskConfig::default().with_retries(3, Duration::from_millis(1));
        let id = fx.submit("nope", config).await;

        let handle = fx.local_worker("w1").spawn();
        let result = fx.wait_terminal(id).await;
        handle.stop_and_join().await;

        assert_eq!(result.status, TaskStatus::Failure);
        assert_eq!(result.error.unwrap().kind, ErrorKind::UnregisteredFunction);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn handler_panic_is_an_execution_failure() {
        let fx = Fixture::new();
        fx.registry
            .register(
                "explode",
                Arc::new(FnHandler::new(|_args: TaskArgs| async {
                    if true {
                        panic!("kaboom");
                    }
                    Ok::<_, HandlerError>(Value::Null)
                })),
            )
            .unwrap();
        let id = fx.submit("explode", TaskConfig::default()).await;

        let handle = fx.local_worker("w1").spawn();
        let result = fx.wait_terminal(id).await;
        handle.stop_and_join().await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Execution);
        assert!(error.message.contains("kaboom"));
        assert!(handle.view(Utc::now()).error_count >= 1);
    }

    #[tokio::test]
    async fn timeout_aborts_the_handler() {
        let fx = Fixture::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        fx.registry
            .register(
                "slow",
                Arc::new(FnHandler::new(move |_args: TaskArgs| {
                    let flag = Arc::clone(&flag);
                    async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                })),
            )
            .unwrap();
        let config = TaskConfig::default().with_timeout(Duration::from_millis(50));
        let id = fx.submit("slow", config).await;

        let handle = fx.local_worker("w1").spawn();
        let result = fx.wait_terminal(id).await;
        handle.stop_and_join().await;

        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        let run = result.run_time().unwrap().to_std().unwrap();
        assert!(run < Duration::from_millis(400), "took {run:?}");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        fx.registry
            .register(
                "flaky",
                Arc::new(FnHandler::new(move |_args: TaskArgs| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(HandlerError::new("not yet"))
                        } else {
                            Ok(json!("done"))
                        }
                    }
                })),
            )
            .unwrap();
        let config = TaskConfig::default().with_retries(2, Duration::from_millis(10));
        let id = fx.submit("flaky", config).await;

        let handle = fx.local_worker("w1").spawn();
        let result = fx.wait_terminal(id).await;
        handle.stop_and_join().await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let fx = Fixture::new();
        fx.registry
            .register(
                "broken",
                Arc::new(FnHandler::new(|_args: TaskArgs| async {
                    Err::<Value, _>(HandlerError::new("always"))
                })),
            )
            .unwrap();
        let config = TaskConfig::default().with_retries(1, Duration::from_millis(5));
        let id = fx.submit("broken", config).await;

        let handle = fx.local_worker("w1").spawn();
        let result = fx.wait_terminal(id).await;
        handle.stop_and_join().await;

        assert_eq!(result.status, TaskStatus::Failure);
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.error.unwrap().message, "always");
    }

    #[tokio::test]
    async fn cancelled_while_queued_is_skipped() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        fx.registry
            .register(
                "count",
                Arc::new(FnHandler::new(move |_args: TaskArgs| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                })),
            )
            .unwrap();
        let id = fx.submit("count", TaskConfig::default()).await;
        fx.ledger.cancel(id, Utc::now()).unwrap();

        let handle = fx.local_worker("w1").spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop_and_join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.ledger.status(id), Some(TaskStatus::Cancelled));
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn cancelled_during_retry_delay_is_not_requeued() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        fx.registry
            .register(
                "always_fails",
                Arc::new(FnHandler::new(move |_args: TaskArgs| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(HandlerError::new("nope"))
                    }
                })),
            )
            .unwrap();
        let config = TaskConfig::default().with_retries(1, Duration::from_millis(200));
        let id = fx.submit("always_fails", config).await;

        let handle = fx.local_worker("w1").spawn();
        for _ in 0..100 {
            if fx.ledger.status(id) == Some(TaskStatus::Retry) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.ledger.status(id), Some(TaskStatus::Retry));
        fx.ledger.cancel(id, Utc::now()).unwrap();

        // Past the retry delay: the requeue must have been dropped.
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.stop_and_join().await;

        assert_eq!(fx.ledger.status(id), Some(TaskStatus::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn serves_high_priority_first() {
        let fx = Fixture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        fx.registry
            .register(
                "record",
                Arc::new(FnHandler::new(move |args: TaskArgs| {
                    let seen = Arc::clone(&seen);
                    async move {
                        let label = args.named("label").cloned().unwrap_or(Value::Null);
                        seen.lock().unwrap().push(label);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                })),
            )
            .unwrap();

        let mut ids = Vec::new();
        for (label, priority) in [
            ("low", TaskPriority::Low),
            ("normal", TaskPriority::Normal),
            ("high", TaskPriority::High),
        ] {
            let mut t = task("record", TaskConfig::default().with_priority(priority));
            t.command.args = TaskArgs::new().kwarg("label", label);
            ids.push(t.id);
            fx.ledger.insert(t.clone(), false);
            fx.queue.put(t).await.unwrap();
        }

        let handle = fx.local_worker("w1").spawn();
        for id in &ids {
            fx.wait_terminal(*id).await;
        }
        handle.stop_and_join().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![json!("high"), json!("normal"), json!("low")]
        );
    }

    #[tokio::test]
    async fn distributed_worker_publishes_result_and_releases_lock() {
        let fx = Fixture::new();
        register_echo(&fx.registry);
        let backend = Arc::new(InMemoryBackend::new());
        let store = SharedQueueStore::new(backend, "test");

        let t = task("echo", TaskConfig::default());
        let id = t.id;
        store.enqueue(&t, "jobs").await.unwrap();

        let handle = fx
            .worker(
                "w1",
                TaskSource::Shared {
                    store: store.clone(),
                    queue_name: "jobs".to_string(),
                },
            )
            .spawn();

        let mut published = None;
        for _ in 0..200 {
            published = store.get_result(id).await.unwrap();
            if published.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop_and_join().await;

        let published = published.expect("result published");
        assert_eq!(published.status, TaskStatus::Success);
        assert_eq!(published.result, Some(json!(42)));
        assert!(
            store
                .acquire_lock(id, "someone-else", Duration::from_secs(1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn store_outage_is_backed_off_not_fatal() {
        let fx = Fixture::new();
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_online(false);
        let store = SharedQueueStore::new(backend.clone(), "test");

        let handle = fx
            .worker(
                "w1",
                TaskSource::Shared {
                    store,
                    queue_name: "jobs".to_string(),
                },
            )
            .spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let view = handle.view(Utc::now());
        assert!(view.running);
        assert!(view.error_count >= 1);
        handle.stop_and_join().await;
    }

    #[test]
    fn error_backoff_doubles_up_to_the_cap() {
        let fx = Fixture::new();
        let config = WorkerConfig {
            error_backoff_ms: 100,
            max_error_backoff_ms: 1_000,
            ..WorkerConfig::default()
        };
        let worker = fx.worker_with("w1", TaskSource::Local(Arc::clone(&fx.queue)), config);

        let delays: Vec<u64> = (1..=6)
            .map(|streak| worker.error_delay(streak).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[tokio::test]
    async fn consecutive_store_errors_back_off_and_reset_after_recovery() {
        let fx = Fixture::new();
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_online(false);
        let store = SharedQueueStore::new(backend.clone(), "test");
        let handle = fx
            .worker(
                "w1",
                TaskSource::Shared {
                    store,
                    queue_name: "jobs".to_string(),
                },
            )
            .spawn();

        // 5, 10, 20, 40, 80, 160 ms: a flat 5 ms would give ~60 errors here.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let during_outage = handle.view(Utc::now()).error_count;
        assert!((3..=10).contains(&during_outage), "{during_outage} errors");

        // Let the pending backoff elapse and a pop succeed.
        backend.set_online(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let recovered = handle.view(Utc::now()).error_count;

        // Back to the base delay: several errors in a short window.
        backend.set_online(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let after = handle.view(Utc::now()).error_count;
        handle.stop_and_join().await;

        assert!(after - recovered >= 2, "{} errors after reset", after - recovered);
    }
}
