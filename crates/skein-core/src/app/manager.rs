//! TaskQueueManager - タスクキューの facade
//!
//! registry・ローカル queue・worker・ledger・workflow をプロセス内で所有します。
//! グローバルな singleton は持たず、必要な数だけ構築します。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::status::{HealthReport, HealthStatus, ManagerStats};
use super::worker::{TaskSource, TaskWorker, WorkerHandle};
use crate::config::ManagerConfig;
use crate::domain::{
    ErrorKind, SkeinError, Task, TaskArgs, TaskCommand, TaskConfig, TaskFailure, TaskId,
    TaskResult, WorkflowError, WorkflowId,
};
use crate::ports::{Clock, IdGenerator};
use crate::queue::{PriorityTaskQueue, SharedQueueStore, TaskLedger};
use crate::typed::{
    BlockingFnHandler, FnHandler, Handler, HandlerError, TaskHandler, TaskRegistry, TypedTask,
};
use crate::workflow::{SharedWorkflow, Workflow, WorkflowStatusView, WorkflowStep, run_workflow};

/// What to run and how.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub name: String,
    pub func_name: String,
    pub args: TaskArgs,

    /// `None` takes the manager's `default_task`.
    pub config: Option<TaskConfig>,
    pub use_distributed: bool,
}

impl TaskRequest {
    /// Request for `func_name`; the task is named after the function.
    pub fn new(func_name: impl Into<String>) -> Self {
        let func_name = func_name.into();
        Self {
            name: func_name.clone(),
            func_name,
            args: TaskArgs::new(),
            config: None,
            use_distributed: false,
        }
    }

    /// Request for a typed task; arguments come from `task`.
    pub fn typed<T: TypedTask>(task: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(T::NAME).with_args(task.to_args()?))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args = self.args.arg(value);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args = self.args.kwarg(name, value);
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn distributed(mut self) -> Self {
        self.use_distributed = true;
        self
    }
}

pub struct TaskQueueManager {
    config: ManagerConfig,
    registry: Arc<TaskRegistry>,
    ledger: Arc<TaskLedger>,
    store: Option<SharedQueueStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    blocking_permits: Arc<Semaphore>,
    queues: Mutex<HashMap<String, Arc<PriorityTaskQueue>>>,
    workers: Mutex<HashMap<String, Arc<WorkerHandle>>>,
    workflows: Mutex<HashMap<WorkflowId, SharedWorkflow>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskQueueManager {
    /// Use [`ManagerBuilder`](super::ManagerBuilder) unless every part is at hand.
    pub fn new(
        config: ManagerConfig,
        registry: Arc<TaskRegistry>,
        store: Option<SharedQueueStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let blocking_permits = Arc::new(Semaphore::new(config.worker.blocking_pool_size));
        Self {
            config,
            registry,
            ledger: Arc::new(TaskLedger::new()),
            store,
            clock,
            ids,
            blocking_permits,
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            workflows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn shared_store(&self) -> Option<&SharedQueueStore> {
        self.store.as_ref()
    }

    // ── registration ───────────────────────────────────────────────────────

    pub fn register_task(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), SkeinError> {
        Ok(self.registry.register(name, handler)?)
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), SkeinError>
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_task(name, Arc::new(FnHandler::new(f)))
    }

    /// Register a synchronous closure; it runs on the blocking pool.
    pub fn register_blocking<F>(&self, name: impl Into<String>, f: F) -> Result<(), SkeinError>
    where
        F: Fn(TaskArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let handler = BlockingFnHandler::new(f, Arc::clone(&self.blocking_permits));
        self.register_task(name, Arc::new(handler))
    }

    pub fn register_typed<T, H>(&self, handler: H) -> Result<(), SkeinError>
    where
        T: TypedTask,
        H: Handler<T> + 'static,
    {
        Ok(self.registry.register_typed::<T, H>(handler)?)
    }

    // ── queues & tasks ─────────────────────────────────────────────────────

    /// Get or create a local queue. `maxsize` only applies on creation.
    pub fn create_queue(&self, name: &str, maxsize: usize) -> Arc<PriorityTaskQueue> {
        let mut queues = locked(&self.queues);
        if let Some(queue) = queues.get(name) {
            return Arc::clone(queue);
        }
        debug!(queue = %name, maxsize, "queue created");
        let queue = Arc::new(PriorityTaskQueue::new(name, maxsize));
        queues.insert(name.to_string(), Arc::clone(&queue));
        queue
    }

    /// Submit a task. Never fails: a task that cannot be enqueued is recorded
    /// as FAILURE (`QUEUE_FULL` / `INFRASTRUCTURE`).
    pub async fn submit_task(&self, request: TaskRequest) -> TaskId {
        let task_id = self.ids.generate_task_id();
        let config = request
            .config
            .unwrap_or_else(|| self.config.default_task.clone());
        let queue_name = config.queue_name.clone();
        let mut task = Task::new(
            task_id,
            request.name,
            TaskCommand {
                func_name: request.func_name,
                args: request.args,
            },
            config,
            self.clock.now(),
        );

        let store = match (&self.store, request.use_distributed) {
            (Some(store), true) => Some(store),
            (None, true) => {
                warn!(task_id = %task_id, "no shared store configured, submitting locally");
                None
            }
            (_, false) => None,
        };
        self.ledger.insert(task.clone(), store.is_some());

        let enqueued = match store {
            Some(store) => store
                .enqueue(&task, &queue_name)
                .await
                .map_err(|err| TaskFailure::new(ErrorKind::Infrastructure, err.to_string())),
            None => self
                .create_queue(&queue_name, 0)
                .put(task.clone())
                .await
                .map_err(|err| TaskFailure::new(ErrorKind::QueueFull, err.to_string())),
        };

        match enqueued {
            Ok(()) => {
                info!(
                    task_id = %task_id,
                    name = %task.name,
                    func = %task.func_name(),
                    queue = %queue_name,
                    priority = ?task.priority(),
                    distributed = store.is_some(),
                    "task submitted"
                );
            }
            Err(failure) => {
                warn!(task_id = %task_id, queue = %queue_name, error = %failure, "task could not be enqueued");
                if task.mark_failed(failure, self.clock.now()).is_ok() {
                    self.ledger.update(&task);
                }
            }
        }
        task_id
    }

    /// Poll until the task is terminal or `timeout` passes, then return the
    /// latest snapshot (terminal or not).
    pub async fn get_task_result(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<TaskResult, SkeinError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.lookup_result(task_id).await?;
            let now = Instant::now();
            if current.is_terminal() || now >= deadline {
                return Ok(current);
            }
            let step = self.config.result_poll_interval().min(deadline - now);
            tokio::time::sleep(step).await;
        }
    }

    async fn lookup_result(&self, task_id: TaskId) -> Result<TaskResult, SkeinError> {
        let local = self.ledger.get(task_id);
        let check_store = match &local {
            Some(result) => {
                !result.is_terminal() && self.ledger.is_distributed(task_id) == Some(true)
            }
            // A peer's task may still be in the shared result cache.
            None => true,
        };

        if check_store {
            if let Some(store) = &self.store {
                match store.get_result(task_id).await {
                    Ok(Some(published)) => {
                        self.ledger.absorb_result(&published);
                        return Ok(published);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "result cache lookup failed");
                    }
                }
            }
        }
        local.ok_or(SkeinError::TaskNotFound(task_id))
    }

    /// Cancel a local task that is queued, waiting for a retry, or running.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<TaskResult, SkeinError> {
        let result = self.ledger.cancel(task_id, self.clock.now())?;
        info!(task_id = %task_id, "task cancelled");
        Ok(result)
    }

    // ── workers ────────────────────────────────────────────────────────────

    pub fn start_worker(
        &self,
        worker_id: impl Into<String>,
        queue_name: &str,
        use_distributed: bool,
    ) -> Result<(), SkeinError> {
        let worker_id = worker_id.into();
        let mut workers = locked(&self.workers);
        if workers.contains_key(&worker_id) {
            return Err(SkeinError::DuplicateWorker(worker_id));
        }

        let source = match (&self.store, use_distributed) {
            (Some(store), true) => TaskSource::Shared {
                store: store.clone(),
                queue_name: queue_name.to_string(),
            },
            (None, true) => {
                warn!(worker_id = %worker_id, "no shared store configured, worker polls the local queue");
                TaskSource::Local(self.create_queue(queue_name, 0))
            }
            (_, false) => TaskSource::Local(self.create_queue(queue_name, 0)),
        };

        let worker = TaskWorker::new(
            worker_id.clone(),
            source,
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            Arc::clone(&self.clock),
            self.config.worker.clone(),
        );
        workers.insert(worker_id, Arc::new(worker.spawn()));
        Ok(())
    }

    /// Stop a worker. Returns once its loop has exited (after its current
    /// task, if any).
    pub async fn stop_worker(&self, worker_id: &str) -> Result<(), SkeinError> {
        let handle = locked(&self.workers)
            .remove(worker_id)
            .ok_or_else(|| SkeinError::WorkerNotFound(worker_id.to_string()))?;
        handle.stop_and_join().await;
        info!(worker_id = %worker_id, "worker removed");
        Ok(())
    }

    /// Stop every worker and wait for all of them.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<WorkerHandle>> = locked(&self.workers)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.stop();
        }
        futures::future::join_all(handles.iter().map(|h| h.stop_and_join())).await;
        info!(workers = handles.len(), "task queue manager shut down");
    }

    // ── workflows ──────────────────────────────────────────────────────────

    /// Build a validated workflow with an id from this manager.
    pub fn new_workflow(
        &self,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Workflow, WorkflowError> {
        Workflow::new(
            self.ids.generate_workflow_id(),
            name,
            steps,
            self.clock.now(),
        )
    }

    /// A workflow step that runs the registered handler `func_name`.
    pub fn workflow_step(
        &self,
        step_name: impl Into<String>,
        func_name: &str,
    ) -> Result<WorkflowStep, SkeinError> {
        let handler = self
            .registry
            .get(func_name)
            .ok_or_else(|| SkeinError::UnknownFunction(func_name.to_string()))?;
        Ok(WorkflowStep::new(step_name, handler))
    }

    /// Store the workflow and run it in the background.
    pub fn submit_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id();
        info!(workflow = %id, name = %workflow.name(), "workflow submitted");
        let shared: SharedWorkflow = Arc::new(tokio::sync::Mutex::new(workflow));
        locked(&self.workflows).insert(id, Arc::clone(&shared));
        tokio::spawn(run_workflow(shared, Arc::clone(&self.clock)));
        id
    }

    fn workflow(&self, id: WorkflowId) -> Result<SharedWorkflow, SkeinError> {
        locked(&self.workflows)
            .get(&id)
            .cloned()
            .ok_or(SkeinError::WorkflowNotFound(id))
    }

    pub async fn get_workflow_status(
        &self,
        id: WorkflowId,
    ) -> Result<WorkflowStatusView, SkeinError> {
        let workflow = self.workflow(id)?;
        let view = workflow.lock().await.view();
        Ok(view)
    }

    /// Poll until the workflow is terminal or `timeout` passes.
    pub async fn wait_for_workflow(
        &self,
        id: WorkflowId,
        timeout: Duration,
    ) -> Result<WorkflowStatusView, SkeinError> {
        let workflow = self.workflow(id)?;
        let deadline = Instant::now() + timeout;
        loop {
            let view = workflow.lock().await.view();
            let now = Instant::now();
            if view.status.is_terminal() || now >= deadline {
                return Ok(view);
            }
            let step = self.config.result_poll_interval().min(deadline - now);
            tokio::time::sleep(step).await;
        }
    }

    // ── health & stats ─────────────────────────────────────────────────────

    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::healthy();

        if let Some(store) = &self.store {
            match store.ping().await {
                Ok(()) => {
                    report
                        .components
                        .insert("distributed_queue".into(), "healthy".into());
                }
                Err(err) => {
                    report
                        .components
                        .insert("distributed_queue".into(), "unhealthy".into());
                    report.degrade(
                        HealthStatus::Unhealthy,
                        format!("shared store unreachable: {err}"),
                    );
                }
            }
        }

        let (running, total) = {
            let workers = locked(&self.workers);
            let running = workers.values().filter(|w| w.is_running()).count();
            (running, workers.len())
        };
        if total > 0 {
            let rate = running as f64 / total as f64;
            if rate < 0.5 {
                report.degrade(
                    HealthStatus::Degraded,
                    format!("only {running}/{total} workers running ({:.0}%)", rate * 100.0),
                );
            }
        }
        report
            .components
            .insert("workers".into(), format!("{running}/{total}"));
        report
    }

    pub async fn stats(&self) -> ManagerStats {
        let now = self.clock.now();
        let mut workers: Vec<_> = locked(&self.workers)
            .values()
            .map(|w| w.view(now))
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let queue_handles: Vec<Arc<PriorityTaskQueue>> =
            locked(&self.queues).values().cloned().collect();
        let mut queues = BTreeMap::new();
        for queue in queue_handles {
            queues.insert(queue.name().to_string(), queue.len().await);
        }

        ManagerStats {
            tasks: self.ledger.counts(),
            active_workers: workers.iter().filter(|w| w.running).count(),
            workers,
            queues,
            workflows: locked(&self.workflows).len(),
            registered_tasks: self.registry.len(),
        }
    }
}
