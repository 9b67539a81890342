//! Handler traits - task を実行するもの
//!
//! # 二層構造
//! - **内部（Dyn）**: `TaskHandler` - object-safe。registry は
//!   `Arc<dyn TaskHandler>` を保持し、worker は `invoke` だけを呼ぶ
//! - **表層**: closure (`FnHandler` / `BlockingFnHandler`) と
//!   型付き `Handler<T>`（`TypedHandler` で型消去）

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;

use super::task::TypedTask;
use crate::domain::TaskArgs;

/// Error returned by a handler. The message ends up in `TaskFailure.message`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("json: {err}"))
    }
}

/// The execution capability stored in the registry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn invoke(&self, args: TaskArgs) -> Result<Value, HandlerError>;
}

/// Async closure handler.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn invoke(&self, args: TaskArgs) -> Result<Value, HandlerError> {
        (self.f)(args).await
    }
}

/// Synchronous closure run on the blocking pool.
///
/// The semaphore bounds how many blocking handlers run at once.
pub struct BlockingFnHandler<F> {
    f: Arc<F>,
    permits: Arc<Semaphore>,
}

impl<F> BlockingFnHandler<F>
where
    F: Fn(TaskArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    pub fn new(f: F, permits: Arc<Semaphore>) -> Self {
        Self {
            f: Arc::new(f),
            permits,
        }
    }
}

#[async_trait]
impl<F> TaskHandler for BlockingFnHandler<F>
where
    F: Fn(TaskArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn invoke(&self, args: TaskArgs) -> Result<Value, HandlerError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| HandlerError::new("blocking pool is closed"))?;

        // The permit lives on the blocking thread: aborting this future does
        // not stop the closure, so the slot stays taken until it returns.
        let f = Arc::clone(&self.f);
        let running = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(args)
        });
        match running.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(join.into_panic())
            ))),
            Err(join) => Err(HandlerError::new(format!("blocking handler aborted: {join}"))),
        }
    }
}

/// Text of a panic payload (`&str` or `String`).
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handler for a [`TypedTask`].
///
/// ```ignore
/// struct AddHandler;
///
/// #[async_trait]
/// impl Handler<Add> for AddHandler {
///     async fn handle(&self, task: Add) -> Result<i64, HandlerError> {
///         Ok(task.a + task.b)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, HandlerError>;
}

/// Type erasure: `Handler<T>` -> `TaskHandler`.
pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn invoke(&self, args: TaskArgs) -> Result<Value, HandlerError> {
        let task = T::from_args(&args)
            .map_err(|e| HandlerError::new(format!("invalid arguments for {}: {e}", T::NAME)))?;
        let output = self.handler.handle(task).await?;
        Ok(serde_json::to_value(output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::task::fixtures::Add;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, task: Add) -> Result<i64, HandlerError> {
            Ok(task.a + task.b)
        }
    }

    #[tokio::test]
    async fn fn_handler_receives_args() {
        let handler = FnHandler::new(|args: TaskArgs| async move {
            Ok::<_, HandlerError>(args.positional(0).cloned().unwrap_or(Value::Null))
        });
        let out = handler.invoke(TaskArgs::new().arg(42)).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn blocking_handler_runs_off_the_async_workers() {
        let handler = BlockingFnHandler::new(
            |args: TaskArgs| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(json!(args.args.len()))
            },
            Arc::new(Semaphore::new(1)),
        );
        let out = handler
            .invoke(TaskArgs::new().arg(1).arg(2))
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn blocking_handler_panic_becomes_error() {
        let handler = BlockingFnHandler::new(
            |_args: TaskArgs| -> Result<Value, HandlerError> { panic!("boom") },
            Arc::new(Semaphore::new(1)),
        );
        let err = handler.invoke(TaskArgs::new()).await.unwrap_err();
        assert_eq!(err.0, "handler panicked: boom");
    }

    #[tokio::test]
    async fn aborted_blocking_calls_keep_their_pool_slot() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let handler = Arc::new(BlockingFnHandler::new(
            move |_args: TaskArgs| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                a.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(Value::Null)
            },
            Arc::new(Semaphore::new(1)),
        ));

        // What a worker does on timeout: abort the invocation and move on.
        for _ in 0..3 {
            let h = Arc::clone(&handler);
            let call = tokio::spawn(async move { h.invoke(TaskArgs::new()).await });
            tokio::time::sleep(Duration::from_millis(30)).await;
            call.abort();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_encodes() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let args = Add { a: 2, b: 3 }.to_args().unwrap();
        assert_eq!(handler.invoke(args).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_args() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let err = handler
            .invoke(TaskArgs::new().kwarg("a", "x"))
            .await
            .unwrap_err();
        assert!(err.0.contains(Add::NAME));
    }
}
