//! In-process delegate service.
//!
//! Runs task handlers on the tokio runtime and posts every async result to a
//! [`NotificationSink`]. Each accepted task produces exactly one reply: the
//! handler's result, an error reply, a timeout-failure reply or an abort reply.

use async_trait::async_trait;
use futures::future::BoxFuture;
use stagehand_abstraction::{
    DelegateError, DelegateService, DelegateTask, ExecutionStatus, NotificationSink, ResponseData,
    TaskId, TaskType,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default timeout applied when a task carries none.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Executes one kind of delegate task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Performs the work described by `task`.
    ///
    /// # Errors
    /// Returns a `DelegateError` if the work fails.
    async fn handle(&self, task: DelegateTask) -> Result<ResponseData, DelegateError>;
}

/// Adapts a closure returning a boxed future into a [`TaskHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(DelegateTask) -> BoxFuture<'static, Result<ResponseData, DelegateError>> + Send + Sync,
{
    /// Wraps `f`.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(DelegateTask) -> BoxFuture<'static, Result<ResponseData, DelegateError>> + Send + Sync,
{
    async fn handle(&self, task: DelegateTask) -> Result<ResponseData, DelegateError> {
        (self.0)(task).await
    }
}

/// Builds a handler from an async closure.
///
/// # Arguments
/// * `f` - Closure producing the task result
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(DelegateTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseData, DelegateError>> + Send + 'static,
{
    Arc::new(FnHandler::new(move |task| -> BoxFuture<'static, _> { Box::pin(f(task)) }))
}

/// Delegate service running handlers in-process.
pub struct InMemoryDelegateService {
    /// Handlers by task type.
    handlers: Arc<RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>>,
    /// Cancellation tokens of in-flight async tasks.
    running: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    /// Every task accepted by `submit` or `run`, in arrival order.
    history: Arc<Mutex<Vec<DelegateTask>>>,
    /// Where async replies are posted.
    sink: Arc<dyn NotificationSink>,
    /// Timeout applied to tasks without one.
    default_timeout: Duration,
}

impl fmt::Debug for InMemoryDelegateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handler_count = self.handlers.try_read().map_or(0, |h| h.len());
        let running = self.running.lock().map_or(0, |r| r.len());
        f.debug_struct("InMemoryDelegateService")
            .field("handler_count", &handler_count)
            .field("running", &running)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl InMemoryDelegateService {
    /// Creates a service that posts async replies to `sink`.
    ///
    /// # Arguments
    /// * `sink` - Notification channel for async replies
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(Vec::new())),
            sink,
            default_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    /// Sets the timeout applied to tasks without one.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Registers the handler for a task type, replacing any previous one.
    pub async fn register_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        debug!(task_type = %task_type, "Registering delegate handler");
        self.handlers.write().await.insert(task_type, handler);
    }

    /// Returns a copy of every task accepted so far.
    #[must_use]
    pub fn history(&self) -> Vec<DelegateTask> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the number of accepted tasks of the given type.
    #[must_use]
    pub fn count_of(&self, task_type: TaskType) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.task_type == task_type)
            .count()
    }

    /// Returns the number of async tasks still in flight.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn handler_for(&self, task_type: TaskType) -> Result<Arc<dyn TaskHandler>, DelegateError> {
        self.handlers
            .read()
            .await
            .get(&task_type)
            .cloned()
            .ok_or_else(|| DelegateError::NoEligibleDelegate(task_type.to_string()))
    }

    fn record(&self, task: &DelegateTask) {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).push(task.clone());
    }
}

#[async_trait]
impl DelegateService for InMemoryDelegateService {
    async fn submit(&self, task: DelegateTask) -> Result<TaskId, DelegateError> {
        let wait_id = task
            .wait_id
            .clone()
            .ok_or_else(|| DelegateError::Rejected("async task has no wait id".to_string()))?;
        let handler = self.handler_for(task.task_type).await?;
        let timeout = task.timeout.unwrap_or(self.default_timeout);
        let task_id = TaskId::generate();
        let token = CancellationToken::new();

        self.record(&task);
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.clone(), token.clone());

        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            correlation_id = %wait_id,
            timeout_ms = timeout.as_millis() as u64,
            "Delegate task accepted"
        );

        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            let reply = tokio::select! {
                () = token.cancelled() => ResponseData::Task {
                    status: ExecutionStatus::Aborted,
                    payload: serde_json::Value::Null,
                    error_message: Some(format!("Delegate task {spawned_id} was aborted")),
                },
                outcome = tokio::time::timeout(timeout, handler.handle(task)) => match outcome {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        warn!(task_id = %spawned_id, error = %e, "Delegate task failed");
                        ResponseData::error(e.to_string())
                    }
                    Err(_) => {
                        warn!(task_id = %spawned_id, "Delegate task timed out");
                        ResponseData::timeout(
                            DelegateError::TaskTimeout {
                                task_id: spawned_id.to_string(),
                                timeout_ms: timeout.as_millis() as u64,
                            }
                            .to_string(),
                        )
                    }
                },
            };

            running.lock().unwrap_or_else(PoisonError::into_inner).remove(&spawned_id);
            let delivered = sink.notify(&wait_id, reply);
            debug!(
                task_id = %spawned_id,
                correlation_id = %wait_id,
                delivered,
                "Delegate reply posted"
            );
        });

        Ok(task_id)
    }

    async fn run(&self, task: DelegateTask) -> Result<ResponseData, DelegateError> {
        let handler = self.handler_for(task.task_type).await?;
        let timeout = task.timeout.unwrap_or(self.default_timeout);
        let task_id = TaskId::generate();
        self.record(&task);

        debug!(task_id = %task_id, task_type = %task.task_type, "Running delegate task");

        match tokio::time::timeout(timeout, handler.handle(task)).await {
            Ok(result) => result,
            Err(_) => Err(DelegateError::TaskTimeout {
                task_id: task_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn abort(&self, task_id: &TaskId) -> bool {
        let token = self.running.lock().unwrap_or_else(PoisonError::into_inner).remove(task_id);
        match token {
            Some(token) => {
                info!(task_id = %task_id, "Aborting delegate task");
                token.cancel();
                true
            }
            None => {
                debug!(task_id = %task_id, "Abort requested for finished or unknown task");
                false
            }
        }
    }
}
