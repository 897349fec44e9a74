//! Delegate task dispatcher.
//!
//! Hands work units to the delegate service. Async tasks are queued and their
//! replies flow back through the [`CorrelationRegistry`]; synchronous tasks
//! are awaited in place with a timeout.

use crate::config::EngineConfig;
use crate::error::{Result, StateError};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::registry::CorrelationRegistry;
use stagehand_abstraction::{
    CorrelationId, DelegateError, DelegateService, DelegateTask, ResponseData, TaskId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle of a queued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    /// Delegate-side handle, used for tracing and abort.
    pub task_id: TaskId,
    /// Correlation id the reply is delivered to.
    pub correlation_id: CorrelationId,
}

/// Dispatcher of delegate tasks.
pub struct DelegateTaskDispatcher {
    service: Arc<dyn DelegateService>,
    registry: Arc<CorrelationRegistry>,
    progress: Arc<ProgressReporter>,
    async_timeout: Duration,
    sync_timeout: Duration,
}

impl std::fmt::Debug for DelegateTaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTaskDispatcher")
            .field("async_timeout", &self.async_timeout)
            .field("sync_timeout", &self.sync_timeout)
            .finish_non_exhaustive()
    }
}

impl DelegateTaskDispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Arguments
    /// * `service` - Delegate service tasks are submitted to
    /// * `registry` - Registry replies are joined through
    /// * `progress` - Reporter for `TaskQueued` events
    /// * `config` - Source of the default timeouts
    #[must_use]
    pub fn new(
        service: Arc<dyn DelegateService>,
        registry: Arc<CorrelationRegistry>,
        progress: Arc<ProgressReporter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            service,
            registry,
            progress,
            async_timeout: config.async_task_timeout(),
            sync_timeout: config.sync_task_timeout(),
        }
    }

    /// Queues an async task and returns immediately.
    ///
    /// A wait id is minted when the task has none and the default async
    /// timeout is applied when the task has no timeout. The wait id is
    /// reserved before submission so that a reply racing the caller's
    /// registration is parked.
    ///
    /// # Errors
    /// Returns an error if the wait id is already in use or the delegate
    /// service rejects the task.
    pub async fn queue_task(&self, mut task: DelegateTask) -> Result<QueuedTask> {
        let correlation_id = task.wait_id.get_or_insert_with(CorrelationId::generate).clone();
        task.timeout.get_or_insert(self.async_timeout);
        task.is_async = true;
        let task_type = task.task_type;

        self.registry.reserve(&correlation_id)?;
        let task_id = match self.service.submit(task).await {
            Ok(task_id) => task_id,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Delegate rejected task");
                self.registry.release(std::slice::from_ref(&correlation_id));
                return Err(e.into());
            }
        };

        info!(
            task_id = %task_id,
            task_type = %task_type,
            correlation_id = %correlation_id,
            "Delegate task queued"
        );
        self.progress
            .emit(ProgressEvent::TaskQueued {
                task_id: task_id.clone(),
                task_type,
                correlation_id: correlation_id.clone(),
            })
            .await;

        Ok(QueuedTask { task_id, correlation_id })
    }

    /// Runs a task and waits for its result.
    ///
    /// This suspends the calling task until the delegate replies or the
    /// timeout (the default sync timeout when the task has none) elapses.
    ///
    /// # Errors
    /// Returns `StateError::TaskTimeout` when the timeout elapses, or the
    /// delegate error otherwise.
    pub async fn execute_task(&self, mut task: DelegateTask) -> Result<ResponseData> {
        let timeout = *task.timeout.get_or_insert(self.sync_timeout);
        task.is_async = false;
        let task_type = task.task_type;
        let timed_out = || StateError::TaskTimeout {
            task_type: task_type.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        debug!(task_type = %task_type, timeout_ms = timeout.as_millis() as u64, "Executing delegate task");

        match tokio::time::timeout(timeout, self.service.run(task)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(DelegateError::TaskTimeout { .. })) | Err(_) => {
                warn!(task_type = %task_type, "Synchronous delegate task timed out");
                Err(timed_out())
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Best-effort cancellation of a queued task.
    pub async fn abort_task(&self, task_id: &TaskId) -> bool {
        let aborted = self.service.abort(task_id).await;
        debug!(task_id = %task_id, aborted, "Delegate task abort requested");
        aborted
    }

    /// Registry replies are joined through.
    #[must_use]
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }
}
