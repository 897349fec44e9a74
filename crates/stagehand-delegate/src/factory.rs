//! Delegate factory for creating delegate services from configuration.

use crate::service::{DEFAULT_TASK_TIMEOUT, InMemoryDelegateService, TaskHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_abstraction::{
    DelegateError, DelegateService, DelegateTask, NotificationSink, ResponseData, TaskId, TaskType,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Delegate type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelegateType {
    /// Handlers run in-process on the tokio runtime.
    InMemory,
    /// No delegate is connected; every submission fails.
    Offline,
}

impl FromStr for DelegateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-memory" | "inmemory" | "memory" | "local" => Ok(Self::InMemory),
            "offline" | "disabled" => Ok(Self::Offline),
            _ => Err(()),
        }
    }
}

/// Delegate configuration.
#[derive(Clone)]
pub struct DelegateConfig {
    /// The type of delegate to create.
    pub delegate_type: DelegateType,
    /// Timeout applied to tasks without one.
    pub default_timeout: Duration,
    /// Handlers installed on the created service.
    pub handlers: Vec<(TaskType, Arc<dyn TaskHandler>)>,
}

impl std::fmt::Debug for DelegateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateConfig")
            .field("delegate_type", &self.delegate_type)
            .field("default_timeout", &self.default_timeout)
            .field("handler_types", &self.handlers.iter().map(|(t, _)| *t).collect::<Vec<_>>())
            .finish()
    }
}

impl DelegateConfig {
    /// Creates a new `DelegateConfig` of the given type.
    ///
    /// # Arguments
    /// * `delegate_type` - The type of delegate
    #[must_use]
    pub fn new(delegate_type: DelegateType) -> Self {
        Self { delegate_type, default_timeout: DEFAULT_TASK_TIMEOUT, handlers: Vec::new() }
    }

    /// Sets the default task timeout.
    ///
    /// # Arguments
    /// * `timeout` - Timeout applied to tasks without one
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Adds a handler for a task type.
    #[must_use]
    pub fn with_handler(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((task_type, handler));
        self
    }
}

/// Delegate service that refuses all work.
#[derive(Debug, Default)]
pub struct OfflineDelegateService;

#[async_trait]
impl DelegateService for OfflineDelegateService {
    async fn submit(&self, task: DelegateTask) -> Result<TaskId, DelegateError> {
        Err(DelegateError::Unavailable(format!("no delegate connected for {}", task.task_type)))
    }

    async fn run(&self, task: DelegateTask) -> Result<ResponseData, DelegateError> {
        Err(DelegateError::Unavailable(format!("no delegate connected for {}", task.task_type)))
    }

    async fn abort(&self, _task_id: &TaskId) -> bool {
        false
    }
}

/// Factory for creating delegate services.
pub struct DelegateFactory;

impl DelegateFactory {
    /// Creates a delegate service from the given configuration.
    ///
    /// # Arguments
    /// * `config` - The delegate configuration
    /// * `sink` - Channel async replies are posted to
    pub async fn create(
        config: DelegateConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<dyn DelegateService> {
        debug!(
            delegate_type = ?config.delegate_type,
            handler_count = config.handlers.len(),
            "Creating delegate service"
        );

        match config.delegate_type {
            DelegateType::InMemory => {
                let service =
                    InMemoryDelegateService::new(sink).with_default_timeout(config.default_timeout);
                for (task_type, handler) in config.handlers {
                    service.register_handler(task_type, handler).await;
                }
                Arc::new(service)
            }
            DelegateType::Offline => Arc::new(OfflineDelegateService),
        }
    }

    /// Creates a delegate service from a type string.
    ///
    /// # Arguments
    /// * `delegate_type_str` - String representation of the delegate type
    /// * `sink` - Channel async replies are posted to
    ///
    /// # Errors
    /// Returns a `DelegateError` if the delegate type is unrecognized.
    pub async fn create_from_str(
        delegate_type_str: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Arc<dyn DelegateService>, DelegateError> {
        let delegate_type = DelegateType::from_str(delegate_type_str).map_err(|()| {
            error!(delegate_type = %delegate_type_str, "Unrecognized delegate type");
            DelegateError::Other(format!("Unrecognized delegate type: {delegate_type_str}"))
        })?;

        Ok(Self::create(DelegateConfig::new(delegate_type), sink).await)
    }
}
