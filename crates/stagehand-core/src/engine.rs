//! Wiring of the registry, delegate, dispatcher and executor.

use crate::activity::ActivityRecorder;
use crate::config::{EngineConfig, EngineConfigLoader};
use crate::dispatcher::DelegateTaskDispatcher;
use crate::error::{Result, StateError};
use crate::executor::{InstanceOutcome, StartRequest, StateMachineExecutor};
use crate::progress::ProgressReporter;
use crate::registry::CorrelationRegistry;
use crate::state::State;
use stagehand_abstraction::{ActivityStore, DelegateService, ExpressionEvaluator};
use stagehand_delegate::{DelegateConfig, DelegateFactory, InMemoryActivityStore, TemplateEvaluator};
use std::sync::Arc;
use tracing::info;

/// A running executor together with the services states are built from.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<CorrelationRegistry>,
    delegate: Arc<dyn DelegateService>,
    recorder: ActivityRecorder,
    dispatcher: Arc<DelegateTaskDispatcher>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    executor: StateMachineExecutor,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts an engine recording activities in memory.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `StateError::InvalidConfiguration` if `config` does not validate.
    pub async fn start(config: EngineConfig, delegate: DelegateConfig) -> Result<Self> {
        Self::start_with_store(config, delegate, Arc::new(InMemoryActivityStore::new())).await
    }

    /// Starts an engine recording activities in `store`.
    ///
    /// # Errors
    /// Returns `StateError::InvalidConfiguration` if `config` does not validate.
    pub async fn start_with_store(
        config: EngineConfig,
        delegate: DelegateConfig,
        store: Arc<dyn ActivityStore>,
    ) -> Result<Self> {
        EngineConfigLoader::validate(&config)
            .map_err(|e| StateError::InvalidConfiguration(e.to_string()))?;

        let registry = Arc::new(CorrelationRegistry::new());
        let progress = Arc::new(ProgressReporter::new(config.progress_channel_capacity));
        let delegate = DelegateFactory::create(delegate, registry.clone()).await;
        let dispatcher = Arc::new(DelegateTaskDispatcher::new(
            Arc::clone(&delegate),
            Arc::clone(&registry),
            Arc::clone(&progress),
            &config,
        ));
        let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(TemplateEvaluator::new());
        let executor = StateMachineExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&evaluator),
            progress,
            config.clone(),
        );
        executor.run().map_err(|_| StateError::ExecutorStopped)?;
        info!(
            max_concurrent_invocations = config.max_concurrent_invocations,
            "Engine started"
        );

        Ok(Self {
            config,
            registry,
            delegate,
            recorder: ActivityRecorder::new(store),
            dispatcher,
            evaluator,
            executor,
        })
    }

    /// Starts `state` and returns its instance id.
    ///
    /// # Errors
    /// Returns `StateError::ExecutorStopped` after [`Engine::shutdown`].
    pub async fn run_state(&self, state: Arc<dyn State>, request: StartRequest) -> Result<String> {
        self.executor.start(state, request).await
    }

    /// Waits for an instance to finish.
    ///
    /// # Errors
    /// Returns `StateError::InstanceNotFound` for an unknown id.
    pub async fn wait(&self, instance_id: &str) -> Result<InstanceOutcome> {
        self.executor.wait(instance_id).await
    }

    /// Aborts an instance.
    ///
    /// # Errors
    /// Returns `StateError::InstanceNotFound` for an unknown id.
    pub async fn abort(&self, instance_id: &str) -> Result<()> {
        self.executor.abort(instance_id).await
    }

    /// Stops the executor loop.
    pub fn shutdown(&self) {
        if self.executor.stop().is_ok() {
            info!("Engine stopped");
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Correlation registry delegates reply to.
    #[must_use]
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Delegate service tasks are submitted to.
    #[must_use]
    pub fn delegate(&self) -> &Arc<dyn DelegateService> {
        &self.delegate
    }

    /// Activity recorder for states.
    #[must_use]
    pub fn recorder(&self) -> &ActivityRecorder {
        &self.recorder
    }

    /// Task dispatcher for states.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<DelegateTaskDispatcher> {
        &self.dispatcher
    }

    /// Expression evaluator contexts are built with.
    #[must_use]
    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    /// Progress reporter.
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressReporter> {
        self.executor.progress()
    }

    /// The executor.
    #[must_use]
    pub fn executor(&self) -> &StateMachineExecutor {
        &self.executor
    }
}
