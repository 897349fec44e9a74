//! Plugin states.
//!
//! Each state dispatches one kind of delegate work and maps the reply onto an
//! `ExecutionStatus`. Collaborators are injected through constructors.

pub mod command;
pub mod http;
pub mod jenkins;
pub mod log_analysis;
pub mod service_resize;

pub use command::{CommandState, CommandStateExecutionData};
pub use http::{HttpState, HttpStateExecutionData};
pub use jenkins::{BuildResult, JenkinsState, JenkinsStateExecutionData};
pub use log_analysis::{
    AnalysisWindow, DataCollector, LogAnalysisExecutionData, LogAnalysisState, ResponseMapper,
    ThresholdMapper,
};
pub use service_resize::{ResizeTarget, ServiceResizeExecutionData, ServiceResizeState};

use crate::registry::ResponseMap;
use stagehand_abstraction::{CorrelationId, ResponseData};

/// Message of the FAILED response returned when a single-task state resumes
/// with more or fewer than one reply.
pub const UNEXPECTED_RESPONSE_COUNT: &str = "Unexpected number of response data items";

/// Extracts the only reply of a single-task batch.
///
/// Returns `None` when the batch does not hold exactly one reply.
pub(crate) fn single_reply(responses: ResponseMap) -> Option<(CorrelationId, ResponseData)> {
    if responses.len() != 1 {
        return None;
    }
    responses.into_iter().next()
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::activity::ActivityRecorder;
    use crate::config::EngineConfig;
    use crate::context::{ExecutionContext, ExecutionIds};
    use crate::dispatcher::DelegateTaskDispatcher;
    use crate::progress::ProgressReporter;
    use crate::registry::CorrelationRegistry;
    use crate::response::ExecutionResponse;
    use stagehand_delegate::{InMemoryActivityStore, InMemoryDelegateService, TemplateEvaluator};
    use std::sync::Arc;

    pub(crate) struct Fixture {
        pub registry: Arc<CorrelationRegistry>,
        pub service: Arc<InMemoryDelegateService>,
        pub store: InMemoryActivityStore,
        pub recorder: ActivityRecorder,
        pub dispatcher: Arc<DelegateTaskDispatcher>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self::with_config(&EngineConfig::default())
        }

        pub(crate) fn with_config(config: &EngineConfig) -> Self {
            let registry = Arc::new(CorrelationRegistry::new());
            let service = Arc::new(InMemoryDelegateService::new(registry.clone()));
            let store = InMemoryActivityStore::new();
            let recorder = ActivityRecorder::new(Arc::new(store.clone()));
            let dispatcher = Arc::new(DelegateTaskDispatcher::new(
                service.clone(),
                registry.clone(),
                Arc::new(ProgressReporter::default()),
                config,
            ));
            Self { registry, service, store, recorder, dispatcher }
        }

        pub(crate) fn ctx(&self, state_name: &str) -> ExecutionContext {
            ExecutionContext::new(
                ExecutionIds::new("acct", "app-1", "wf-1").with_env_id("qa"),
                state_name,
                Arc::new(TemplateEvaluator::new()),
            )
        }
    }

    /// Context of the resume call following `response`.
    pub(crate) fn resumed(ctx: &ExecutionContext, response: &ExecutionResponse) -> ExecutionContext {
        ctx.clone().with_state_execution_data(response.state_execution_data.clone())
    }
}
