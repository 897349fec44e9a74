//! Log analysis (deployment verification) state.
//!
//! Queues a log collection task on the delegate and, while it runs, analyses
//! the collected data window by window on a [`LocalPoller`]. When the
//! collection reply arrives the poller is torn down and a [`ResponseMapper`]
//! turns the reply plus the analysed windows into a terminal status.
//!
//! The poller belongs to the state instance. It is shut down on resume and on
//! abort, whichever comes first; the second teardown finds nothing to stop.

use super::{UNEXPECTED_RESPONSE_COUNT, single_reply};
use crate::activity::ActivityRecorder;
use crate::context::ExecutionContext;
use crate::dispatcher::DelegateTaskDispatcher;
use crate::error::{Result, StateError};
use crate::poller::LocalPoller;
use crate::registry::ResponseMap;
use crate::response::{ExecutionResponse, StateExecutionData};
use crate::state::{State, StateType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_abstraction::{CorrelationId, DelegateTask, ExecutionStatus, ResponseData, TaskType};
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of analysing one window of collected logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWindow {
    /// 0-based window number.
    pub index: u64,
    /// Log records seen in the window.
    pub records: u64,
    /// Records classified as anomalous.
    pub anomalies: u64,
}

/// Source of the data a verification state analyses.
#[async_trait]
pub trait DataCollector: Send + Sync {
    /// Parameters of the delegate collection task.
    fn collection_parameters(&self, ctx: &ExecutionContext) -> Value;

    /// Analyses window `index` of the data collected for `instance_id`.
    ///
    /// # Errors
    /// A failed window is logged and skipped.
    async fn analyze_window(&self, instance_id: &str, index: u64) -> anyhow::Result<AnalysisWindow>;
}

/// Maps the collection reply and the analysed windows to a verdict.
pub trait ResponseMapper: Send + Sync {
    /// Returns the terminal status and its diagnostic.
    ///
    /// # Errors
    /// Returns an error if the reply cannot be interpreted.
    fn map(
        &self,
        reply: &ResponseData,
        windows: &[AnalysisWindow],
    ) -> anyhow::Result<(ExecutionStatus, Option<String>)>;
}

/// Fails the verification when the share of anomalous records exceeds a
/// threshold. No records at all counts as SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdMapper {
    max_anomaly_ratio: f64,
}

impl ThresholdMapper {
    /// Creates a mapper tolerating up to `max_anomaly_ratio` (0.0 to 1.0).
    #[must_use]
    pub const fn new(max_anomaly_ratio: f64) -> Self {
        Self { max_anomaly_ratio }
    }
}

impl Default for ThresholdMapper {
    fn default() -> Self {
        Self::new(0.25)
    }
}

impl ResponseMapper for ThresholdMapper {
    fn map(
        &self,
        reply: &ResponseData,
        windows: &[AnalysisWindow],
    ) -> anyhow::Result<(ExecutionStatus, Option<String>)> {
        if !reply.status().is_success() {
            let message = reply.error_message().unwrap_or("Log collection failed").to_string();
            return Ok((ExecutionStatus::Failed, Some(message)));
        }

        let records: u64 = windows.iter().map(|w| w.records).sum();
        let anomalies: u64 = windows.iter().map(|w| w.anomalies).sum();
        if records == 0 {
            return Ok((ExecutionStatus::Success, None));
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = anomalies as f64 / records as f64;
        if ratio > self.max_anomaly_ratio {
            let message = format!(
                "Anomaly ratio {ratio:.2} exceeds {:.2} ({anomalies} of {records} records)",
                self.max_anomaly_ratio
            );
            return Ok((ExecutionStatus::Failed, Some(message)));
        }
        Ok((ExecutionStatus::Success, None))
    }
}

/// Snapshot of a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAnalysisExecutionData {
    /// Activity recording the run.
    pub activity_id: String,
    /// Period between analysis windows, in milliseconds.
    pub analysis_period_ms: u64,
    /// Windows analysed before the collection reply arrived.
    pub windows: Vec<AnalysisWindow>,
}

struct Analysis {
    poller: LocalPoller,
    windows: Arc<Mutex<Vec<AnalysisWindow>>>,
}

/// Verifies a deployment from collected logs.
pub struct LogAnalysisState {
    name: String,
    analysis_period: Duration,
    max_windows: u64,
    timeout: Option<Duration>,
    collector: Arc<dyn DataCollector>,
    mapper: Arc<dyn ResponseMapper>,
    recorder: ActivityRecorder,
    dispatcher: Arc<DelegateTaskDispatcher>,
    running: Mutex<HashMap<String, Analysis>>,
}

impl fmt::Debug for LogAnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self.running.try_lock().map(|r| r.len()).ok();
        f.debug_struct("LogAnalysisState")
            .field("name", &self.name)
            .field("analysis_period", &self.analysis_period)
            .field("max_windows", &self.max_windows)
            .field("running", &running)
            .finish_non_exhaustive()
    }
}

impl LogAnalysisState {
    /// Creates a verification state analysing one window per minute.
    ///
    /// # Arguments
    /// * `name` - State name
    /// * `collector` - Collection parameters and window analysis
    /// * `mapper` - Verdict strategy
    /// * `recorder` - Activity recorder
    /// * `dispatcher` - Delegate task dispatcher
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        collector: Arc<dyn DataCollector>,
        mapper: Arc<dyn ResponseMapper>,
        recorder: ActivityRecorder,
        dispatcher: Arc<DelegateTaskDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            analysis_period: Duration::from_secs(60),
            max_windows: 15,
            timeout: None,
            collector,
            mapper,
            recorder,
            dispatcher,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the period between analysis windows.
    #[must_use]
    pub fn with_analysis_period(mut self, period: Duration) -> Self {
        self.analysis_period = period;
        self
    }

    /// Sets the number of windows after which local analysis stops.
    #[must_use]
    pub fn with_max_windows(mut self, max_windows: u64) -> Self {
        self.max_windows = max_windows.max(1);
        self
    }

    /// Sets the collection timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of instances with a poller running.
    #[must_use]
    pub fn active_pollers(&self) -> usize {
        self.lock_running().len()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, Analysis>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_analysis(&self, instance_id: &str) {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&self.collector);
        let sink = Arc::clone(&windows);
        let owner = instance_id.to_string();
        let max_windows = self.max_windows;

        let poller = LocalPoller::spawn(
            format!("{}-{instance_id}", self.name),
            self.analysis_period,
            move |index| {
                let collector = Arc::clone(&collector);
                let sink = Arc::clone(&sink);
                let owner = owner.clone();
                async move {
                    match collector.analyze_window(&owner, index).await {
                        Ok(window) => sink.lock().unwrap_or_else(PoisonError::into_inner).push(window),
                        Err(e) => warn!(instance_id = %owner, window = index, error = %e, "Analysis window failed"),
                    }
                    if index + 1 >= max_windows { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
                }
            },
        );

        if let Some(previous) = self.lock_running().insert(instance_id.to_string(), Analysis { poller, windows }) {
            previous.poller.cancel();
        }
    }

    /// Stops the poller of `instance_id` and returns the windows it produced.
    async fn stop_analysis(&self, instance_id: &str) -> Option<Vec<AnalysisWindow>> {
        let analysis = self.lock_running().remove(instance_id)?;
        analysis.poller.shutdown().await;
        let windows = std::mem::take(&mut *analysis.windows.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(instance_id = %instance_id, windows = windows.len(), "Log analysis stopped");
        Some(windows)
    }

    async fn finalize_activity(&self, ctx: &ExecutionContext, activity_id: &str, status: ExecutionStatus) {
        if let Err(e) = self.recorder.update_status(&ctx.ids().app_id, activity_id, status).await {
            warn!(activity_id = %activity_id, error = %e, "Failed to finalize verification activity");
        }
    }
}

#[async_trait]
impl State for LogAnalysisState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::LogAnalysis
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse> {
        let activity = self.recorder.create(ctx, StateType::LogAnalysis, "Log Verification").await?;
        let activity_id = activity
            .id
            .ok_or_else(|| StateError::UnexpectedResponse("activity saved without id".to_string()))?;

        let ids = ctx.ids();
        let mut task = DelegateTask::new(TaskType::LogCollection, &ids.account_id, &ids.app_id)
            .with_wait_id(CorrelationId::from(activity_id.clone()))
            .with_parameter(self.collector.collection_parameters(ctx));
        if let Some(env_id) = &ids.env_id {
            task = task.with_env_id(env_id);
        }
        if let Some(timeout) = self.timeout {
            task = task.with_timeout(timeout);
        }

        let queued = match self.dispatcher.queue_task(task).await {
            Ok(queued) => queued,
            Err(e) => {
                self.finalize_activity(ctx, &activity_id, ExecutionStatus::Failed).await;
                return Err(e);
            }
        };
        self.start_analysis(ctx.instance_id());
        info!(
            state_name = %self.name,
            activity_id = %activity_id,
            period_ms = self.analysis_period.as_millis() as u64,
            "Log collection started"
        );

        let data = LogAnalysisExecutionData {
            activity_id,
            analysis_period_ms: self.analysis_period.as_millis() as u64,
            windows: Vec::new(),
        };
        Ok(ExecutionResponse::suspend(vec![queued.correlation_id])
            .with_delegate_task_id(queued.task_id)
            .with_state_execution_data(StateExecutionData::new(ExecutionStatus::Running).with_payload(&data)?))
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: ResponseMap,
    ) -> Result<ExecutionResponse> {
        let windows = self.stop_analysis(ctx.instance_id()).await.unwrap_or_default();
        let Some((activity_id, reply)) = single_reply(responses) else {
            return Ok(ExecutionResponse::failed(UNEXPECTED_RESPONSE_COUNT));
        };
        if let ResponseData::Error { message, .. } = &reply {
            self.finalize_activity(ctx, activity_id.as_str(), ExecutionStatus::Failed).await;
            return Ok(ExecutionResponse::failed(message.clone()));
        }

        let (status, message) = self.mapper.map(&reply, &windows)?;
        self.finalize_activity(ctx, activity_id.as_str(), status).await;

        let mut data: LogAnalysisExecutionData = ctx
            .state_execution_data()
            .ok_or_else(|| StateError::UnexpectedResponse("missing verification execution data".to_string()))?
            .payload_as()?;
        data.windows = windows;
        Ok(ExecutionResponse::terminal(status, message)
            .with_state_execution_data(StateExecutionData::new(status).with_payload(&data)?))
    }

    async fn handle_abort_event(&self, ctx: &ExecutionContext) -> Result<()> {
        self.stop_analysis(ctx.instance_id()).await;
        if let Some(snapshot) = ctx.state_execution_data() {
            let data: LogAnalysisExecutionData = snapshot.payload_as()?;
            self.finalize_activity(ctx, &data.activity_id, ExecutionStatus::Aborted).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::testing::{Fixture, resumed};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stagehand_delegate::handler_fn;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Collector {
        calls: AtomicU64,
    }

    #[async_trait]
    impl DataCollector for Collector {
        fn collection_parameters(&self, ctx: &ExecutionContext) -> Value {
            json!({ "query": "level:error", "env": ctx.ids().env_id })
        }

        async fn analyze_window(&self, _instance_id: &str, index: u64) -> anyhow::Result<AnalysisWindow> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if index == 2 {
                anyhow::bail!("log store unavailable");
            }
            Ok(AnalysisWindow { index, records: 10, anomalies: if index == 1 { 4 } else { 0 } })
        }
    }

    async fn setup(threshold: f64) -> (Fixture, Arc<Collector>, LogAnalysisState) {
        let fixture = Fixture::new();
        fixture
            .service
            .register_handler(
                TaskType::LogCollection,
                handler_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(36_000)).await;
                    Ok(ResponseData::success(json!({})))
                }),
            )
            .await;
        let collector = Arc::new(Collector::default());
        let state = LogAnalysisState::new(
            "Verify",
            collector.clone(),
            Arc::new(ThresholdMapper::new(threshold)),
            fixture.recorder.clone(),
            fixture.dispatcher.clone(),
        )
        .with_max_windows(5);
        (fixture, collector, state)
    }

    #[test]
    fn test_threshold_mapper() {
        let mapper = ThresholdMapper::default();
        let windows = [AnalysisWindow { index: 0, records: 10, anomalies: 3 }];
        let ok = ResponseData::success(json!({}));
        assert_eq!(mapper.map(&ok, &[]).unwrap(), (ExecutionStatus::Success, None));
        let (status, message) = mapper.map(&ok, &windows).unwrap();
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(message.as_deref(), Some("Anomaly ratio 0.30 exceeds 0.25 (3 of 10 records)"));

        let failed = ResponseData::failure("collector crashed");
        assert_eq!(
            mapper.map(&failed, &[]).unwrap(),
            (ExecutionStatus::Failed, Some("collector crashed".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_analysed_until_reply() {
        let (fixture, collector, state) = setup(0.25).await;
        let ctx = fixture.ctx("Verify");
        let suspended = state.execute(&ctx).await.unwrap();
        assert_eq!(state.active_pollers(), 1);
        assert_eq!(fixture.service.history()[0].parameters[0]["env"], json!("qa"));

        tokio::time::sleep(Duration::from_secs(60 * 3 + 1)).await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);

        let id = suspended.correlation_ids[0].clone();
        let response = state
            .handle_async_response(
                &resumed(&ctx, &suspended),
                ResponseMap::from([(id.clone(), ResponseData::success(json!({})))]),
            )
            .await
            .unwrap();
        assert_eq!(state.active_pollers(), 0);
        assert_eq!(response.execution_status, ExecutionStatus::Success);

        let data: LogAnalysisExecutionData =
            response.state_execution_data.unwrap().payload_as().unwrap();
        assert_eq!(data.windows.len(), 2);
        let activity = fixture.recorder.get("app-1", id.as_str()).await.unwrap().unwrap();
        assert_eq!(activity.status, ExecutionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anomalies_fail_verification() {
        let (fixture, _, state) = setup(0.1).await;
        let ctx = fixture.ctx("Verify");
        let suspended = state.execute(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60 * 2 + 1)).await;

        let id = suspended.correlation_ids[0].clone();
        let response = state
            .handle_async_response(
                &resumed(&ctx, &suspended),
                ResponseMap::from([(id, ResponseData::success(json!({})))]),
            )
            .await
            .unwrap();
        assert_eq!(response.execution_status, ExecutionStatus::Failed);
        assert_eq!(
            response.error_message.as_deref(),
            Some("Anomaly ratio 0.20 exceeds 0.10 (4 of 20 records)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_poller_and_marks_activity() {
        let (fixture, collector, state) = setup(0.25).await;
        let ctx = fixture.ctx("Verify");
        let suspended = state.execute(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        let ctx = resumed(&ctx, &suspended);
        state.handle_abort_event(&ctx).await.unwrap();
        state.handle_abort_event(&ctx).await.unwrap();
        assert_eq!(state.active_pollers(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);

        let id = suspended.correlation_ids[0].as_str();
        let activity = fixture.recorder.get("app-1", id).await.unwrap().unwrap();
        assert_eq!(activity.status, ExecutionStatus::Aborted);
    }
}
