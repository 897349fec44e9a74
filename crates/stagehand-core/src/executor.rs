//! State machine executor.
//!
//! Drives state instances through execute, suspend and resume. Every
//! invocation is posted as a command to a message loop and runs on its own
//! tokio task. A per-instance mutex keeps the calls of one instance
//! sequential while independent instances (and parallel children) run
//! concurrently.
//!
//! Suspension is returning an async response: the executor registers a batch
//! with the [`CorrelationRegistry`] whose continuation posts the resume
//! command once every id has reported.
//!
//! A finished instance leaves the live table. Its outcome stays queryable
//! until `finished_instance_retention` newer instances have finished or it is
//! dropped with [`StateMachineExecutor::forget`].

use crate::config::EngineConfig;
use crate::context::{ExecutionContext, ExecutionIds};
use crate::dispatcher::DelegateTaskDispatcher;
use crate::error::{Result, StateError};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::registry::{CorrelationRegistry, ResponseMap};
use crate::response::{ChildInstance, ExecutionResponse, StateExecutionData};
use crate::state::{State, guard};
use serde_json::{Map, Value};
use stagehand_abstraction::{
    ContextElement, CorrelationId, ExecutionStatus, ExpressionEvaluator, ResponseData, TaskId,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Input of [`StateMachineExecutor::start`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Scoping ids; the instance id is assigned by the executor.
    pub ids: ExecutionIds,
    /// Context elements visible to the state.
    pub elements: Vec<ContextElement>,
    /// Workflow variables (a JSON object).
    pub variables: Value,
}

impl StartRequest {
    /// Creates a request with no elements and no variables.
    #[must_use]
    pub fn new(ids: ExecutionIds) -> Self {
        Self { ids, elements: Vec::new(), variables: Value::Object(Map::new()) }
    }

    /// Adds a context element.
    #[must_use]
    pub fn with_element(mut self, element: ContextElement) -> Self {
        self.elements.push(element);
        self
    }

    /// Sets the workflow variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }
}

/// Terminal result of a state instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceOutcome {
    /// Instance id.
    pub instance_id: String,
    /// State name.
    pub state_name: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Diagnostic for non-success statuses.
    pub error_message: Option<String>,
    /// Last execution data snapshot.
    pub state_execution_data: Option<StateExecutionData>,
    /// Elements the state published.
    pub context_elements: Vec<ContextElement>,
    /// Elements delivered to the parent.
    pub notify_elements: Vec<ContextElement>,
}

#[derive(Debug)]
enum Command {
    Start(String),
    Resume { instance_id: String, responses: ResponseMap },
    Expire(String),
    Abort(String),
}

struct ParentLink {
    instance_id: String,
    notify_id: CorrelationId,
}

struct Instance {
    id: String,
    state: Arc<dyn State>,
    ids: ExecutionIds,
    variables: Value,
    parent: Option<ParentLink>,
    data: Mutex<InstanceData>,
    done: watch::Sender<Option<InstanceOutcome>>,
    span: Span,
}

/// What remains of an instance after it finished.
struct Retired {
    outcome: InstanceOutcome,
    children: Vec<String>,
}

#[derive(Default)]
struct InstanceTable {
    live: HashMap<String, Arc<Instance>>,
    retired: HashMap<String, Retired>,
    retired_order: VecDeque<String>,
}

enum Entry {
    Live(Arc<Instance>),
    Retired { outcome: InstanceOutcome, children: Vec<String> },
}

struct InstanceData {
    status: ExecutionStatus,
    elements: Vec<ContextElement>,
    published: Vec<ContextElement>,
    state_execution_data: Option<StateExecutionData>,
    pending: Vec<CorrelationId>,
    delegate_task_id: Option<TaskId>,
    children: Vec<String>,
    expiry: Option<AbortHandle>,
    expired: bool,
}

impl InstanceData {
    fn new(elements: Vec<ContextElement>) -> Self {
        Self {
            status: ExecutionStatus::New,
            elements,
            published: Vec::new(),
            state_execution_data: None,
            pending: Vec::new(),
            delegate_task_id: None,
            children: Vec::new(),
            expiry: None,
            expired: false,
        }
    }
}

struct Inner {
    registry: Arc<CorrelationRegistry>,
    dispatcher: Arc<DelegateTaskDispatcher>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    progress: Arc<ProgressReporter>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    instances: RwLock<InstanceTable>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Reference scheduler for [`State`] implementations.
pub struct StateMachineExecutor {
    inner: Arc<Inner>,
    command_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl fmt::Debug for StateMachineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instances = self.inner.instances.try_read().map(|t| t.live.len()).ok();
        f.debug_struct("StateMachineExecutor")
            .field("running", &self.is_running())
            .field("instances", &instances)
            .field("max_concurrent_invocations", &self.inner.config.max_concurrent_invocations)
            .finish_non_exhaustive()
    }
}

impl StateMachineExecutor {
    /// Creates a stopped executor.
    ///
    /// # Arguments
    /// * `registry` - Registry suspended instances wait on
    /// * `dispatcher` - Used to abort delegate tasks in flight
    /// * `evaluator` - Expression renderer handed to every context
    /// * `progress` - Reporter for lifecycle events
    /// * `config` - Default state timeout and concurrency limit
    #[must_use]
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        dispatcher: Arc<DelegateTaskDispatcher>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        progress: Arc<ProgressReporter>,
        config: EngineConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_invocations.max(1)));
        let inner = Arc::new(Inner {
            registry,
            dispatcher,
            evaluator,
            progress,
            config,
            semaphore,
            instances: RwLock::new(InstanceTable::default()),
            commands,
        });
        Self {
            inner,
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            shutdown_tx,
        }
    }

    /// Starts the message loop in a background task.
    ///
    /// An executor runs at most once; a stopped executor cannot be restarted.
    ///
    /// # Returns
    /// Returns `Ok(())` if started, or an error if it already ran.
    pub fn run(&self) -> std::result::Result<(), String> {
        let Some(mut command_rx) =
            self.command_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return Err("State machine executor was already started".to_string());
        };

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("State machine executor started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("State machine executor shutdown signal received");
                            break;
                        }
                    }
                    command = command_rx.recv() => {
                        let Some(command) = command else {
                            info!("State machine executor command channel closed");
                            break;
                        };

                        let Ok(permit) = Arc::clone(&inner.semaphore).acquire_owned().await else {
                            error!("Semaphore closed, stopping executor");
                            break;
                        };

                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            let _permit = permit;
                            inner.dispatch(command).await;
                        });
                    }
                }
            }

            info!("State machine executor stopped");
        });

        Ok(())
    }

    /// Stops the message loop. Invocations already running complete.
    ///
    /// # Returns
    /// Returns `Ok(())` if stopped, or an error if not running.
    pub fn stop(&self) -> std::result::Result<(), String> {
        if !self.is_running() {
            return Err("State machine executor is not running".to_string());
        }
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    /// Returns `true` while the message loop accepts commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let started = self.command_rx.lock().unwrap_or_else(PoisonError::into_inner).is_none();
        started && !*self.shutdown_tx.borrow()
    }

    /// Creates an instance of `state` and schedules its `execute` call.
    ///
    /// # Returns
    /// The new instance id.
    ///
    /// # Errors
    /// Returns `StateError::ExecutorStopped` if the loop is not running.
    pub async fn start(&self, state: Arc<dyn State>, request: StartRequest) -> Result<String> {
        if !self.is_running() {
            return Err(StateError::ExecutorStopped);
        }
        let StartRequest { ids, elements, variables } = request;
        let id = self.inner.create_instance(state, ids, elements, variables, None).await;
        if !self.inner.send(Command::Start(id.clone())) {
            return Err(StateError::ExecutorStopped);
        }
        Ok(id)
    }

    /// Requests cancellation of an instance and its children.
    ///
    /// Aborting a terminal instance is a no-op.
    ///
    /// # Errors
    /// Returns `StateError::InstanceNotFound` for an unknown id and
    /// `StateError::ExecutorStopped` if the loop is not running.
    pub async fn abort(&self, instance_id: &str) -> Result<()> {
        match self.inner.entry(instance_id).await {
            Some(Entry::Live(_)) => {
                if !self.inner.send(Command::Abort(instance_id.to_string())) {
                    return Err(StateError::ExecutorStopped);
                }
                Ok(())
            }
            Some(Entry::Retired { .. }) => {
                debug!(instance_id = %instance_id, "Abort of finished instance ignored");
                Ok(())
            }
            None => Err(StateError::InstanceNotFound(instance_id.to_string())),
        }
    }

    /// Waits until the instance reaches a terminal status.
    ///
    /// # Errors
    /// Returns `StateError::InstanceNotFound` for an unknown or forgotten id.
    pub async fn wait(&self, instance_id: &str) -> Result<InstanceOutcome> {
        let instance = match self.inner.entry(instance_id).await {
            Some(Entry::Live(instance)) => instance,
            Some(Entry::Retired { outcome, .. }) => return Ok(outcome),
            None => return Err(StateError::InstanceNotFound(instance_id.to_string())),
        };
        let mut done = instance.done.subscribe();
        let outcome = done.wait_for(Option::is_some).await.map_err(|_| StateError::ExecutorStopped)?;
        (*outcome).clone().ok_or(StateError::ExecutorStopped)
    }

    /// Terminal outcome of an instance, if it finished.
    pub async fn outcome(&self, instance_id: &str) -> Option<InstanceOutcome> {
        match self.inner.entry(instance_id).await? {
            Entry::Live(instance) => instance.done.borrow().clone(),
            Entry::Retired { outcome, .. } => Some(outcome),
        }
    }

    /// Current status of an instance.
    pub async fn status(&self, instance_id: &str) -> Option<ExecutionStatus> {
        match self.inner.entry(instance_id).await? {
            Entry::Live(instance) => {
                let status = instance.data.lock().await.status;
                Some(status)
            }
            Entry::Retired { outcome, .. } => Some(outcome.status),
        }
    }

    /// Ids of the children spawned by an instance, in spawn order.
    pub async fn children(&self, instance_id: &str) -> Vec<String> {
        match self.inner.entry(instance_id).await {
            Some(Entry::Live(instance)) => instance.data.lock().await.children.clone(),
            Some(Entry::Retired { children, .. }) => children,
            None => Vec::new(),
        }
    }

    /// Drops the record of a finished instance.
    ///
    /// # Returns
    /// `true` if a finished record was removed; `false` for an instance that
    /// is still live or unknown.
    pub async fn forget(&self, instance_id: &str) -> bool {
        let mut table = self.inner.instances.write().await;
        if table.retired.remove(instance_id).is_none() {
            return false;
        }
        table.retired_order.retain(|id| id.as_str() != instance_id);
        debug!(instance_id = %instance_id, "Finished instance forgotten");
        true
    }

    /// Number of instances that have not finished yet.
    pub async fn live_instances(&self) -> usize {
        self.inner.instances.read().await.live.len()
    }

    /// Reporter the executor emits lifecycle events to.
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressReporter> {
        &self.inner.progress
    }

    /// Registry suspended instances wait on.
    #[must_use]
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.inner.registry
    }
}

impl Drop for StateMachineExecutor {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Inner {
    fn send(&self, command: Command) -> bool {
        match self.commands.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(command = ?e.0, "Executor command dropped");
                false
            }
        }
    }

    async fn instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances.read().await.live.get(instance_id).cloned()
    }

    async fn entry(&self, instance_id: &str) -> Option<Entry> {
        let table = self.instances.read().await;
        if let Some(instance) = table.live.get(instance_id) {
            return Some(Entry::Live(Arc::clone(instance)));
        }
        table.retired.get(instance_id).map(|retired| Entry::Retired {
            outcome: retired.outcome.clone(),
            children: retired.children.clone(),
        })
    }

    async fn retire(&self, instance: &Instance, data: &InstanceData, outcome: InstanceOutcome) {
        let mut table = self.instances.write().await;
        table.live.remove(&instance.id);
        table
            .retired
            .insert(instance.id.clone(), Retired { outcome, children: data.children.clone() });
        table.retired_order.push_back(instance.id.clone());
        while table.retired.len() > self.config.finished_instance_retention {
            let Some(evicted) = table.retired_order.pop_front() else {
                break;
            };
            table.retired.remove(&evicted);
        }
    }

    async fn create_instance(
        &self,
        state: Arc<dyn State>,
        mut ids: ExecutionIds,
        elements: Vec<ContextElement>,
        variables: Value,
        parent: Option<ParentLink>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        ids.state_execution_instance_id.clone_from(&id);
        let span = info_span!("state", instance_id = %id, state_name = %state.name());
        let (done, _) = watch::channel(None);

        let instance = Arc::new(Instance {
            id: id.clone(),
            state,
            ids,
            variables,
            parent,
            data: Mutex::new(InstanceData::new(elements)),
            done,
            span,
        });
        self.instances.write().await.live.insert(id.clone(), instance);
        id
    }

    fn context(&self, instance: &Instance, data: &InstanceData) -> ExecutionContext {
        ExecutionContext::new(instance.ids.clone(), instance.state.name(), Arc::clone(&self.evaluator))
            .with_elements(data.elements.clone())
            .with_variables(instance.variables.clone())
            .with_state_execution_data(data.state_execution_data.clone())
            .with_span(instance.span.clone())
    }

    async fn dispatch(&self, command: Command) {
        let instance_id = match &command {
            Command::Start(id) | Command::Expire(id) | Command::Abort(id) => id.clone(),
            Command::Resume { instance_id, .. } => instance_id.clone(),
        };
        let Some(instance) = self.instance(&instance_id).await else {
            debug!(
                instance_id = %instance_id,
                command = ?command,
                "Command for finished or unknown state instance"
            );
            return;
        };

        match command {
            Command::Start(_) => self.handle_start(&instance).await,
            Command::Resume { responses, .. } => self.handle_resume(&instance, responses).await,
            Command::Expire(_) => self.handle_expire(&instance).await,
            Command::Abort(_) => self.handle_abort(&instance).await,
        }
    }

    async fn handle_start(&self, instance: &Instance) {
        let mut data = instance.data.lock().await;
        if data.status != ExecutionStatus::New {
            debug!(parent: &instance.span, status = %data.status, "Instance already started");
            return;
        }
        data.status = ExecutionStatus::Running;
        data.expiry = Some(self.schedule_expiry(instance));

        info!(parent: &instance.span, "State execution started");
        self.progress
            .emit(ProgressEvent::StateStarted {
                instance_id: instance.id.clone(),
                state_name: instance.state.name().to_string(),
            })
            .await;

        let ctx = self.context(instance, &data);
        let response = guard(
            instance.state.name(),
            instance.state.execute(&ctx).instrument(instance.span.clone()),
        )
        .await;
        self.apply(instance, &mut data, response).await;
    }

    async fn handle_resume(&self, instance: &Instance, responses: ResponseMap) {
        let mut data = instance.data.lock().await;
        if data.status != ExecutionStatus::Running {
            debug!(parent: &instance.span, status = %data.status, "Dropping resume of inactive instance");
            return;
        }
        data.pending.clear();
        data.delegate_task_id = None;

        info!(parent: &instance.span, replies = responses.len(), "State execution resumed");
        self.progress
            .emit(ProgressEvent::StateResumed { instance_id: instance.id.clone() })
            .await;

        let ctx = self.context(instance, &data);
        let response = guard(
            instance.state.name(),
            instance
                .state
                .handle_async_response(&ctx, responses)
                .instrument(instance.span.clone()),
        )
        .await;
        self.apply(instance, &mut data, response).await;
    }

    async fn handle_expire(&self, instance: &Instance) {
        let mut data = instance.data.lock().await;
        if data.status != ExecutionStatus::Running {
            return;
        }
        data.expired = true;
        data.expiry = None;
        let timeout = self.state_timeout(instance);
        warn!(
            parent: &instance.span,
            timeout_ms = timeout.as_millis() as u64,
            pending = data.pending.len(),
            "State execution expired"
        );

        if let Some(task_id) = data.delegate_task_id.take() {
            self.dispatcher.abort_task(&task_id).await;
        }
        let pending = data.pending.clone();
        let children = data.children.clone();
        if pending.is_empty() {
            let message = format!("State expired after {} ms", timeout.as_millis());
            self.finish(instance, &mut data, ExecutionStatus::Error, Some(message), Vec::new())
                .await;
            return;
        }
        drop(data);

        let message = format!(
            "State {} expired after {} ms",
            instance.state.name(),
            timeout.as_millis()
        );
        for id in &pending {
            self.registry.notify(id, ResponseData::timeout(message.clone()));
        }
        for child in children {
            self.send(Command::Abort(child));
        }
    }

    async fn handle_abort(&self, instance: &Instance) {
        let mut data = instance.data.lock().await;
        if data.status.is_final() || data.status == ExecutionStatus::Aborting {
            debug!(parent: &instance.span, status = %data.status, "Abort ignored");
            return;
        }
        let started = data.status != ExecutionStatus::New;
        data.status = ExecutionStatus::Aborting;
        info!(parent: &instance.span, "Aborting state execution");

        let pending = std::mem::take(&mut data.pending);
        let cancelled = self.registry.cancel(&pending);
        debug!(parent: &instance.span, cancelled, "Pending correlation ids cancelled");

        if let Some(task_id) = data.delegate_task_id.take() {
            self.dispatcher.abort_task(&task_id).await;
        }
        for child in &data.children {
            self.send(Command::Abort(child.clone()));
        }

        if started {
            let ctx = self.context(instance, &data);
            if let Err(e) =
                instance.state.handle_abort_event(&ctx).instrument(instance.span.clone()).await
            {
                warn!(parent: &instance.span, error = %e, "Abort handler failed");
            }
        }

        self.finish(
            instance,
            &mut data,
            ExecutionStatus::Aborted,
            Some("State execution aborted".to_string()),
            Vec::new(),
        )
        .await;
    }

    fn state_timeout(&self, instance: &Instance) -> std::time::Duration {
        instance.state.timeout().unwrap_or_else(|| self.config.state_timeout())
    }

    fn schedule_expiry(&self, instance: &Instance) -> AbortHandle {
        let timeout = self.state_timeout(instance);
        let commands = self.commands.clone();
        let instance_id = instance.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::Expire(instance_id));
        })
        .abort_handle()
    }

    async fn apply(&self, instance: &Instance, data: &mut InstanceData, response: ExecutionResponse) {
        let ExecutionResponse {
            is_async,
            correlation_ids,
            execution_status,
            error_message,
            state_execution_data,
            context_elements,
            notify_elements,
            delegate_task_id,
            spawned,
        } = response;

        if state_execution_data.is_some() {
            data.state_execution_data = state_execution_data;
        }
        data.elements.extend(context_elements.iter().cloned());
        data.published.extend(context_elements);
        if delegate_task_id.is_some() {
            data.delegate_task_id = delegate_task_id;
        }

        if !is_async {
            self.release(instance, data, &correlation_ids).await;
            self.finish(instance, data, execution_status, error_message, notify_elements).await;
            return;
        }

        if data.expired {
            self.registry.cancel(&correlation_ids);
            if let Some(task_id) = data.delegate_task_id.take() {
                self.dispatcher.abort_task(&task_id).await;
            }
            let message = "State suspended again after it expired".to_string();
            self.finish(instance, data, ExecutionStatus::Error, Some(message), notify_elements)
                .await;
            return;
        }

        data.pending.clone_from(&correlation_ids);
        let commands = self.commands.clone();
        let instance_id = instance.id.clone();
        let waited = self.registry.wait_for_all(correlation_ids.clone(), move |responses| {
            if commands.send(Command::Resume { instance_id, responses }).is_err() {
                warn!("Resume dropped, executor stopped");
            }
        });
        if let Err(e) = waited {
            warn!(parent: &instance.span, error = %e, "Cannot wait on correlation ids");
            self.release(instance, data, &correlation_ids).await;
            self.finish(instance, data, ExecutionStatus::Error, Some(e.to_string()), notify_elements)
                .await;
            return;
        }

        debug!(parent: &instance.span, waiting_on = correlation_ids.len(), "State execution suspended");
        self.progress
            .emit(ProgressEvent::StateSuspended {
                instance_id: instance.id.clone(),
                correlation_ids,
            })
            .await;

        for child in spawned {
            self.spawn_child(instance, data, child).await;
        }
    }

    /// Releases reservations of `correlation_ids` and aborts the delegate
    /// task recorded for the instance. Ids another waiter registered stay.
    async fn release(
        &self,
        instance: &Instance,
        data: &mut InstanceData,
        correlation_ids: &[CorrelationId],
    ) {
        let released = self.registry.release(correlation_ids);
        let task_id = data.delegate_task_id.take();
        if let Some(task_id) = &task_id {
            self.dispatcher.abort_task(task_id).await;
        }
        if released > 0 || task_id.is_some() {
            debug!(
                parent: &instance.span,
                released,
                aborted_task = task_id.is_some(),
                "Work left in flight by a terminal response released"
            );
        }
    }

    async fn spawn_child(&self, instance: &Instance, data: &mut InstanceData, child: ChildInstance) {
        let ChildInstance { notify_id, state, elements } = child;
        let mut inherited = data.elements.clone();
        inherited.extend(elements);

        let parent = ParentLink { instance_id: instance.id.clone(), notify_id };
        let child_id = self
            .create_instance(state, instance.ids.clone(), inherited, instance.variables.clone(), Some(parent))
            .await;
        data.children.push(child_id.clone());

        debug!(parent: &instance.span, child_id = %child_id, "Child instance spawned");
        self.progress
            .emit(ProgressEvent::ChildSpawned {
                parent_id: instance.id.clone(),
                child_id: child_id.clone(),
            })
            .await;
        self.send(Command::Start(child_id));
    }

    async fn finish(
        &self,
        instance: &Instance,
        data: &mut InstanceData,
        status: ExecutionStatus,
        error_message: Option<String>,
        notify_elements: Vec<ContextElement>,
    ) {
        data.status = status;
        data.pending.clear();
        data.delegate_task_id = None;
        if let Some(expiry) = data.expiry.take() {
            expiry.abort();
        }

        if status.is_success() {
            info!(parent: &instance.span, "State execution succeeded");
        } else {
            warn!(
                parent: &instance.span,
                status = %status,
                error = error_message.as_deref().unwrap_or_default(),
                "State execution ended"
            );
        }
        self.progress
            .emit(ProgressEvent::StateCompleted {
                instance_id: instance.id.clone(),
                status,
                error_message: error_message.clone(),
            })
            .await;

        let outcome = InstanceOutcome {
            instance_id: instance.id.clone(),
            state_name: instance.state.name().to_string(),
            status,
            error_message: error_message.clone(),
            state_execution_data: data.state_execution_data.clone(),
            context_elements: data.published.clone(),
            notify_elements: notify_elements.clone(),
        };
        self.retire(instance, data, outcome.clone()).await;
        instance.done.send_replace(Some(outcome));

        if let Some(parent) = &instance.parent {
            let reply = ResponseData::Element { status, error_message, elements: notify_elements };
            let delivered = self.registry.notify(&parent.notify_id, reply);
            debug!(
                parent: &instance.span,
                parent_id = %parent.instance_id,
                delivered,
                "Parent notified"
            );
        }
    }
}
