//! End-to-end tests for repeat fan-out
//!
//! A repeat state runs a command per host through the engine; the in-memory
//! delegate decides the command result from the rendered host argument.

use serde_json::{Value, json};
use stagehand_abstraction::{DelegateError, DelegateTask, ExecutionStatus, ResponseData, TaskType};
use stagehand_core::states::CommandState;
use stagehand_core::{
    Engine, EngineConfig, ExecutionIds, ExecutionStrategy, RepeatState, StartRequest, State,
};
use stagehand_delegate::{DelegateConfig, DelegateType, InMemoryActivityStore, handler_fn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    engine: Engine,
    store: InMemoryActivityStore,
    hosts_run: Arc<Mutex<Vec<String>>>,
    max_in_flight: Arc<AtomicUsize>,
}

fn host_of(task: &DelegateTask) -> String {
    task.parameters[0]["arguments"][0].as_str().unwrap_or_default().to_string()
}

async fn harness(delay: Duration) -> Harness {
    let hosts_run = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let (run, current, max) = (hosts_run.clone(), in_flight.clone(), max_in_flight.clone());
    let handler = handler_fn(move |task| {
        let (run, current, max) = (run.clone(), current.clone(), max.clone());
        async move {
            let host = host_of(&task);
            run.lock().unwrap().push(host.clone());
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            current.fetch_sub(1, Ordering::SeqCst);

            if host.starts_with("bad") {
                Ok::<_, DelegateError>(ResponseData::failure(format!("install failed on {host}")))
            } else {
                Ok(ResponseData::success(json!({ "host": host })))
            }
        }
    });

    let store = InMemoryActivityStore::new();
    let engine = Engine::start_with_store(
        EngineConfig::default(),
        DelegateConfig::new(DelegateType::InMemory).with_handler(TaskType::Command, handler),
        Arc::new(store.clone()),
    )
    .await
    .unwrap();

    Harness { engine, store, hosts_run, max_in_flight }
}

impl Harness {
    fn template(&self) -> Arc<dyn State> {
        Arc::new(
            CommandState::new(
                "Install",
                "install",
                self.engine.recorder().clone(),
                self.engine.dispatcher().clone(),
            )
            .with_argument("${repeat_element}"),
        )
    }

    fn request(hosts: &[&str], extra: Value) -> StartRequest {
        let mut variables = json!({ "hosts": hosts });
        if let (Some(vars), Value::Object(extra)) = (variables.as_object_mut(), extra) {
            vars.extend(extra);
        }
        StartRequest::new(ExecutionIds::new("acct", "app", "wf")).with_variables(variables)
    }

    fn hosts_run(&self) -> Vec<String> {
        self.hosts_run.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_parallel_fan_out_reports_first_failure() {
    let h = harness(Duration::from_millis(20)).await;
    let repeat = RepeatState::new("Install all", "${hosts}", h.template())
        .with_strategy(ExecutionStrategy::Parallel);
    let hosts = ["h0", "h1", "bad2", "h3", "h4"];

    let id = h.engine.run_state(Arc::new(repeat), Harness::request(&hosts, json!({}))).await.unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("Repeat element 2 finished with FAILED: install failed on bad2")
    );
    assert_eq!(h.hosts_run().len(), 5);
    assert_eq!(h.engine.executor().children(&id).await.len(), 5);
    assert!(h.max_in_flight.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_parallel_fan_out_all_success() {
    let h = harness(Duration::from_millis(5)).await;
    let repeat = RepeatState::new("Install all", "${hosts}", h.template())
        .with_strategy(ExecutionStrategy::Parallel);

    let id = h
        .engine
        .run_state(Arc::new(repeat), Harness::request(&["h0", "h1", "h2"], json!({})))
        .await
        .unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.error_message, None);

    let activities = h.store.all().await;
    assert_eq!(activities.len(), 3);
    assert!(activities.iter().all(|a| a.status == ExecutionStatus::Success));
}

#[tokio::test]
async fn test_serial_short_circuits_at_first_failure() {
    let h = harness(Duration::from_millis(5)).await;
    let repeat = RepeatState::new("Install one by one", "${hosts}", h.template())
        .with_strategy(ExecutionStrategy::Serial);
    let hosts = ["h0", "h1", "bad2", "h3", "h4", "h5"];

    let id = h.engine.run_state(Arc::new(repeat), Harness::request(&hosts, json!({}))).await.unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(h.hosts_run(), vec!["h0", "h1", "bad2"]);
    assert_eq!(h.engine.executor().children(&id).await.len(), 3);
    assert_eq!(h.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_serial_runs_every_element_in_order() {
    let h = harness(Duration::from_millis(5)).await;
    let repeat = RepeatState::new("Install one by one", "${hosts}", h.template())
        .with_strategy(ExecutionStrategy::Serial);
    let hosts = ["h0", "h1", "h2", "h3"];

    let id = h.engine.run_state(Arc::new(repeat), Harness::request(&hosts, json!({}))).await.unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(h.hosts_run(), hosts.to_vec());
    assert_eq!(h.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unresolved_strategy_falls_back_to_serial() {
    let h = harness(Duration::from_millis(10)).await;
    let repeat = RepeatState::new("Install", "${hosts}", h.template())
        .with_strategy_expression("${workflow.strategy}");

    let id = h
        .engine
        .run_state(Arc::new(repeat), Harness::request(&["h0", "h1", "h2"], json!({})))
        .await
        .unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(h.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.hosts_run(), vec!["h0", "h1", "h2"]);
}

#[tokio::test]
async fn test_strategy_expression_selects_parallel() {
    let h = harness(Duration::from_millis(50)).await;
    let repeat = RepeatState::new("Install", "${hosts}", h.template())
        .with_strategy_expression("${strategy}");

    let id = h
        .engine
        .run_state(
            Arc::new(repeat),
            Harness::request(&["h0", "h1", "h2"], json!({ "strategy": "parallel" })),
        )
        .await
        .unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert!(h.max_in_flight.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_empty_collection_spawns_nothing() {
    let h = harness(Duration::ZERO).await;
    let repeat = RepeatState::new("Install", "${hosts}", h.template())
        .with_strategy(ExecutionStrategy::Parallel);

    let id = h.engine.run_state(Arc::new(repeat), Harness::request(&[], json!({}))).await.unwrap();
    let outcome = h.engine.wait(&id).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert!(h.engine.executor().children(&id).await.is_empty());
    assert!(h.hosts_run().is_empty());
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_nested_repeat_runs_every_target() {
    let h = harness(Duration::ZERO).await;
    let inner = RepeatState::new("Per host", "${repeat_element.targets}", h.template())
        .with_strategy(ExecutionStrategy::Parallel);
    let outer = RepeatState::new("Per cluster", "${clusters}", Arc::new(inner))
        .with_strategy(ExecutionStrategy::Serial);

    let request = StartRequest::new(ExecutionIds::new("acct", "app", "wf")).with_variables(json!({
        "clusters": [
            { "name": "east", "targets": ["e0", "e1"] },
            { "name": "west", "targets": ["w0"] },
        ],
    }));
    let id = h.engine.run_state(Arc::new(outer), request).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), h.engine.wait(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    let mut run = h.hosts_run();
    run.sort();
    assert_eq!(run, vec!["e0", "e1", "w0"]);
}
