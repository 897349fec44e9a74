//! Delegate service and activity store used together through the factory

use serde_json::json;
use stagehand_abstraction::{
    Activity, ActivityStore, CorrelationId, DelegateService, DelegateTask, ExecutionStatus,
    NotificationSink, ResponseData, TaskType,
};
use stagehand_delegate::{
    DelegateConfig, DelegateFactory, DelegateType, InMemoryActivityStore, handler_fn,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

/// Records replies and wakes the test on each one.
#[derive(Default)]
struct RecordingSink {
    replies: Mutex<Vec<(CorrelationId, ResponseData)>>,
    arrived: Notify,
}

impl NotificationSink for RecordingSink {
    fn notify(&self, correlation_id: &CorrelationId, data: ResponseData) -> bool {
        self.replies.lock().unwrap().push((correlation_id.clone(), data));
        self.arrived.notify_one();
        true
    }
}

#[tokio::test]
async fn test_command_reply_drives_activity_to_terminal_status() {
    let sink = Arc::new(RecordingSink::default());
    let config = DelegateConfig::new(DelegateType::InMemory).with_handler(
        TaskType::Command,
        handler_fn(|task| async move {
            Ok(ResponseData::success(json!({ "command": task.parameters[0]["command"] })))
        }),
    );
    let service = DelegateFactory::create(config, sink.clone()).await;
    let store = InMemoryActivityStore::new();

    let activity = assert_ok!(
        store.save(Activity::running("app", "wf", "Install", "COMMAND", "install")).await
    );
    let activity_id = activity.id.clone().unwrap();
    let wait_id = CorrelationId::generate();
    let task = DelegateTask::new(TaskType::Command, "acct", "app")
        .with_wait_id(wait_id.clone())
        .with_parameter(json!({ "command": "install" }));
    assert_ok!(service.submit(task).await);

    tokio::time::timeout(Duration::from_secs(5), sink.arrived.notified()).await.unwrap();
    let (id, reply) = sink.replies.lock().unwrap().remove(0);
    assert_eq!(id, wait_id);
    assert_eq!(reply.payload()["command"], json!("install"));

    assert!(assert_ok!(store.update_status(&activity_id, "app", reply.status()).await));
    assert!(!assert_ok!(
        store.update_status(&activity_id, "app", ExecutionStatus::Failed).await
    ));
    let stored = store.get(&activity_id, "app").await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_offline_delegate_and_unknown_activity() {
    let sink = Arc::new(RecordingSink::default());
    let service = DelegateFactory::create(DelegateConfig::new(DelegateType::Offline), sink.clone()).await;
    assert_err!(service.submit(DelegateTask::new(TaskType::Command, "acct", "app")).await);
    assert!(sink.replies.lock().unwrap().is_empty());

    let store = InMemoryActivityStore::new();
    assert_err!(store.update_status("missing", "app", ExecutionStatus::Success).await);
    assert!(store.is_empty().await);
}
