//! Progress reporting for the state machine executor.
//!
//! This module broadcasts lifecycle events of state instances and keeps a
//! running metrics snapshot.

use stagehand_abstraction::{CorrelationId, ExecutionStatus, TaskId, TaskType};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Progress event types.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A state instance began `execute`.
    StateStarted {
        /// Instance ID.
        instance_id: String,
        /// State name.
        state_name: String,
    },
    /// A state instance suspended on correlation ids.
    StateSuspended {
        /// Instance ID.
        instance_id: String,
        /// Ids the instance waits on.
        correlation_ids: Vec<CorrelationId>,
    },
    /// A suspended state instance was resumed.
    StateResumed {
        /// Instance ID.
        instance_id: String,
    },
    /// A state instance reached a terminal status.
    StateCompleted {
        /// Instance ID.
        instance_id: String,
        /// Terminal status.
        status: ExecutionStatus,
        /// Diagnostic for non-success statuses.
        error_message: Option<String>,
    },
    /// A child instance was spawned by a parent.
    ChildSpawned {
        /// Parent instance ID.
        parent_id: String,
        /// Child instance ID.
        child_id: String,
    },
    /// A delegate task was queued.
    TaskQueued {
        /// Task handle.
        task_id: TaskId,
        /// Task type.
        task_type: TaskType,
        /// Correlation id the reply goes to.
        correlation_id: CorrelationId,
    },
}

/// Progress metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressMetrics {
    /// Instances currently suspended.
    pub suspended: usize,
    /// Instances that started.
    pub started: usize,
    /// Instances that ended SUCCESS.
    pub succeeded: usize,
    /// Instances that ended FAILED or ERROR.
    pub failed: usize,
    /// Instances that ended ABORTED.
    pub aborted: usize,
    /// Delegate tasks queued.
    pub tasks_queued: usize,
}

/// Progress reporter for the executor and dispatcher.
pub struct ProgressReporter {
    /// Broadcast sender for progress events.
    broadcast_tx: broadcast::Sender<ProgressEvent>,
    /// Current metrics.
    metrics: Arc<Mutex<Tally>>,
}

/// Metrics plus the instances currently counted as suspended.
#[derive(Default)]
struct Tally {
    metrics: ProgressMetrics,
    suspended: HashSet<String>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("receivers", &self.broadcast_tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a new progress reporter.
    ///
    /// # Arguments
    /// * `capacity` - Broadcast channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self { broadcast_tx, metrics: Arc::new(Mutex::new(Tally::default())) }
    }

    /// Subscribes to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Gets the current progress metrics snapshot.
    pub async fn get_snapshot(&self) -> ProgressMetrics {
        self.metrics.lock().await.metrics.clone()
    }

    /// Records the event in the metrics and broadcasts it.
    pub async fn emit(&self, event: ProgressEvent) {
        {
            let mut tally = self.metrics.lock().await;
            let Tally { metrics, suspended } = &mut *tally;
            match &event {
                ProgressEvent::StateStarted { .. } => metrics.started += 1,
                ProgressEvent::StateSuspended { instance_id, .. } => {
                    suspended.insert(instance_id.clone());
                }
                ProgressEvent::StateResumed { instance_id } => {
                    suspended.remove(instance_id);
                }
                ProgressEvent::StateCompleted { instance_id, status, .. } => {
                    // Aborted and expired instances end without a resume.
                    suspended.remove(instance_id);
                    match status {
                        ExecutionStatus::Success => metrics.succeeded += 1,
                        ExecutionStatus::Aborted => metrics.aborted += 1,
                        _ => metrics.failed += 1,
                    }
                }
                ProgressEvent::TaskQueued { .. } => metrics.tasks_queued += 1,
                ProgressEvent::ChildSpawned { .. } => {}
            }
            metrics.suspended = suspended.len();
        }

        debug!("Progress event: {:?}", event);
        let _ = self.broadcast_tx.send(event);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_reporter_new() {
        let reporter = ProgressReporter::default();
        assert_eq!(reporter.get_snapshot().await, ProgressMetrics::default());
    }

    #[tokio::test]
    async fn test_progress_reporter_events() {
        let reporter = ProgressReporter::new(8);
        let mut rx = reporter.subscribe();

        reporter
            .emit(ProgressEvent::StateStarted {
                instance_id: "i-1".to_string(),
                state_name: "Deploy".to_string(),
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProgressEvent::StateStarted { .. }));

        reporter
            .emit(ProgressEvent::StateSuspended {
                instance_id: "i-1".to_string(),
                correlation_ids: vec![CorrelationId::from("c-1")],
            })
            .await;
        reporter.emit(ProgressEvent::StateResumed { instance_id: "i-1".to_string() }).await;
        reporter
            .emit(ProgressEvent::StateCompleted {
                instance_id: "i-1".to_string(),
                status: ExecutionStatus::Failed,
                error_message: Some("exit code 1".to_string()),
            })
            .await;

        let snapshot = reporter.get_snapshot().await;
        assert_eq!(snapshot.started, 1);
        assert_eq!(snapshot.suspended, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.succeeded, 0);
    }

    #[tokio::test]
    async fn test_completion_clears_suspended_instance() {
        let reporter = ProgressReporter::new(8);
        for id in ["i-1", "i-2"] {
            reporter
                .emit(ProgressEvent::StateSuspended {
                    instance_id: id.to_string(),
                    correlation_ids: vec![CorrelationId::from("c-1")],
                })
                .await;
        }
        assert_eq!(reporter.get_snapshot().await.suspended, 2);

        reporter
            .emit(ProgressEvent::StateCompleted {
                instance_id: "i-1".to_string(),
                status: ExecutionStatus::Aborted,
                error_message: Some("State execution aborted".to_string()),
            })
            .await;
        reporter.emit(ProgressEvent::StateResumed { instance_id: "i-1".to_string() }).await;

        let snapshot = reporter.get_snapshot().await;
        assert_eq!(snapshot.suspended, 1);
        assert_eq!(snapshot.aborted, 1);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let reporter = ProgressReporter::new(1);
        reporter.emit(ProgressEvent::StateResumed { instance_id: "i-1".to_string() }).await;
        assert_eq!(reporter.get_snapshot().await.suspended, 0);
    }
}
