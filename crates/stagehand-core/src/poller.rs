//! Cancellable local periodic task.
//!
//! Used by states that run local work on a timer while a delegate task is in
//! flight. The poller is owned by the state instance and must be shut down on
//! completion and on abort. Dropping a poller cancels it.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A periodic task running on the tokio runtime.
#[derive(Debug)]
pub struct LocalPoller {
    name: String,
    token: CancellationToken,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl LocalPoller {
    /// Starts calling `tick` every `period`, first after one full period.
    ///
    /// `tick` receives the 0-based tick number and returns
    /// `ControlFlow::Break` to stop the poller.
    ///
    /// # Arguments
    /// * `name` - Name used in diagnostics
    /// * `period` - Interval between ticks
    /// * `tick` - Work performed on each tick
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(0));

        let child = token.clone();
        let counter = Arc::clone(&ticks);
        let poller_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = child.cancelled() => {
                        debug!(poller = %poller_name, "Poller cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        if tick(n).await.is_break() {
                            debug!(poller = %poller_name, ticks = n + 1, "Poller finished");
                            break;
                        }
                    }
                }
            }
        });

        Self { name, token, ticks, handle: Some(handle) }
    }

    /// Number of ticks started so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Returns `true` once the poller was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `true` once the poller task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels the poller without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the poller and waits for its task to exit.
    ///
    /// A panicked tick is logged and otherwise ignored.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(poller = %self.name, error = %e, "Poller task ended abnormally");
        }
    }
}

impl Drop for LocalPoller {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
