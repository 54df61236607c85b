//! Shutdown coordination for the gateway.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of tasks still subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Trigger shutdown and wait up to `grace` for `tasks` to finish; tasks
    /// still running afterwards are aborted. Returns how many were aborted.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, grace: Duration) -> usize {
        self.trigger();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let all = futures_util::future::join_all(tasks);

        if tokio::time::timeout(grace, all).await.is_ok() {
            return 0;
        }
        let stuck: Vec<_> = aborts.into_iter().filter(|h| !h.is_finished()).collect();
        tracing::warn!(
            grace_secs = grace.as_secs(),
            tasks = stuck.len(),
            "Shutdown grace period elapsed, aborting remaining tasks"
        );
        for handle in &stuck {
            handle.abort();
        }
        stuck.len()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
