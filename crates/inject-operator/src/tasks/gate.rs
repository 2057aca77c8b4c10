//! Single-flight gate for bulk cluster-level operations

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Allows one bulk operation at a time, tracked as a count of live workers.
///
/// Stopping is cooperative: workers poll [`ClusterTaskGate::is_stopping`]
/// between creations and call [`ClusterTaskGate::finish_one`] on exit.
#[derive(Debug, Default)]
pub struct ClusterTaskGate {
    running: AtomicI64,
    stopping: AtomicBool,
}

impl ClusterTaskGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a run of `workers` workers. Fails fast if another run is live.
    pub fn try_run(&self, workers: i64) -> bool {
        if workers <= 0 || self.stopping.load(Ordering::SeqCst) {
            return false;
        }

        self.running
            .compare_exchange(0, workers, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Called by each worker of the current run when it exits.
    pub fn finish_one(&self) {
        let previous = self.running.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            self.running.store(0, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Signal the current run to stop and wait until every worker has exited.
    pub async fn stop(&self, poll_interval: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        info!(
            running = self.running.load(Ordering::SeqCst),
            "Stopping cluster task"
        );

        while self.is_running() {
            debug!(
                running = self.running.load(Ordering::SeqCst),
                "Waiting for cluster task workers to exit"
            );
            tokio::time::sleep(poll_interval).await;
        }

        self.stopping.store(false, Ordering::SeqCst);
        info!("Cluster task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_flight() {
        let gate = ClusterTaskGate::new();
        assert!(gate.try_run(2));
        assert!(!gate.try_run(1));
        assert!(gate.is_running());

        gate.finish_one();
        assert!(gate.is_running());
        gate.finish_one();
        assert!(!gate.is_running());
        assert!(gate.try_run(1));
    }

    #[test]
    fn test_rejects_empty_run() {
        let gate = ClusterTaskGate::new();
        assert!(!gate.try_run(0));
        assert!(!gate.is_running());
    }

    #[test]
    fn test_finish_never_goes_negative() {
        let gate = ClusterTaskGate::new();
        gate.finish_one();
        assert!(!gate.is_running());
        assert!(gate.try_run(1));
    }

    #[tokio::test]
    async fn test_stop_waits_for_workers() {
        let gate = Arc::new(ClusterTaskGate::new());
        assert!(gate.try_run(1));

        let worker = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                while !gate.is_stopping() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                gate.finish_one();
            })
        };

        gate.stop(Duration::from_millis(5)).await;
        worker.await.unwrap();

        assert!(!gate.is_running());
        assert!(!gate.is_stopping());
    }

    #[tokio::test]
    async fn test_stop_without_run_returns_immediately() {
        let gate = ClusterTaskGate::new();
        gate.stop(Duration::from_millis(5)).await;
        assert!(!gate.is_stopping());
    }
}
