use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::scheduler::WorkerPool;

/// Periodically refreshes a worker's liveness in the pool
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Run until shutdown or until the worker is deregistered
    pub async fn run(&self, worker_id: u64, pool: Arc<WorkerPool>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if pool.heartbeat(worker_id).is_err() {
                        tracing::debug!(worker_id, "Worker gone, stopping heartbeats");
                        break;
                    }
                }
            }
        }
    }
}

/// Marks workers offline once their heartbeats stop arriving.
pub struct LivenessMonitor {
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub async fn run(&self, pool: Arc<WorkerPool>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let stale = pool.sweep_stale();
                    if !stale.is_empty() {
                        tracing::warn!(workers = ?stale, "Heartbeats missed, workers marked offline");
                    }
                }
            }
        }
    }
}
