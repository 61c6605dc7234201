use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, info};

use super::manager::ClusterManager;

/// Delay before the first sweep
pub const DEFAULT_SWEEP_DELAY: Duration = Duration::from_secs(10);
/// Period between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Background task expiring idle sessions across all clusters
pub struct SessionSweeper {
    /// Handle to the running sweep task
    task_handle: Mutex<Option<JoinHandle<()>>>,
    initial_delay: Duration,
    interval: Duration,
}

impl Default for SessionSweeper {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_DELAY, DEFAULT_SWEEP_INTERVAL)
    }
}

impl SessionSweeper {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            task_handle: Mutex::new(None),
            initial_delay,
            interval,
        }
    }

    /// Start sweeping; restarts the task if it is already running
    pub fn start(&self, manager: Arc<ClusterManager>) {
        self.stop();

        let initial_delay = self.initial_delay;
        let period = self.interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            info!(
                "Starting session sweeper (delay {:?}, interval {:?}, timeout {:?})",
                initial_delay,
                period,
                manager.session_timeout()
            );

            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            loop {
                ticker.tick().await;
                let removed = manager.sweep_expired_sessions();
                debug!(removed, "Session sweep completed");
            }
        });

        *self.task_handle.lock() = Some(handle);
    }

    /// Stop the sweep task
    pub fn stop(&self) {
        if let Some(handle) = self.task_handle.lock().take() {
            handle.abort();
            info!("Session sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.get_mut().take() {
            handle.abort();
        }
    }
}
