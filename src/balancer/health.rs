use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, info, warn};

use super::manager::ClusterManager;
use super::node::NodeStatus;
use crate::proxy::http_client;

/// Delay before the first health check
pub const DEFAULT_HEALTH_DELAY: Duration = Duration::from_secs(5);
/// Period between health checks
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
/// Timeout of a single health request
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Background task that checks every node of every cluster
///
/// Each round sends `GET <node><path>` to all nodes. A node answering below
/// 300 is healthy and brought up if it was down; any other answer or no
/// answer takes it down. Taken-out nodes are left alone.
pub struct HealthMonitor {
    /// Handle to the running check task
    task_handle: Mutex<Option<JoinHandle<()>>>,
    initial_delay: Duration,
    interval: Duration,
    timeout: Duration,
    path: String,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_DELAY, DEFAULT_HEALTH_INTERVAL)
    }
}

impl HealthMonitor {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            task_handle: Mutex::new(None),
            initial_delay,
            interval,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            path: "/".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Start checking; restarts the task if it is already running
    pub fn start(&self, manager: Arc<ClusterManager>) {
        self.stop();

        let initial_delay = self.initial_delay;
        let period = self.interval.max(Duration::from_millis(1));
        let timeout = self.timeout;
        let path = self.path.clone();

        let handle = tokio::spawn(async move {
            info!(
                "Starting health monitor (delay {:?}, interval {:?}, path {})",
                initial_delay, period, path
            );

            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            loop {
                ticker.tick().await;
                let changed = check_clusters(&manager, &path, timeout).await;
                debug!(changed, "Health check completed");
            }
        });

        *self.task_handle.lock() = Some(handle);
    }

    /// Stop the check task
    pub fn stop(&self) {
        if let Some(handle) = self.task_handle.lock().take() {
            handle.abort();
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Run one health round over all clusters; returns how many nodes changed status
pub async fn check_clusters(manager: &ClusterManager, path: &str, timeout: Duration) -> usize {
    let mut changed = 0;
    for cluster in manager.cluster_names() {
        for node in manager.get_all_nodes(&cluster, Duration::ZERO) {
            if node.status() == NodeStatus::TakeOut {
                continue;
            }

            let url = format!("{}{}", node.url(), path);
            let healthy = match http_client::get_status(&url, timeout).await {
                Ok(status) => status.as_u16() < 300,
                Err(e) => {
                    debug!(cluster = %cluster, node = %node, error = %e, "Health request failed");
                    false
                }
            };

            let status = if healthy { NodeStatus::Up } else { NodeStatus::Down };
            if node.status() != status {
                if !healthy {
                    warn!(cluster = %cluster, node = %node, "Node failed health check");
                }
                manager.set_status(&cluster, node.host(), node.port(), status);
                changed += 1;
            }
        }
    }
    changed
}
