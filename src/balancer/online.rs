use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::manager::ClusterManager;
use super::node::{Node, NodeStatus};
use crate::exchange::AttemptOutcome;
use crate::proxy::http_client;

/// 5xx answers in a row after which a node is taken down
pub const DEFAULT_FAILURE_LIMIT: u32 = 10;
/// Timeout of the request that checks whether a downed node is back
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// A node this checker took down, with the clusters it was taken down in
struct OfflineNode {
    node: Arc<Node>,
    clusters: Vec<String>,
}

/// Takes nodes down from live traffic and brings them back by pinging them
///
/// A call without an answer takes the node down at once. 5xx answers are
/// counted per node and take it down once more than `failure_limit` arrive
/// without any other answer in between. With a retry interval configured,
/// downed nodes are pinged at most once per interval and brought back up
/// when they answer below 400.
pub struct NodeOnlineChecker {
    failure_limit: u32,
    retry_interval: Option<Duration>,
    ping_timeout: Duration,
    failures: DashMap<String, u32>,
    offline: Mutex<HashMap<String, OfflineNode>>,
    last_check: Mutex<Instant>,
    checking: AtomicBool,
}

impl Default for NodeOnlineChecker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_LIMIT, None)
    }
}

impl NodeOnlineChecker {
    pub fn new(failure_limit: u32, retry_interval: Option<Duration>) -> Self {
        Self {
            failure_limit,
            retry_interval,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            failures: DashMap::new(),
            offline: Mutex::new(HashMap::new()),
            last_check: Mutex::new(Instant::now()),
            checking: AtomicBool::new(false),
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn failure_limit(&self) -> u32 {
        self.failure_limit
    }

    /// 5xx answers counted against the node since its last good answer
    pub fn failures(&self, node: &Node) -> u32 {
        self.failures.get(&node.address()).map(|c| *c).unwrap_or(0)
    }

    pub fn offline_count(&self) -> usize {
        self.offline.lock().len()
    }

    /// Account one backend call against `node`
    pub fn observe(&self, clusters: &ClusterManager, node: &Arc<Node>, outcome: AttemptOutcome) {
        let address = node.address();
        match outcome {
            AttemptOutcome::Failed => {
                self.failures.remove(&address);
                warn!(node = %node, "Node did not answer");
                self.take_down(clusters, node);
            }
            AttemptOutcome::Status(status) if status >= 500 => {
                let count = {
                    let mut count = self.failures.entry(address.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                debug!(node = %node, status, count, "Counted 5xx answer");
                if count > self.failure_limit {
                    self.failures.remove(&address);
                    warn!(node = %node, count, "Too many 5xx answers");
                    self.take_down(clusters, node);
                }
            }
            AttemptOutcome::Status(_) => {
                self.failures.remove(&address);
            }
        }
    }

    fn take_down(&self, clusters: &ClusterManager, node: &Arc<Node>) {
        if node.status() != NodeStatus::Up {
            return;
        }

        let names = clusters.clusters_with_node(node.host(), node.port());
        for name in &names {
            clusters.down(name, node.host(), node.port());
        }
        // Static endpoints are not tracked by any cluster
        if node.set_status(NodeStatus::Down) {
            info!(node = %node, "Node taken down");
        }

        self.offline.lock().insert(
            node.address(),
            OfflineNode {
                node: Arc::clone(node),
                clusters: names,
            },
        );
    }

    /// Whether a retry round is due
    pub fn is_retry_due(&self) -> bool {
        let Some(interval) = self.retry_interval else {
            return false;
        };
        !self.offline.lock().is_empty() && self.last_check.lock().elapsed() >= interval
    }

    /// Ping the nodes this checker took down and bring back those that answer.
    /// Returns how many came back.
    pub async fn revive(&self, clusters: &ClusterManager) -> usize {
        if !self.is_retry_due() || self.checking.swap(true, Ordering::AcqRel) {
            return 0;
        }
        *self.last_check.lock() = Instant::now();

        let pending: Vec<(String, Arc<Node>, Vec<String>)> = self
            .offline
            .lock()
            .iter()
            .map(|(address, o)| (address.clone(), Arc::clone(&o.node), o.clusters.clone()))
            .collect();

        let mut revived = 0;
        for (address, node, names) in pending {
            // Someone else changed it meanwhile, e.g. a take-out notification
            if node.status() != NodeStatus::Down {
                self.offline.lock().remove(&address);
                continue;
            }

            let url = format!("{}/", node.url());
            match http_client::get_status(&url, self.ping_timeout).await {
                Ok(status) if status.as_u16() < 400 => {
                    for name in &names {
                        clusters.up(name, node.host(), node.port());
                    }
                    node.set_status(NodeStatus::Up);
                    self.offline.lock().remove(&address);
                    info!(node = %node, "Node back online");
                    revived += 1;
                }
                Ok(status) => debug!(node = %node, status = %status, "Node still failing"),
                Err(e) => debug!(node = %node, error = %e, "Node still unreachable"),
            }
        }

        self.checking.store(false, Ordering::Release);
        revived
    }

    /// Run [`revive`](Self::revive) on a spawned task when a retry round is due
    pub fn revive_in_background(self: &Arc<Self>, clusters: Arc<ClusterManager>) {
        if !self.is_retry_due() {
            return;
        }
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            checker.revive(&clusters).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_5xx_limit_takes_node_down() {
        let clusters = ClusterManager::default();
        let node = clusters.up("c", "a", 1);
        let checker = NodeOnlineChecker::new(3, None);

        for _ in 0..3 {
            checker.observe(&clusters, &node, AttemptOutcome::Status(503));
        }
        assert!(node.is_up());
        assert_eq!(checker.failures(&node), 3);

        checker.observe(&clusters, &node, AttemptOutcome::Status(500));
        assert_eq!(node.status(), NodeStatus::Down);
        assert!(clusters.get_available_nodes("c", Duration::ZERO).is_empty());
        assert_eq!(checker.offline_count(), 1);
    }

    #[test]
    fn test_good_answer_resets_count() {
        let clusters = ClusterManager::default();
        let node = clusters.up("c", "a", 1);
        let checker = NodeOnlineChecker::new(2, None);

        checker.observe(&clusters, &node, AttemptOutcome::Status(500));
        checker.observe(&clusters, &node, AttemptOutcome::Status(502));
        checker.observe(&clusters, &node, AttemptOutcome::Status(404));
        checker.observe(&clusters, &node, AttemptOutcome::Status(500));

        assert!(node.is_up());
        assert_eq!(checker.failures(&node), 1);
    }

    #[test]
    fn test_failed_call_takes_node_down_everywhere() {
        let clusters = ClusterManager::default();
        let node = clusters.up("c1", "a", 1);
        clusters.up("c2", "a", 1);
        let checker = NodeOnlineChecker::default();

        checker.observe(&clusters, &node, AttemptOutcome::Failed);

        assert!(clusters.get_available_nodes("c1", Duration::ZERO).is_empty());
        assert!(clusters.get_available_nodes("c2", Duration::ZERO).is_empty());
    }

    #[test]
    fn test_static_node_taken_down() {
        let clusters = ClusterManager::default();
        let node = Arc::new(Node::new("a", 1));
        let checker = NodeOnlineChecker::default();

        checker.observe(&clusters, &node, AttemptOutcome::Failed);
        assert_eq!(node.status(), NodeStatus::Down);
        assert!(clusters.clusters_with_node("a", 1).is_empty());
    }

    #[tokio::test]
    async fn test_revive_after_retry_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let address = server.address();

        let clusters = ClusterManager::default();
        let node = clusters.up("c", &address.ip().to_string(), address.port());
        let checker = NodeOnlineChecker::new(10, Some(Duration::from_millis(50)));

        checker.observe(&clusters, &node, AttemptOutcome::Failed);
        assert_eq!(node.status(), NodeStatus::Down);

        // Not due yet
        assert_eq!(checker.revive(&clusters).await, 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(checker.revive(&clusters).await, 1);
        assert!(node.is_up());
        assert_eq!(clusters.get_available_nodes("c", Duration::ZERO).len(), 1);
        assert_eq!(checker.offline_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_node_stays_down() {
        let clusters = ClusterManager::default();
        let node = clusters.up("c", "127.0.0.1", 1);
        let checker = NodeOnlineChecker::new(10, Some(Duration::ZERO))
            .with_ping_timeout(Duration::from_millis(200));

        checker.observe(&clusters, &node, AttemptOutcome::Failed);
        assert_eq!(checker.revive(&clusters).await, 0);
        assert_eq!(node.status(), NodeStatus::Down);
        assert_eq!(checker.offline_count(), 1);
    }

    #[tokio::test]
    async fn test_taken_out_node_is_not_revived() {
        let clusters = ClusterManager::default();
        let node = clusters.up("c", "127.0.0.1", 1);
        let checker = NodeOnlineChecker::new(10, Some(Duration::ZERO));

        checker.observe(&clusters, &node, AttemptOutcome::Failed);
        clusters.takeout("c", "127.0.0.1", 1);

        assert_eq!(checker.revive(&clusters).await, 0);
        assert_eq!(node.status(), NodeStatus::TakeOut);
        assert_eq!(checker.offline_count(), 0);
    }
}
