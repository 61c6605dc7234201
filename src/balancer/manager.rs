use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::cluster::{Cluster, Session, DEFAULT_CLUSTER};
use super::node::{Node, NodeStatus};
use crate::error::{WaypointError, WaypointResult};

/// Default idle time after which a session binding is dropped
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Receives node status changes published by the [`ClusterManager`]
pub trait ClusterListener: Send + Sync {
    fn node_status_changed(&self, cluster: &str, node: &Arc<Node>, status: NodeStatus);

    fn node_removed(&self, _cluster: &str, _node: &Arc<Node>) {}
}

/// Tracks named clusters of backend nodes and their session bindings
///
/// Clusters are created on first use. Each cluster guards its own node list
/// and session table, so work on one cluster never blocks another.
pub struct ClusterManager {
    clusters: DashMap<String, Arc<Cluster>>,
    session_timeout: Duration,
    listeners: RwLock<Vec<Arc<dyn ClusterListener>>>,
}

impl Default for ClusterManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl ClusterManager {
    pub fn new(session_timeout: Duration) -> Self {
        let clusters = DashMap::new();
        clusters.insert(
            DEFAULT_CLUSTER.to_string(),
            Arc::new(Cluster::new(DEFAULT_CLUSTER)),
        );
        Self {
            clusters,
            session_timeout,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn ClusterListener>> {
        self.listeners.read().clone()
    }

    /// Get or create the named cluster
    pub fn cluster(&self, name: &str) -> Arc<Cluster> {
        if let Some(cluster) = self.clusters.get(name) {
            return Arc::clone(cluster.value());
        }
        let cluster = self
            .clusters
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(cluster = %name, "Creating cluster");
                Arc::new(Cluster::new(name))
            });
        Arc::clone(cluster.value())
    }

    fn existing(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|c| Arc::clone(c.value()))
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn up(&self, cluster: &str, host: &str, port: u16) -> Arc<Node> {
        self.set_status(cluster, host, port, NodeStatus::Up)
    }

    pub fn down(&self, cluster: &str, host: &str, port: u16) -> Arc<Node> {
        self.set_status(cluster, host, port, NodeStatus::Down)
    }

    pub fn takeout(&self, cluster: &str, host: &str, port: u16) -> Arc<Node> {
        self.set_status(cluster, host, port, NodeStatus::TakeOut)
    }

    pub fn set_status(&self, cluster: &str, host: &str, port: u16, status: NodeStatus) -> Arc<Node> {
        let (node, changed) = self.cluster(cluster).set_status(host, port, status);
        if changed {
            info!(cluster = %cluster, node = %node, status = %status, "Node status changed");
            for listener in self.listeners() {
                listener.node_status_changed(cluster, &node, status);
            }
        }
        node
    }

    /// Names of the clusters that list `host:port`
    pub fn clusters_with_node(&self, host: &str, port: u16) -> Vec<String> {
        let mut names: Vec<String> = self
            .clusters
            .iter()
            .filter(|c| c.value().find(host, port).is_some())
            .map(|c| c.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn remove_node(&self, cluster: &str, host: &str, port: u16) -> Option<Arc<Node>> {
        let node = self.existing(cluster)?.remove_node(host, port)?;
        info!(cluster = %cluster, node = %node, "Node removed");
        for listener in self.listeners() {
            listener.node_removed(cluster, &node);
        }
        Some(node)
    }

    /// Remove a whole cluster. The default cluster cannot be removed.
    pub fn remove_cluster(&self, name: &str) -> WaypointResult<bool> {
        if name == DEFAULT_CLUSTER {
            return Err(WaypointError::inconsistency(format!(
                "Cluster '{}' cannot be removed",
                DEFAULT_CLUSTER
            )));
        }
        let removed = self.clusters.remove(name).is_some();
        if removed {
            info!(cluster = %name, "Cluster removed");
        }
        Ok(removed)
    }

    /// All known nodes, excluding down nodes that went down more than `timeout` ago
    pub fn get_all_nodes(&self, cluster: &str, timeout: Duration) -> Vec<Arc<Node>> {
        self.existing(cluster)
            .map(|c| c.all_nodes(timeout))
            .unwrap_or_default()
    }

    /// Nodes that are currently up
    pub fn get_available_nodes(&self, cluster: &str, timeout: Duration) -> Vec<Arc<Node>> {
        self.existing(cluster)
            .map(|c| c.available_nodes(timeout))
            .unwrap_or_default()
    }

    pub fn add_session(&self, cluster: &str, session_id: &str, node: Arc<Node>) {
        debug!(cluster = %cluster, session = %session_id, node = %node, "Binding session");
        self.cluster(cluster).add_session(session_id, node);
    }

    pub fn contains_session(&self, cluster: &str, session_id: &str) -> bool {
        self.existing(cluster)
            .is_some_and(|c| c.contains_session(session_id))
    }

    /// Node a session is bound to, without refreshing the session
    pub fn bound_node(&self, cluster: &str, session_id: &str) -> Option<Arc<Node>> {
        self.existing(cluster)?.session(session_id).map(|s| s.node)
    }

    /// Look up a session binding, refreshing its last-used time
    pub fn get_session(&self, cluster: &str, session_id: &str) -> Option<Session> {
        self.existing(cluster)?.touch_session(session_id)
    }

    pub fn remove_session(&self, cluster: &str, session_id: &str) -> Option<Session> {
        self.existing(cluster)?.remove_session(session_id)
    }

    pub fn get_sessions_by_node(&self, cluster: &str, node: &Node) -> Vec<Session> {
        self.existing(cluster)
            .map(|c| c.sessions_by_node(node))
            .unwrap_or_default()
    }

    /// Expire idle sessions in every cluster, one cluster lock at a time
    pub fn sweep_expired_sessions(&self) -> usize {
        let clusters: Vec<Arc<Cluster>> = self
            .clusters
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();

        let mut total = 0;
        for cluster in clusters {
            let removed = cluster.sweep_sessions(self.session_timeout);
            if removed > 0 {
                debug!(cluster = %cluster.name(), removed, "Expired sessions");
            }
            total += removed;
        }
        total
    }

    /// Seed a cluster with nodes from configuration
    pub fn register(&self, cluster: &str, nodes: &[(String, u16, NodeStatus)]) {
        for (host, port, status) in nodes {
            self.set_status(cluster, host, *port, *status);
        }
        if nodes.is_empty() {
            warn!(cluster = %cluster, "Cluster declared without nodes");
            self.cluster(cluster);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(AtomicUsize);

    impl ClusterListener for CountingListener {
        fn node_status_changed(&self, _cluster: &str, _node: &Arc<Node>, _status: NodeStatus) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_cluster_exists() {
        let manager = ClusterManager::default();
        assert_eq!(manager.cluster_names(), vec![DEFAULT_CLUSTER.to_string()]);
        assert!(manager.remove_cluster(DEFAULT_CLUSTER).is_err());
    }

    #[test]
    fn test_clusters_are_case_sensitive() {
        let manager = ClusterManager::default();
        manager.up("Orders", "h", 1);
        assert_eq!(manager.get_available_nodes("Orders", Duration::ZERO).len(), 1);
        assert!(manager.get_available_nodes("orders", Duration::ZERO).is_empty());
    }

    #[test]
    fn test_takeout_keeps_node_out_of_available_set() {
        let manager = ClusterManager::default();
        manager.up("c", "a", 1);
        manager.takeout("c", "a", 1);

        assert!(manager.get_available_nodes("c", Duration::ZERO).is_empty());
        assert_eq!(manager.get_all_nodes("c", Duration::from_secs(1)).len(), 1);
    }

    #[test]
    fn test_listeners_only_see_changes() {
        let manager = ClusterManager::default();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        manager.add_listener(listener.clone());

        manager.up("c", "a", 1);
        manager.up("c", "a", 1);
        manager.down("c", "a", 1);

        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clusters_with_node() {
        let manager = ClusterManager::default();
        manager.up("b", "h", 1);
        manager.down("a", "h", 1);
        manager.up("a", "other", 1);

        assert_eq!(manager.clusters_with_node("h", 1), vec!["a", "b"]);
        assert!(manager.clusters_with_node("h", 2).is_empty());
    }

    #[test]
    fn test_remove_cluster() {
        let manager = ClusterManager::default();
        manager.up("c", "a", 1);
        assert!(manager.remove_cluster("c").unwrap());
        assert!(!manager.remove_cluster("c").unwrap());
        assert!(manager.get_all_nodes("c", Duration::ZERO).is_empty());
    }
}
