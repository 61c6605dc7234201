use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use super::node::{Node, NodeStatus};

/// Name of the cluster that always exists
pub const DEFAULT_CLUSTER: &str = "Default";

/// A session id bound to the node that served it
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub node: Arc<Node>,
    pub last_used: Instant,
}

impl Session {
    pub fn new<S: Into<String>>(id: S, node: Arc<Node>) -> Self {
        Self {
            id: id.into(),
            node,
            last_used: Instant::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_used) > timeout
    }
}

/// A named group of nodes plus its session affinity table
#[derive(Debug)]
pub struct Cluster {
    name: String,
    nodes: RwLock<Vec<Arc<Node>>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Cluster {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            nodes: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the status of `host:port`, creating the node on first sight.
    /// Returns the node and whether its status changed.
    pub fn set_status(&self, host: &str, port: u16, status: NodeStatus) -> (Arc<Node>, bool) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter().find(|n| n.is_same(host, port)) {
            let changed = node.set_status(status);
            return (Arc::clone(node), changed);
        }

        let node = Arc::new(Node::with_status(host, port, status));
        nodes.push(Arc::clone(&node));
        (node, true)
    }

    pub fn find(&self, host: &str, port: u16) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.is_same(host, port))
            .cloned()
    }

    /// Remove a node and every session bound to it
    pub fn remove_node(&self, host: &str, port: u16) -> Option<Arc<Node>> {
        let removed = {
            let mut nodes = self.nodes.write();
            let idx = nodes.iter().position(|n| n.is_same(host, port))?;
            nodes.remove(idx)
        };
        self.sessions
            .lock()
            .retain(|_, session| !session.node.is_same(host, port));
        Some(removed)
    }

    /// All nodes except down nodes whose down transition is older than `timeout`
    pub fn all_nodes(&self, timeout: Duration) -> Vec<Arc<Node>> {
        let now = Instant::now();
        self.nodes
            .read()
            .iter()
            .filter(|n| !n.is_expired(timeout, now))
            .cloned()
            .collect()
    }

    pub fn available_nodes(&self, timeout: Duration) -> Vec<Arc<Node>> {
        self.all_nodes(timeout)
            .into_iter()
            .filter(|n| n.is_up())
            .collect()
    }

    pub fn add_session(&self, session_id: &str, node: Arc<Node>) {
        self.sessions
            .lock()
            .insert(session_id.to_string(), Session::new(session_id, node));
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Look up a session without refreshing it
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Look up a session and refresh its last-used timestamp
    pub fn touch_session(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(session_id)?;
        session.last_used = Instant::now();
        Some(session.clone())
    }

    pub fn remove_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().remove(session_id)
    }

    pub fn sessions_by_node(&self, node: &Node) -> Vec<Session> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.node.as_ref() == node)
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drop sessions idle for longer than `timeout`; returns how many were removed
    pub fn sweep_sessions(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(timeout, now));
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_status_upserts() {
        let cluster = Cluster::new("c");
        let (node, changed) = cluster.set_status("h", 1, NodeStatus::Up);
        assert!(changed);
        let (same, changed) = cluster.set_status("h", 1, NodeStatus::Down);
        assert!(changed);
        assert!(Arc::ptr_eq(&node, &same));
        assert_eq!(cluster.all_nodes(Duration::ZERO).len(), 1);
        assert!(cluster.available_nodes(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_remove_node_drops_its_sessions() {
        let cluster = Cluster::new("c");
        let (a, _) = cluster.set_status("a", 1, NodeStatus::Up);
        let (b, _) = cluster.set_status("b", 1, NodeStatus::Up);
        cluster.add_session("s1", a);
        cluster.add_session("s2", Arc::clone(&b));

        assert!(cluster.remove_node("a", 1).is_some());
        assert!(!cluster.contains_session("s1"));
        assert!(cluster.contains_session("s2"));
        assert_eq!(cluster.sessions_by_node(&b).len(), 1);
        assert!(cluster.remove_node("a", 1).is_none());
    }

    #[test]
    fn test_add_session_rebinds() {
        let cluster = Cluster::new("c");
        let (a, _) = cluster.set_status("a", 1, NodeStatus::Up);
        let (b, _) = cluster.set_status("b", 1, NodeStatus::Up);
        cluster.add_session("s1", a);
        cluster.add_session("s1", Arc::clone(&b));

        assert_eq!(cluster.session_count(), 1);
        assert!(Arc::ptr_eq(&cluster.session("s1").unwrap().node, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_touch() {
        let cluster = Cluster::new("c");
        let (node, _) = cluster.set_status("h", 1, NodeStatus::Up);
        cluster.add_session("old", Arc::clone(&node));
        cluster.add_session("fresh", node);

        tokio::time::advance(Duration::from_secs(90)).await;
        cluster.touch_session("fresh");
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(cluster.sweep_sessions(Duration::from_secs(120)), 1);
        assert!(!cluster.contains_session("old"));
        assert!(cluster.contains_session("fresh"));
    }
}
