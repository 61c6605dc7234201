use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::time::{Duration, Instant};
use url::Url;

use crate::error::{WaypointError, WaypointResult};

/// Availability of a backend node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Up,
    Down,
    /// Excluded from new dispatches, existing sessions keep being served
    TakeOut,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Up => write!(f, "UP"),
            NodeStatus::Down => write!(f, "DOWN"),
            NodeStatus::TakeOut => write!(f, "TAKEOUT"),
        }
    }
}

#[derive(Debug)]
struct NodeState {
    status: NodeStatus,
    last_up: Option<Instant>,
    last_transition: Instant,
}

/// Point-in-time view of a node's counters
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub address: String,
    pub status: NodeStatus,
    pub requests: u64,
    pub in_flight: usize,
    pub errors: u64,
    pub status_codes: BTreeMap<u16, u64>,
}

/// A backend endpoint and its health record
///
/// Identity is `(host, port)`; status and counters are interior-mutable so a
/// node can be shared between a cluster, sessions and in-flight exchanges.
#[derive(Debug)]
pub struct Node {
    scheme: String,
    host: String,
    port: u16,
    state: RwLock<NodeState>,
    requests: AtomicU64,
    in_flight: AtomicUsize,
    errors: AtomicU64,
    status_codes: Mutex<BTreeMap<u16, u64>>,
}

impl Node {
    /// Create a node that starts out up
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self::with_status(host, port, NodeStatus::Up)
    }

    pub fn with_status<S: Into<String>>(host: S, port: u16, status: NodeStatus) -> Self {
        let now = Instant::now();
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
            state: RwLock::new(NodeState {
                status,
                last_up: (status == NodeStatus::Up).then_some(now),
                last_transition: now,
            }),
            requests: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            errors: AtomicU64::new(0),
            status_codes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Parse an endpoint given either as `host:port` or as an absolute URL
    pub fn parse(endpoint: &str) -> WaypointResult<Self> {
        let candidate = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };

        let url = Url::parse(&candidate)
            .map_err(|e| WaypointError::config(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| WaypointError::config(format!("Endpoint '{}' has no host", endpoint)))?;
        let port = url.port_or_known_default().ok_or_else(|| {
            WaypointError::config(format!("Endpoint '{}' has no port", endpoint))
        })?;

        let mut node = Node::new(host.trim_start_matches('[').trim_end_matches(']'), port);
        node.scheme = url.scheme().to_string();
        Ok(node)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `host:port`, used as the key for per-endpoint bookkeeping
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL of the node without a trailing slash
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.address())
    }

    /// Full destination URL for the given path and query
    pub fn destination_url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.url(), path_and_query)
        } else {
            format!("{}/{}", self.url(), path_and_query)
        }
    }

    /// Whether `destination` is a URL on this node
    pub fn serves(&self, destination: &str) -> bool {
        destination
            .strip_prefix(&self.url())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(|c: char| c == '/' || c == '?'))
    }

    pub fn is_same(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    pub fn is_up(&self) -> bool {
        self.status() == NodeStatus::Up
    }

    /// Record a status change; returns true if the status actually changed
    pub fn set_status(&self, status: NodeStatus) -> bool {
        let now = Instant::now();
        let mut state = self.state.write();
        if status == NodeStatus::Up {
            state.last_up = Some(now);
        }
        if state.status == status {
            return false;
        }
        state.status = status;
        state.last_transition = now;
        true
    }

    pub fn last_up(&self) -> Option<Instant> {
        self.state.read().last_up
    }

    pub fn last_transition(&self) -> Instant {
        self.state.read().last_transition
    }

    /// Whether a down node has stayed down for longer than `timeout`.
    /// A zero timeout never expires.
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        if timeout.is_zero() {
            return false;
        }
        let state = self.state.read();
        state.status == NodeStatus::Down && now.duration_since(state.last_transition) > timeout
    }

    /// Account for an exchange dispatched to this node
    pub fn add_thread(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_thread(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_status(&self, status: u16) {
        *self.status_codes.lock().entry(status).or_insert(0) += 1;
        if status >= 500 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            address: self.address(),
            status: self.status(),
            requests: self.requests(),
            in_flight: self.in_flight(),
            errors: self.errors.load(Ordering::Relaxed),
            status_codes: self.status_codes.lock().clone(),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        let node = Node::parse("backend:8080").unwrap();
        assert_eq!(node.host(), "backend");
        assert_eq!(node.port(), 8080);
        assert_eq!(node.url(), "http://backend:8080");

        let node = Node::parse("https://secure.example.com").unwrap();
        assert_eq!(node.port(), 443);
        assert_eq!(node.scheme(), "https");

        assert!(Node::parse("http://").is_err());
    }

    #[test]
    fn test_identity_ignores_status() {
        let a = Node::new("h", 1);
        let b = Node::with_status("h", 1, NodeStatus::Down);
        assert_eq!(a, b);
        assert_ne!(a, Node::new("h", 2));
    }

    #[test]
    fn test_destination_url() {
        let node = Node::new("10.0.0.1", 9000);
        assert_eq!(
            node.destination_url("/service?id=1"),
            "http://10.0.0.1:9000/service?id=1"
        );
    }

    #[test]
    fn test_serves_only_own_urls() {
        let node = Node::new("10.0.0.1", 80);
        assert!(node.serves("http://10.0.0.1:80/service"));
        assert!(node.serves("http://10.0.0.1:80"));
        assert!(!node.serves("http://10.0.0.1:8080/service"));
        assert!(!node.serves("https://10.0.0.1:80/service"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_node_expiry() {
        let node = Node::new("h", 1);
        assert!(node.set_status(NodeStatus::Down));
        assert!(!node.set_status(NodeStatus::Down));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!node.is_expired(Duration::from_secs(10), Instant::now()));
        assert!(node.is_expired(Duration::from_secs(4), Instant::now()));
        assert!(!node.is_expired(Duration::ZERO, Instant::now()));
    }

    #[test]
    fn test_counters() {
        let node = Node::new("h", 1);
        node.add_thread();
        node.add_thread();
        node.remove_thread();
        node.record_status(200);
        node.record_status(503);
        node.remove_thread();
        node.remove_thread();

        let stats = node.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.status_codes.get(&503), Some(&1));
    }
}
