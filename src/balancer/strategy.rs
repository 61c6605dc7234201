use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::node::Node;
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::{AttemptOutcome, Cancellation};

/// Policy choosing one endpoint out of a candidate list
#[async_trait]
pub trait DispatchingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Pick an endpoint. May wait, but must give up when `cancellation` fires.
    async fn select(
        &self,
        endpoints: &[Arc<Node>],
        cancellation: &Cancellation,
    ) -> WaypointResult<Arc<Node>>;

    /// Called once processing against the selected endpoint is over
    fn release(&self, _node: &Node) {}

    /// Outcome of a backend call against one of the endpoints, including fail-over calls
    fn report(&self, _node: &Node, _outcome: AttemptOutcome) {}
}

/// Cycles through the endpoint list in order
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: Mutex<usize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchingStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        "round_robin"
    }

    async fn select(
        &self,
        endpoints: &[Arc<Node>],
        _cancellation: &Cancellation,
    ) -> WaypointResult<Arc<Node>> {
        if endpoints.is_empty() {
            return Err(WaypointError::empty_endpoints(
                "round robin selection over an empty endpoint list",
            ));
        }

        let mut cursor = self.cursor.lock();
        // The list may have shrunk since the last call
        let index = *cursor % endpoints.len();
        *cursor = (index + 1) % endpoints.len();
        Ok(Arc::clone(&endpoints[index]))
    }
}

/// Default cap of concurrent exchanges per endpoint
pub const DEFAULT_MAX_PER_ENDPOINT: usize = 5;
/// Default wait between attempts when every endpoint is at its cap
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Number of attempts before giving up
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Bounded concurrency per endpoint
///
/// Picks the first endpoint in list order whose in-flight count is below the
/// cap. When all are saturated it waits `retry_delay` and tries again, up to
/// `attempts` times, then fails with `DispatchExhausted`.
#[derive(Debug)]
pub struct ByThreadStrategy {
    max_per_endpoint: usize,
    retry_delay: Duration,
    attempts: u32,
    in_flight: DashMap<String, usize>,
}

impl Default for ByThreadStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_ENDPOINT, DEFAULT_RETRY_DELAY)
    }
}

impl ByThreadStrategy {
    pub fn new(max_per_endpoint: usize, retry_delay: Duration) -> Self {
        Self {
            max_per_endpoint: max_per_endpoint.max(1),
            retry_delay,
            attempts: DEFAULT_ATTEMPTS,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn max_per_endpoint(&self) -> usize {
        self.max_per_endpoint
    }

    /// Current in-flight count for a node
    pub fn in_flight(&self, node: &Node) -> usize {
        self.in_flight
            .get(&node.address())
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn try_acquire(&self, endpoints: &[Arc<Node>]) -> Option<Arc<Node>> {
        for node in endpoints {
            let mut count = self.in_flight.entry(node.address()).or_insert(0);
            if *count < self.max_per_endpoint {
                *count += 1;
                return Some(Arc::clone(node));
            }
        }
        None
    }
}

#[async_trait]
impl DispatchingStrategy for ByThreadStrategy {
    fn name(&self) -> &str {
        "by_thread"
    }

    async fn select(
        &self,
        endpoints: &[Arc<Node>],
        cancellation: &Cancellation,
    ) -> WaypointResult<Arc<Node>> {
        if endpoints.is_empty() {
            return Err(WaypointError::empty_endpoints(
                "by-thread selection over an empty endpoint list",
            ));
        }

        for attempt in 1..=self.attempts {
            if cancellation.is_cancelled() {
                return Err(WaypointError::cancelled("endpoint selection"));
            }

            if let Some(node) = self.try_acquire(endpoints) {
                return Ok(node);
            }

            if attempt < self.attempts {
                debug!(
                    attempt,
                    delay = ?self.retry_delay,
                    "All endpoints at capacity, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = cancellation.cancelled() => {
                        return Err(WaypointError::cancelled("endpoint selection"));
                    }
                }
            }
        }

        warn!(
            attempts = self.attempts,
            endpoints = endpoints.len(),
            "No endpoint with free capacity"
        );
        Err(WaypointError::dispatch_exhausted(self.attempts))
    }

    fn release(&self, node: &Node) {
        if let Entry::Occupied(mut entry) = self.in_flight.entry(node.address()) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
            }
        }
    }
}
