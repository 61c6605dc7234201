use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use super::node::Node;
use super::strategy::DispatchingStrategy;
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::{AttemptOutcome, Cancellation};

/// Share of flawless endpoints needed to round-robin over them alone
pub const DEFAULT_MIN_FLAWLESS_RATIO: f64 = 0.5;
/// A fault profile is forgotten this long after its last failure
pub const DEFAULT_CLEAR_AFTER: Duration = Duration::from_secs(5 * 60);

/// Score at which a recovering endpoint is considered flawless again
const CLEAR_SCORE: f64 = 0.95;
/// Lower bound so a long-failing endpoint keeps a non-zero chance
const MIN_SCORE: f64 = 0.0001;

/// Recent success estimate of an endpoint that failed at least once
#[derive(Debug, Clone)]
struct FaultProfile {
    score: f64,
    last_failure: Instant,
}

impl FaultProfile {
    fn new(now: Instant) -> Self {
        Self {
            score: 0.5,
            last_failure: now,
        }
    }

    fn failure(&mut self, now: Instant) {
        self.score /= 2.0;
        self.last_failure = now;
    }

    /// Returns true once the endpoint has recovered
    fn success(&mut self) -> bool {
        self.score += (1.0 - self.score) / 2.0;
        self.score >= CLEAR_SCORE
    }
}

/// Round robin that steers around failing endpoints
///
/// Any 5xx answer or missing answer gives the endpoint a fault profile whose
/// score halves with every further fault and climbs back with successes.
/// While enough endpoints are flawless only those are used, in round-robin
/// order. Otherwise every endpoint stays eligible and one is drawn at random,
/// weighted by score. Profiles are dropped after enough successes or once
/// `clear_after` has passed since the last failure.
#[derive(Debug)]
pub struct FaultMonitoringStrategy {
    min_flawless_ratio: f64,
    clear_after: Duration,
    profiles: DashMap<String, FaultProfile>,
    cursor: Mutex<usize>,
}

impl Default for FaultMonitoringStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FLAWLESS_RATIO, DEFAULT_CLEAR_AFTER)
    }
}

impl FaultMonitoringStrategy {
    pub fn new(min_flawless_ratio: f64, clear_after: Duration) -> Self {
        Self {
            min_flawless_ratio: min_flawless_ratio.clamp(0.0, 1.0),
            clear_after,
            profiles: DashMap::new(),
            cursor: Mutex::new(0),
        }
    }

    /// Current score of a node; 1.0 when it has no fault profile
    pub fn score(&self, node: &Node) -> f64 {
        self.profiles
            .get(&node.address())
            .map(|p| p.score)
            .unwrap_or(1.0)
    }

    pub fn is_faulty(&self, node: &Node) -> bool {
        self.profiles.contains_key(&node.address())
    }

    fn clear_stale(&self, now: Instant) {
        if self.profiles.is_empty() {
            return;
        }
        let clear_after = self.clear_after;
        self.profiles.retain(|address, profile| {
            let keep = now.duration_since(profile.last_failure) < clear_after;
            if !keep {
                debug!(node = %address, "Fault profile expired");
            }
            keep
        });
    }

    fn round_robin(&self, endpoints: &[Arc<Node>]) -> Arc<Node> {
        let mut cursor = self.cursor.lock();
        let index = *cursor % endpoints.len();
        *cursor = (index + 1) % endpoints.len();
        Arc::clone(&endpoints[index])
    }

    fn by_chance(&self, endpoints: &[Arc<Node>]) -> Arc<Node> {
        let mut cumulative = Vec::with_capacity(endpoints.len());
        let mut total = 0.0;
        for node in endpoints {
            total += self.score(node).max(MIN_SCORE);
            cumulative.push(total);
        }

        let chosen = rand::thread_rng().gen::<f64>() * total;
        let index = cumulative
            .iter()
            .position(|upper| chosen <= *upper)
            .unwrap_or(endpoints.len() - 1);
        Arc::clone(&endpoints[index])
    }
}

#[async_trait]
impl DispatchingStrategy for FaultMonitoringStrategy {
    fn name(&self) -> &str {
        "fault_monitoring"
    }

    async fn select(
        &self,
        endpoints: &[Arc<Node>],
        _cancellation: &Cancellation,
    ) -> WaypointResult<Arc<Node>> {
        match endpoints {
            [] => {
                return Err(WaypointError::empty_endpoints(
                    "fault monitoring selection over an empty endpoint list",
                ))
            }
            [only] => return Ok(Arc::clone(only)),
            _ => {}
        }

        self.clear_stale(Instant::now());

        let flawless: Vec<Arc<Node>> = endpoints
            .iter()
            .filter(|n| !self.is_faulty(n))
            .cloned()
            .collect();
        let ratio = flawless.len() as f64 / endpoints.len() as f64;

        if !flawless.is_empty() && ratio >= self.min_flawless_ratio {
            trace!(flawless = flawless.len(), total = endpoints.len(), "Round robin over flawless endpoints");
            Ok(self.round_robin(&flawless))
        } else {
            trace!(flawless = flawless.len(), total = endpoints.len(), "Selecting by weighted chance");
            Ok(self.by_chance(endpoints))
        }
    }

    fn report(&self, node: &Node, outcome: AttemptOutcome) {
        let address = node.address();
        let now = Instant::now();

        if outcome.is_fault() {
            self.profiles
                .entry(address)
                .and_modify(|p| p.failure(now))
                .or_insert_with(|| {
                    debug!(node = %node, "Endpoint marked faulty");
                    FaultProfile::new(now)
                });
            return;
        }

        let recovered = self
            .profiles
            .get_mut(&address)
            .is_some_and(|mut p| p.success());
        if recovered {
            self.profiles.remove(&address);
            debug!(node = %node, "Endpoint cleared of its fault profile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<Arc<Node>> {
        names.iter().map(|n| Arc::new(Node::new(*n, 80))).collect()
    }

    async fn pick(strategy: &FaultMonitoringStrategy, endpoints: &[Arc<Node>], n: usize) -> Vec<String> {
        let cancel = Cancellation::new();
        let mut picked = Vec::new();
        for _ in 0..n {
            let node = strategy.select(endpoints, &cancel).await.unwrap();
            picked.push(node.host().to_string());
        }
        picked
    }

    #[tokio::test]
    async fn test_behaves_like_round_robin_when_healthy() {
        let strategy = FaultMonitoringStrategy::default();
        let endpoints = nodes(&["a", "b", "c"]);
        assert_eq!(pick(&strategy, &endpoints, 4).await, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_skips_faulty_while_enough_are_flawless() {
        let strategy = FaultMonitoringStrategy::default();
        let endpoints = nodes(&["a", "b", "c"]);
        strategy.report(&endpoints[1], AttemptOutcome::Status(502));
        assert!(strategy.is_faulty(&endpoints[1]));

        let picked = pick(&strategy, &endpoints, 6).await;
        assert!(!picked.contains(&"b".to_string()));
        assert!(picked.contains(&"a".to_string()));
        assert!(picked.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_weighted_chance_when_most_are_faulty() {
        let strategy = FaultMonitoringStrategy::default();
        let endpoints = nodes(&["a", "b", "c"]);
        for _ in 0..40 {
            strategy.report(&endpoints[0], AttemptOutcome::Failed);
            strategy.report(&endpoints[1], AttemptOutcome::Failed);
        }
        strategy.report(&endpoints[2], AttemptOutcome::Failed);

        // Every endpoint is faulty; "c" failed once and dominates the draw
        let picked = pick(&strategy, &endpoints, 200).await;
        let on_c = picked.iter().filter(|host| *host == "c").count();
        assert!(on_c >= 190, "c picked {on_c} times out of 200");
    }

    #[tokio::test]
    async fn test_successes_clear_the_profile() {
        let strategy = FaultMonitoringStrategy::default();
        let node = Node::new("a", 80);

        strategy.report(&node, AttemptOutcome::Failed);
        assert_eq!(strategy.score(&node), 0.5);

        // 4xx answers are not faults
        strategy.report(&node, AttemptOutcome::Status(404));
        strategy.report(&node, AttemptOutcome::Status(200));
        strategy.report(&node, AttemptOutcome::Status(200));
        assert!(strategy.is_faulty(&node));
        strategy.report(&node, AttemptOutcome::Status(200));
        assert!(!strategy.is_faulty(&node));
        assert_eq!(strategy.score(&node), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profiles_expire_after_last_failure() {
        let strategy = FaultMonitoringStrategy::new(0.5, Duration::from_secs(60));
        let endpoints = nodes(&["a", "b"]);
        strategy.report(&endpoints[0], AttemptOutcome::Failed);

        assert_eq!(pick(&strategy, &endpoints, 2).await, vec!["b", "b"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        let picked = pick(&strategy, &endpoints, 2).await;
        assert!(!strategy.is_faulty(&endpoints[0]));
        assert!(picked.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_single_and_empty_lists() {
        let strategy = FaultMonitoringStrategy::default();
        let only = nodes(&["a"]);
        strategy.report(&only[0], AttemptOutcome::Failed);
        assert_eq!(pick(&strategy, &only, 1).await, vec!["a"]);

        let err = strategy.select(&[], &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, WaypointError::EmptyEndpointList { .. }));
    }
}
