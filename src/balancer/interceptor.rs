use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use super::cluster::DEFAULT_CLUSTER;
use super::manager::ClusterManager;
use super::node::{Node, NodeStatus};
use super::online::NodeOnlineChecker;
use super::session::{MessageSide, SessionIdExtractor};
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::{AttemptOutcome, Exchange};
use crate::interceptor::{Interceptor, Outcome, DEFAULT_PRIORITY};

const STRATEGY_SELECTED: &str = "waypoint.balancer.strategy_selected";
const SESSION_ID: &str = "waypoint.balancer.session_id";

/// Rule interceptor that picks a backend node for the exchange
///
/// The node comes from the session binding when the exchange carries a known
/// session id, otherwise from the rule's dispatching strategy. The remaining
/// available nodes are appended as fail-over destinations. Every backend call
/// made for the exchange is credited to the node it went to.
pub struct LoadBalancingInterceptor {
    name: String,
    priority: i32,
    clusters: Arc<ClusterManager>,
    session_extractor: Option<Arc<dyn SessionIdExtractor>>,
    online_checker: Option<Arc<NodeOnlineChecker>>,
    failover: bool,
    node_timeout: Duration,
}

impl LoadBalancingInterceptor {
    pub fn new(clusters: Arc<ClusterManager>) -> Self {
        Self {
            name: "load-balancer".to_string(),
            priority: DEFAULT_PRIORITY,
            clusters,
            session_extractor: None,
            online_checker: None,
            failover: true,
            node_timeout: Duration::ZERO,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session_extractor(mut self, extractor: Arc<dyn SessionIdExtractor>) -> Self {
        self.session_extractor = Some(extractor);
        self
    }

    pub fn with_online_checker(mut self, checker: Arc<NodeOnlineChecker>) -> Self {
        self.online_checker = Some(checker);
        self
    }

    pub fn with_failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    async fn extract_session(
        &self,
        exc: &mut Exchange,
        side: MessageSide,
    ) -> WaypointResult<Option<String>> {
        let Some(extractor) = &self.session_extractor else {
            return Ok(None);
        };

        match side {
            MessageSide::Request => {
                let body = if extractor.needs_body() {
                    Some(exc.request_body_bytes().await?)
                } else {
                    None
                };
                Ok(extractor.extract(side, exc.request().headers(), body.as_deref()))
            }
            MessageSide::Response => {
                let body = if extractor.needs_body() {
                    exc.response_body_bytes().await?
                } else {
                    None
                };
                Ok(exc
                    .response()
                    .and_then(|r| extractor.extract(side, r.headers(), body.as_deref())))
            }
        }
    }

    fn cluster_of(exc: &Exchange) -> String {
        exc.rule()
            .and_then(|r| r.balancing())
            .map(|b| b.cluster_name().to_string())
            .unwrap_or_else(|| DEFAULT_CLUSTER.to_string())
    }

    /// Undo the bookkeeping done when the node was picked.
    /// Returns false if it was already undone.
    fn finish(&self, exc: &mut Exchange, node: &Node) -> bool {
        let via_strategy = exc
            .remove_property(STRATEGY_SELECTED)
            .and_then(|v| v.as_bool());
        let Some(via_strategy) = via_strategy else {
            return false;
        };

        node.remove_thread();
        if via_strategy {
            if let Some(balancing) = exc.rule().and_then(|r| r.balancing()) {
                balancing.strategy().release(node);
            }
        }
        true
    }

    /// Credit each backend call to the node it went to
    fn record_outcomes(&self, exc: &Exchange, dispatched: &Arc<Node>) {
        let mut outcomes: Vec<(Arc<Node>, AttemptOutcome)> = exc
            .attempts()
            .iter()
            .filter_map(|a| {
                exc.node_for_destination(&a.destination)
                    .map(|node| (Arc::clone(node), a.outcome))
            })
            .collect();
        if exc.attempts().is_empty() {
            if let Some(status) = exc.response().map(|r| r.status().as_u16()) {
                outcomes.push((Arc::clone(dispatched), AttemptOutcome::Status(status)));
            }
        }

        let balancing = exc.rule().and_then(|r| r.balancing());
        for (node, outcome) in outcomes {
            match outcome {
                AttemptOutcome::Status(status) => node.record_status(status),
                AttemptOutcome::Failed => node.record_error(),
            }
            if let Some(balancing) = balancing {
                balancing.strategy().report(&node, outcome);
            }
            if let Some(checker) = &self.online_checker {
                checker.observe(&self.clusters, &node, outcome);
            }
        }
    }

    /// Node that produced the response, if it is one of ours
    fn served_node(exc: &Exchange, dispatched: &Arc<Node>) -> Option<Arc<Node>> {
        match exc.served_destination() {
            Some(destination) => exc.node_for_destination(destination).cloned(),
            None => Some(Arc::clone(dispatched)),
        }
    }
}

#[async_trait]
impl Interceptor for LoadBalancingInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        let rule = exc
            .rule()
            .cloned()
            .ok_or_else(|| WaypointError::internal("load balancing requires a matched rule"))?;
        let balancing = rule.balancing().ok_or_else(|| {
            WaypointError::config(format!("rule '{}' has no balancing configured", rule.name()))
        })?;
        let cluster = balancing.cluster_name();
        if let Some(checker) = &self.online_checker {
            checker.revive_in_background(Arc::clone(&self.clusters));
        }
        let candidates = balancing.available_endpoints(&self.clusters, self.node_timeout);

        let session_id = self.extract_session(exc, MessageSide::Request).await?;
        let pinned = session_id
            .as_deref()
            .and_then(|sid| self.clusters.get_session(cluster, sid))
            .map(|session| session.node)
            .filter(|node| node.status() != NodeStatus::Down);

        let (node, via_strategy) = match pinned {
            Some(node) => {
                debug!(cluster = %cluster, node = %node, "Dispatching by session affinity");
                (node, false)
            }
            None => {
                let cancellation = exc.cancellation();
                let node = balancing.strategy().select(&candidates, &cancellation).await?;
                debug!(
                    cluster = %cluster,
                    node = %node,
                    strategy = balancing.strategy().name(),
                    "Dispatching by strategy"
                );
                (node, true)
            }
        };

        if let Some(sid) = session_id {
            exc.set_property(SESSION_ID, sid);
        }
        exc.set_property(STRATEGY_SELECTED, via_strategy);
        node.add_thread();

        let mut nodes = vec![Arc::clone(&node)];
        if self.failover {
            nodes.extend(
                candidates
                    .iter()
                    .filter(|c| c.as_ref() != node.as_ref())
                    .cloned(),
            );
        }
        let path_and_query = exc.path_and_query().to_string();
        let destinations = nodes
            .iter()
            .map(|n| n.destination_url(&path_and_query))
            .collect();
        exc.set_destinations(destinations);
        exc.set_destination_nodes(nodes);
        exc.set_dispatched_node(node);
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        let Some(node) = exc.dispatched_node().cloned() else {
            return Ok(Outcome::Continue);
        };

        if self.finish(exc, &node) {
            self.record_outcomes(exc, &node);
        }

        if self.session_extractor.is_none() {
            return Ok(Outcome::Continue);
        }
        let Some(served) = Self::served_node(exc, &node) else {
            return Ok(Outcome::Continue);
        };

        let session_id = match self.extract_session(exc, MessageSide::Response).await? {
            Some(id) => Some(id),
            None => exc
                .property(SESSION_ID)
                .and_then(|v| v.as_str())
                .map(String::from),
        };

        if let Some(sid) = session_id {
            let cluster = Self::cluster_of(exc);
            // Move the session when it is unbound, bound elsewhere or bound to a down node
            let rebind = self
                .clusters
                .bound_node(&cluster, &sid)
                .map_or(true, |bound| {
                    bound.status() == NodeStatus::Down || bound.as_ref() != served.as_ref()
                });
            if rebind {
                self.clusters.add_session(&cluster, &sid, served);
            }
        }

        Ok(Outcome::Continue)
    }

    async fn handle_abort(&self, exc: &mut Exchange) {
        if let Some(node) = exc.dispatched_node().cloned() {
            if !self.finish(exc, &node) {
                return;
            }
            if exc.attempts().is_empty() {
                node.record_error();
            } else {
                self.record_outcomes(exc, &node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{
        ByThreadStrategy, CookieSessionIdExtractor, FaultMonitoringStrategy, RoundRobinStrategy,
    };
    use crate::rules::{Balancing, Rule, RuleKey};
    use hyper::{Body, Request, Response};

    fn exchange(rule: &Arc<Rule>, cookie: Option<&str>) -> Exchange {
        let mut builder = Request::builder().uri("/service?x=1");
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        let mut exc = Exchange::new(builder.body(Body::empty()).unwrap(), "127.0.0.1:9000".parse().unwrap());
        exc.set_rule(Arc::clone(rule));
        exc
    }

    fn cluster_rule(strategy: Arc<dyn crate::balancer::DispatchingStrategy>) -> Arc<Rule> {
        Arc::new(
            Rule::new("svc", RuleKey::new(9000))
                .with_balancing(Balancing::with_cluster(strategy, "orders")),
        )
    }

    #[tokio::test]
    async fn test_sets_primary_and_failover_destinations() {
        let clusters = Arc::new(ClusterManager::default());
        clusters.up("orders", "a", 1);
        clusters.up("orders", "b", 2);
        let rule = cluster_rule(Arc::new(RoundRobinStrategy::new()));
        let lb = LoadBalancingInterceptor::new(Arc::clone(&clusters));

        let mut exc = exchange(&rule, None);
        lb.handle_request(&mut exc).await.unwrap();

        assert_eq!(
            exc.destinations(),
            &["http://a:1/service?x=1".to_string(), "http://b:2/service?x=1".to_string()]
        );
        assert_eq!(exc.dispatched_node().unwrap().host(), "a");
    }

    #[tokio::test]
    async fn test_no_available_nodes() {
        let clusters = Arc::new(ClusterManager::default());
        clusters.down("orders", "a", 1);
        let rule = cluster_rule(Arc::new(RoundRobinStrategy::new()));
        let lb = LoadBalancingInterceptor::new(clusters);

        let mut exc = exchange(&rule, None);
        let err = lb.handle_request(&mut exc).await.unwrap_err();
        assert!(matches!(err, WaypointError::EmptyEndpointList { .. }));
    }

    #[tokio::test]
    async fn test_session_binding_pins_later_requests() {
        let clusters = Arc::new(ClusterManager::default());
        clusters.up("orders", "a", 1);
        clusters.up("orders", "b", 2);
        let rule = cluster_rule(Arc::new(RoundRobinStrategy::new()));
        let lb = LoadBalancingInterceptor::new(Arc::clone(&clusters))
            .with_session_extractor(Arc::new(CookieSessionIdExtractor::default()));

        // First request lands on "a"; its response creates the session
        let mut exc = exchange(&rule, None);
        lb.handle_request(&mut exc).await.unwrap();
        let mut response = Response::new(Body::empty());
        response
            .headers_mut()
            .insert("set-cookie", "JSESSIONID=s1; Path=/".parse().unwrap());
        exc.set_response(response);
        lb.handle_response(&mut exc).await.unwrap();
        assert!(clusters.contains_session("orders", "s1"));

        // Round robin would now pick "b", the session keeps "a"
        let mut exc = exchange(&rule, Some("JSESSIONID=s1"));
        lb.handle_request(&mut exc).await.unwrap();
        assert_eq!(exc.dispatched_node().unwrap().host(), "a");
    }

    #[tokio::test]
    async fn test_release_on_response_and_abort() {
        let clusters = Arc::new(ClusterManager::default());
        let node = clusters.up("orders", "a", 1);
        let strategy = Arc::new(ByThreadStrategy::new(2, Duration::from_millis(1)));
        let rule = cluster_rule(strategy.clone());
        let lb = LoadBalancingInterceptor::new(Arc::clone(&clusters));

        let mut first = exchange(&rule, None);
        let mut second = exchange(&rule, None);
        lb.handle_request(&mut first).await.unwrap();
        lb.handle_request(&mut second).await.unwrap();
        assert_eq!(strategy.in_flight(&node), 2);
        assert_eq!(node.in_flight(), 2);

        first.set_response(Response::new(Body::empty()));
        lb.handle_response(&mut first).await.unwrap();
        lb.handle_abort(&mut second).await;
        lb.handle_abort(&mut second).await;

        assert_eq!(strategy.in_flight(&node), 0);
        assert_eq!(node.in_flight(), 0);
        assert_eq!(node.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_session_moves_off_a_down_node() {
        let clusters = Arc::new(ClusterManager::default());
        let a = clusters.up("orders", "a", 1);
        clusters.up("orders", "b", 2);
        clusters.up("orders", "d", 3);
        clusters.add_session("orders", "s1", a);
        clusters.down("orders", "a", 1);

        let rule = cluster_rule(Arc::new(RoundRobinStrategy::new()));
        let lb = LoadBalancingInterceptor::new(Arc::clone(&clusters))
            .with_session_extractor(Arc::new(CookieSessionIdExtractor::default()));

        let mut hosts = Vec::new();
        for _ in 0..4 {
            let mut exc = exchange(&rule, Some("JSESSIONID=s1"));
            lb.handle_request(&mut exc).await.unwrap();
            hosts.push(exc.dispatched_node().unwrap().host().to_string());
            exc.set_response(Response::new(Body::empty()));
            lb.handle_response(&mut exc).await.unwrap();
        }

        assert_ne!(hosts[0], "a");
        assert!(hosts.iter().all(|h| *h == hosts[0]), "hosts: {:?}", hosts);
        let bound = clusters.bound_node("orders", "s1").unwrap();
        assert_eq!(bound.host(), hosts[0]);
    }

    #[tokio::test]
    async fn test_outcomes_credited_to_serving_node() {
        let clusters = Arc::new(ClusterManager::default());
        let a = clusters.up("orders", "a", 1);
        let b = clusters.up("orders", "b", 2);
        let strategy = Arc::new(FaultMonitoringStrategy::default());
        let rule = cluster_rule(strategy.clone());
        let lb = LoadBalancingInterceptor::new(Arc::clone(&clusters))
            .with_session_extractor(Arc::new(CookieSessionIdExtractor::default()));

        let mut exc = exchange(&rule, None);
        lb.handle_request(&mut exc).await.unwrap();
        assert_eq!(exc.dispatched_node().unwrap().host(), "a");

        // Primary refused the connection, the fail-over node answered
        exc.record_attempt("http://a:1/service?x=1", AttemptOutcome::Failed);
        exc.record_attempt("http://b:2/service?x=1", AttemptOutcome::Status(201));
        exc.set_served_destination("http://b:2/service?x=1");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = hyper::StatusCode::CREATED;
        response
            .headers_mut()
            .insert("set-cookie", "JSESSIONID=s9".parse().unwrap());
        exc.set_response(response);
        lb.handle_response(&mut exc).await.unwrap();

        assert_eq!(a.stats().errors, 1);
        assert!(a.stats().status_codes.is_empty());
        assert_eq!(b.stats().status_codes.get(&201), Some(&1));
        assert!(strategy.is_faulty(&a));
        assert!(!strategy.is_faulty(&b));
        assert_eq!(clusters.bound_node("orders", "s9").unwrap().host(), "b");
    }

    #[tokio::test]
    async fn test_online_checker_takes_failing_node_down() {
        let clusters = Arc::new(ClusterManager::default());
        let a = clusters.up("orders", "a", 1);
        clusters.up("orders", "b", 2);
        let rule = cluster_rule(Arc::new(RoundRobinStrategy::new()));
        let lb = LoadBalancingInterceptor::new(Arc::clone(&clusters))
            .with_online_checker(Arc::new(NodeOnlineChecker::new(1, None)));

        for _ in 0..2 {
            let mut exc = exchange(&rule, None);
            lb.handle_request(&mut exc).await.unwrap();
            let node = exc.dispatched_node().unwrap().clone();
            exc.record_attempt(node.destination_url("/service?x=1"), AttemptOutcome::Status(500));
            lb.handle_abort(&mut exc).await;
        }
        assert!(a.is_up());

        // Second 5xx on "a" passes the limit of one
        let mut exc = exchange(&rule, None);
        lb.handle_request(&mut exc).await.unwrap();
        assert_eq!(exc.dispatched_node().unwrap().host(), "a");
        exc.record_attempt("http://a:1/service?x=1", AttemptOutcome::Status(502));
        exc.set_response(Response::new(Body::empty()));
        lb.handle_response(&mut exc).await.unwrap();

        assert_eq!(a.status(), NodeStatus::Down);
        let mut exc = exchange(&rule, None);
        lb.handle_request(&mut exc).await.unwrap();
        assert_eq!(exc.destinations(), &["http://b:2/service?x=1".to_string()]);
    }
}
