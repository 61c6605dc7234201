//! # Exchange
//!
//! One inbound request paired with its eventual response, plus the routing and
//! timing metadata the pipeline accumulates while processing it.
//!
//! An `Exchange` is owned by a single handling task for its whole lifetime and
//! is mutated in place by every interceptor it passes through.

use hyper::body::Bytes;
use hyper::{Body, Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::balancer::Node;
use crate::error::{WaypointError, WaypointResult};
use crate::rules::Rule;

/// Lifecycle state of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Started,
    Completed,
    Failed,
}

/// Result of one backend call made for an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The backend answered with this status code
    Status(u16),
    /// No answer: refused, reset or timed out
    Failed,
}

impl AttemptOutcome {
    /// 5xx answers and missing answers count against the backend
    pub fn is_fault(&self) -> bool {
        match self {
            AttemptOutcome::Status(status) => (500..600).contains(status),
            AttemptOutcome::Failed => true,
        }
    }
}

/// A destination that was tried and how it went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub destination: String,
    pub outcome: AttemptOutcome,
}

/// Cooperative cancellation signal shared between the connection and its exchange
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Guard that cancels the signal when dropped
    pub fn guard(self: &Arc<Self>) -> CancelOnDrop {
        CancelOnDrop(Arc::clone(self))
    }
}

/// Cancels the wrapped signal on drop, e.g. when hyper drops a connection future
pub struct CancelOnDrop(Arc<Cancellation>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A single request/response cycle flowing through the pipeline
pub struct Exchange {
    id: Uuid,
    request: Request<Body>,
    response: Option<Response<Body>>,
    rule: Option<Arc<Rule>>,
    destinations: Vec<String>,
    served_destination: Option<String>,
    attempts: Vec<Attempt>,
    destination_nodes: Vec<Arc<Node>>,
    properties: HashMap<String, Value>,
    dispatched_node: Option<Arc<Node>>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    received_at: Instant,
    completed_at: Option<Instant>,
    state: ExchangeState,
    error: Option<WaypointError>,
    cancellation: Arc<Cancellation>,
}

impl Exchange {
    pub fn new(request: Request<Body>, local_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
            rule: None,
            destinations: Vec::new(),
            served_destination: None,
            attempts: Vec::new(),
            destination_nodes: Vec::new(),
            properties: HashMap::new(),
            dispatched_node: None,
            local_addr,
            remote_addr: None,
            received_at: Instant::now(),
            completed_at: None,
            state: ExchangeState::Started,
            error: None,
            cancellation: Arc::new(Cancellation::new()),
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Arc<Cancellation>) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    pub fn response(&self) -> Option<&Response<Body>> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response<Body>> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: Response<Body>) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<Body>> {
        self.response.take()
    }

    pub fn rule(&self) -> Option<&Arc<Rule>> {
        self.rule.as_ref()
    }

    pub fn set_rule(&mut self, rule: Arc<Rule>) {
        self.rule = Some(rule);
    }

    /// The current destination, i.e. the first entry of the destination list
    pub fn destination(&self) -> Option<&str> {
        self.destinations.first().map(String::as_str)
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// Replace the destination list with a single destination
    pub fn set_destination<S: Into<String>>(&mut self, destination: S) {
        self.destinations = vec![destination.into()];
    }

    /// Replace the destination list; later entries are fail-over candidates
    pub fn set_destinations(&mut self, destinations: Vec<String>) {
        self.destinations = destinations;
    }

    pub fn served_destination(&self) -> Option<&str> {
        self.served_destination.as_deref()
    }

    pub fn set_served_destination<S: Into<String>>(&mut self, destination: S) {
        self.served_destination = Some(destination.into());
    }

    pub fn record_attempt<S: Into<String>>(&mut self, destination: S, outcome: AttemptOutcome) {
        self.attempts.push(Attempt {
            destination: destination.into(),
            outcome,
        });
    }

    /// Backend calls in the order they were made
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Nodes the destinations were built from, so outcomes can be traced back to them
    pub fn set_destination_nodes(&mut self, nodes: Vec<Arc<Node>>) {
        self.destination_nodes = nodes;
    }

    pub fn node_for_destination(&self, destination: &str) -> Option<&Arc<Node>> {
        self.destination_nodes.iter().find(|n| n.serves(destination))
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn dispatched_node(&self) -> Option<&Arc<Node>> {
        self.dispatched_node.as_ref()
    }

    pub fn set_dispatched_node(&mut self, node: Arc<Node>) {
        self.dispatched_node = Some(node);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn error(&self) -> Option<&WaypointError> {
        self.error.as_ref()
    }

    pub fn cancellation(&self) -> Arc<Cancellation> {
        Arc::clone(&self.cancellation)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Path and query of the inbound request URI
    pub fn path_and_query(&self) -> &str {
        self.request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Mark the exchange completed; a failed exchange stays failed
    pub fn complete(&mut self) {
        if self.state == ExchangeState::Started {
            self.state = ExchangeState::Completed;
        }
        self.completed_at.get_or_insert_with(Instant::now);
    }

    /// Mark the exchange failed and attach the triggering error
    pub fn fail(&mut self, error: WaypointError) {
        self.state = ExchangeState::Failed;
        self.error = Some(error);
        self.completed_at.get_or_insert_with(Instant::now);
    }

    pub fn elapsed(&self) -> Duration {
        self.completed_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.received_at)
    }

    /// Fully read the request body and put the buffered bytes back in place
    pub async fn request_body_bytes(&mut self) -> WaypointResult<Bytes> {
        let body = std::mem::take(self.request.body_mut());
        let bytes = hyper::body::to_bytes(body).await?;
        *self.request.body_mut() = Body::from(bytes.clone());
        Ok(bytes)
    }

    /// Fully read the response body (if any) and put the buffered bytes back
    pub async fn response_body_bytes(&mut self) -> WaypointResult<Option<Bytes>> {
        let Some(response) = self.response.as_mut() else {
            return Ok(None);
        };
        let body = std::mem::take(response.body_mut());
        let bytes = hyper::body::to_bytes(body).await?;
        *response.body_mut() = Body::from(bytes.clone());
        Ok(Some(bytes))
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("rule", &self.rule.as_ref().map(|r| r.name().to_string()))
            .field("destinations", &self.destinations)
            .field("state", &self.state)
            .finish()
    }
}
