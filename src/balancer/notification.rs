use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Response, StatusCode};
use regex::Regex;
use ring::hmac;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::cluster::DEFAULT_CLUSTER;
use super::manager::ClusterManager;
use super::node::NodeStatus;
use crate::error::{WaypointError, WaypointResult};
use crate::exchange::Exchange;
use crate::interceptor::{Flow, Interceptor, Outcome};

/// Control path prefix served by [`ClusterNotificationInterceptor`]
pub const NOTIFICATION_PATH: &str = "/clustermanager";

/// Node state change requested by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Up,
    Down,
    TakeOut,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Up => "up",
            NodeAction::Down => "down",
            NodeAction::TakeOut => "takeout",
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            NodeAction::Up => NodeStatus::Up,
            NodeAction::Down => NodeStatus::Down,
            NodeAction::TakeOut => NodeStatus::TakeOut,
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeAction {
    type Err = WaypointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(NodeAction::Up),
            "down" => Ok(NodeAction::Down),
            "takeout" => Ok(NodeAction::TakeOut),
            other => Err(WaypointError::bad_request(format!(
                "Unknown node action '{}'",
                other
            ))),
        }
    }
}

/// Fields of a notification, in signing order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub cluster: String,
    pub host: String,
    pub port: u16,
    pub time: i64,
    pub nonce: Option<String>,
}

impl Notification {
    pub fn new<C: Into<String>, H: Into<String>>(cluster: C, host: H, port: u16) -> Self {
        Self {
            cluster: cluster.into(),
            host: host.into(),
            port,
            time: chrono::Utc::now().timestamp_millis(),
            nonce: Some(uuid::Uuid::new_v4().simple().to_string()),
        }
    }

    fn canonical(&self) -> String {
        format!(
            "cluster={}&host={}&port={}&time={}&nonce={}",
            self.cluster,
            self.host,
            self.port,
            self.time,
            self.nonce.as_deref().unwrap_or("")
        )
    }

    fn from_params(params: &HashMap<String, String>) -> WaypointResult<Self> {
        let host = params
            .get("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| WaypointError::bad_request("missing 'host' parameter"))?;
        let port = params
            .get("port")
            .ok_or_else(|| WaypointError::bad_request("missing 'port' parameter"))?
            .parse::<u16>()
            .map_err(|_| WaypointError::bad_request("'port' is not a valid port number"))?;
        let time = match params.get("time") {
            Some(t) => t
                .parse::<i64>()
                .map_err(|_| WaypointError::bad_request("'time' is not a timestamp"))?,
            None => 0,
        };

        Ok(Self {
            cluster: params
                .get("cluster")
                .filter(|c| !c.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_CLUSTER.to_string()),
            host: host.clone(),
            port,
            time,
            nonce: params.get("nonce").filter(|n| !n.is_empty()).cloned(),
        })
    }
}

/// HMAC-SHA256 signature of a notification, URL-safe base64 without padding
pub fn sign_notification(key: &[u8], notification: &Notification) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, notification.canonical().as_bytes());
    URL_SAFE_NO_PAD.encode(tag.as_ref())
}

/// Build the control URL for a notification, signing it when a key is given
pub fn notification_url(
    base: &str,
    action: NodeAction,
    notification: &Notification,
    key: Option<&[u8]>,
) -> WaypointResult<String> {
    let mut url = Url::parse(base)
        .and_then(|u| u.join(&format!("{}/{}", NOTIFICATION_PATH, action)))
        .map_err(|e| WaypointError::config(format!("Invalid notification URL '{}': {}", base, e)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("cluster", &notification.cluster)
            .append_pair("host", &notification.host)
            .append_pair("port", &notification.port.to_string())
            .append_pair("time", &notification.time.to_string());
        if let Some(nonce) = &notification.nonce {
            query.append_pair("nonce", nonce);
        }
        if let Some(key) = key {
            query.append_pair("signature", &sign_notification(key, notification));
        }
    }

    Ok(url.to_string())
}

/// Applies signed up/down/takeout requests to the cluster manager
///
/// Answers `204 No Content` on success. With a key configured, requests must
/// carry a valid signature, a timestamp within the replay window and, when a
/// nonce is present, a nonce not seen inside that window. Rejections surface
/// as `403 Forbidden`.
pub struct ClusterNotificationInterceptor {
    clusters: Arc<ClusterManager>,
    key: Option<hmac::Key>,
    replay_window: Duration,
    seen_nonces: DashMap<String, i64>,
    priority: i32,
    path: Regex,
}

impl ClusterNotificationInterceptor {
    pub const PRIORITY: i32 = 50;

    pub fn new(clusters: Arc<ClusterManager>) -> WaypointResult<Self> {
        Ok(Self {
            clusters,
            key: None,
            replay_window: Duration::ZERO,
            seen_nonces: DashMap::new(),
            priority: Self::PRIORITY,
            path: Regex::new(&format!(
                "^{}/(up|down|takeout)/?$",
                regex::escape(NOTIFICATION_PATH)
            ))?,
        })
    }

    /// Require signed notifications. A zero window disables timestamp checks.
    pub fn with_signature(mut self, key: &[u8], replay_window: Duration) -> Self {
        self.key = Some(hmac::Key::new(hmac::HMAC_SHA256, key));
        self.replay_window = replay_window;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    async fn params(exc: &mut Exchange) -> WaypointResult<HashMap<String, String>> {
        let mut params: HashMap<String, String> = exc
            .request()
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let is_form = exc
            .request()
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
        if exc.request().method() == Method::POST && is_form {
            let body = exc.request_body_bytes().await?;
            for (k, v) in url::form_urlencoded::parse(&body).into_owned() {
                params.entry(k).or_insert(v);
            }
        }
        Ok(params)
    }

    fn verify(&self, notification: &Notification, params: &HashMap<String, String>) -> WaypointResult<()> {
        let Some(key) = &self.key else {
            return Ok(());
        };

        let signature = params
            .get("signature")
            .ok_or_else(|| WaypointError::signature_rejected("missing signature"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature.trim_end_matches('='))
            .map_err(|_| WaypointError::signature_rejected("malformed signature"))?;
        hmac::verify(key, notification.canonical().as_bytes(), &signature)
            .map_err(|_| WaypointError::signature_rejected("signature mismatch"))?;

        if self.replay_window.is_zero() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let window = u64::try_from(self.replay_window.as_millis()).unwrap_or(u64::MAX);
        if now.abs_diff(notification.time) > window {
            return Err(WaypointError::replay_rejected(format!(
                "timestamp {} outside the {:?} window",
                notification.time, self.replay_window
            )));
        }

        if let Some(nonce) = &notification.nonce {
            self.seen_nonces.retain(|_, seen| now.abs_diff(*seen) <= window);
            if self.seen_nonces.insert(nonce.clone(), now).is_some() {
                return Err(WaypointError::replay_rejected(format!(
                    "nonce '{}' already used",
                    nonce
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Interceptor for ClusterNotificationInterceptor {
    fn name(&self) -> &str {
        "cluster-notification"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn flow(&self) -> Flow {
        Flow::Request
    }

    async fn handle_request(&self, exc: &mut Exchange) -> WaypointResult<Outcome> {
        let Some(action) = self
            .path
            .captures(exc.request().uri().path())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().parse::<NodeAction>())
        else {
            return Ok(Outcome::Continue);
        };
        let action = action?;

        let params = Self::params(exc).await?;
        let notification = Notification::from_params(&params)?;

        if let Err(e) = self.verify(&notification, &params) {
            warn!(
                cluster = %notification.cluster,
                host = %notification.host,
                port = notification.port,
                "Rejected cluster notification: {}",
                e
            );
            return Err(e);
        }

        info!(
            action = %action,
            cluster = %notification.cluster,
            host = %notification.host,
            port = notification.port,
            "Cluster notification applied"
        );
        self.clusters.set_status(
            &notification.cluster,
            &notification.host,
            notification.port,
            action.status(),
        );

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        exc.set_response(response);
        Ok(Outcome::Return)
    }
}
