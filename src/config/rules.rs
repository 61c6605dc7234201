use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::{
    ByThreadStrategy, ClusterManager, ClusterNotificationInterceptor, CookieSessionIdExtractor,
    DispatchingStrategy, FaultMonitoringStrategy, LoadBalancingInterceptor, Node,
    NodeOnlineChecker, RoundRobinStrategy, SessionIdExtractor, XmlElementSessionIdExtractor,
    DEFAULT_CLUSTER,
};
use crate::error::{WaypointError, WaypointResult};
use crate::interceptor::{HeaderInterceptor, Interceptor};
use crate::rules::{Balancing, Rule, RuleKey};

/// A routing rule as written in the configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub name: String,
    pub port: u16,
    #[serde(default = "wildcard")]
    pub host: String,
    #[serde(default = "wildcard")]
    pub method: String,
    /// Exact request path
    pub path: Option<String>,
    /// Regular expression over path and query; exclusive with `path`
    pub path_regex: Option<String>,
    /// Local interface address the connection must arrive on
    pub ip: Option<IpAddr>,
    pub target: Option<TargetConfig>,
    pub balancing: Option<BalancingConfig>,
    #[serde(default)]
    pub block_request: bool,
    #[serde(default)]
    pub block_response: bool,
    #[serde(default)]
    pub inbound_tls: bool,
    #[serde(default)]
    pub outbound_tls: bool,
    #[serde(default)]
    pub interceptors: Vec<InterceptorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

/// Backend selection for a balancing rule
///
/// Either a named cluster or a static endpoint list; with neither the rule
/// balances over the default cluster.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BalancingConfig {
    #[serde(default)]
    pub strategy: StrategyConfig,
    pub cluster: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    #[default]
    RoundRobin,
    ByThread {
        #[serde(default = "default_max_per_endpoint")]
        max_per_endpoint: usize,
        #[serde(default = "default_retry_delay_ms")]
        retry_delay_ms: u64,
        #[serde(default = "default_attempts")]
        attempts: u32,
    },
    FaultMonitoring {
        /// Share of flawless endpoints below which selection turns weighted-random
        #[serde(default = "default_min_flawless_ratio")]
        min_flawless_ratio: f64,
        #[serde(default = "default_clear_after_secs")]
        clear_after_secs: u64,
    },
}

/// Interceptor definitions, usable globally or inside a rule
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterceptorConfig {
    Balancer {
        name: Option<String>,
        priority: Option<i32>,
        #[serde(default = "default_true")]
        failover: bool,
        session: Option<SessionExtractorConfig>,
        online_checker: Option<OnlineCheckerConfig>,
    },
    ClusterNotification {
        priority: Option<i32>,
        #[serde(default)]
        validate_signature: bool,
        key: Option<String>,
        /// Accepted clock skew and nonce memory; 0 disables both checks
        #[serde(default)]
        replay_window_secs: u64,
    },
    Headers {
        name: String,
        priority: Option<i32>,
        #[serde(default)]
        request: BTreeMap<String, String>,
        #[serde(default)]
        response: BTreeMap<String, String>,
        #[serde(default)]
        remove_request: Vec<String>,
        #[serde(default)]
        remove_response: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionExtractorConfig {
    Cookie {
        #[serde(default = "default_cookie")]
        name: String,
    },
    XmlElement {
        #[serde(default)]
        namespace: String,
        local_name: String,
    },
}

/// Automatic node take-down on failing answers, with optional revival
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OnlineCheckerConfig {
    /// 5xx answers in a row tolerated before the node goes down
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    /// Ping downed nodes at most this often; unset never brings them back
    pub retry_time_secs: Option<u64>,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl OnlineCheckerConfig {
    pub fn build(&self) -> NodeOnlineChecker {
        NodeOnlineChecker::new(self.failure_limit, self.retry_time_secs.map(Duration::from_secs))
            .with_ping_timeout(Duration::from_millis(self.ping_timeout_ms))
    }
}

fn wildcard() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_per_endpoint() -> usize {
    crate::balancer::strategy::DEFAULT_MAX_PER_ENDPOINT
}

fn default_retry_delay_ms() -> u64 {
    crate::balancer::strategy::DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_attempts() -> u32 {
    crate::balancer::strategy::DEFAULT_ATTEMPTS
}

fn default_min_flawless_ratio() -> f64 {
    crate::balancer::fault_monitoring::DEFAULT_MIN_FLAWLESS_RATIO
}

fn default_clear_after_secs() -> u64 {
    crate::balancer::fault_monitoring::DEFAULT_CLEAR_AFTER.as_secs()
}

fn default_failure_limit() -> u32 {
    crate::balancer::online::DEFAULT_FAILURE_LIMIT
}

fn default_ping_timeout_ms() -> u64 {
    crate::balancer::online::DEFAULT_PING_TIMEOUT.as_millis() as u64
}

fn default_cookie() -> String {
    crate::balancer::session::DEFAULT_SESSION_COOKIE.to_string()
}

impl StrategyConfig {
    pub fn build(&self) -> Arc<dyn DispatchingStrategy> {
        match self {
            StrategyConfig::RoundRobin => Arc::new(RoundRobinStrategy::new()),
            StrategyConfig::ByThread {
                max_per_endpoint,
                retry_delay_ms,
                attempts,
            } => Arc::new(
                ByThreadStrategy::new(*max_per_endpoint, Duration::from_millis(*retry_delay_ms))
                    .with_attempts(*attempts),
            ),
            StrategyConfig::FaultMonitoring {
                min_flawless_ratio,
                clear_after_secs,
            } => Arc::new(FaultMonitoringStrategy::new(
                *min_flawless_ratio,
                Duration::from_secs(*clear_after_secs),
            )),
        }
    }
}

impl SessionExtractorConfig {
    pub fn build(&self) -> WaypointResult<Arc<dyn SessionIdExtractor>> {
        Ok(match self {
            SessionExtractorConfig::Cookie { name } => Arc::new(CookieSessionIdExtractor::new(name)),
            SessionExtractorConfig::XmlElement {
                namespace,
                local_name,
            } => Arc::new(XmlElementSessionIdExtractor::new(namespace, local_name)?),
        })
    }
}

impl BalancingConfig {
    pub fn cluster_name(&self) -> &str {
        self.cluster.as_deref().unwrap_or(DEFAULT_CLUSTER)
    }

    pub fn build(&self) -> WaypointResult<Balancing> {
        let strategy = self.strategy.build();
        if self.endpoints.is_empty() {
            return Ok(Balancing::with_cluster(strategy, self.cluster_name()));
        }

        let endpoints = self
            .endpoints
            .iter()
            .map(|e| Node::parse(e).map(Arc::new))
            .collect::<WaypointResult<Vec<_>>>()?;
        Ok(Balancing::with_endpoints(strategy, endpoints))
    }
}

impl InterceptorConfig {
    pub fn is_balancer(&self) -> bool {
        matches!(self, InterceptorConfig::Balancer { .. })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let InterceptorConfig::Balancer {
            online_checker: Some(checker),
            ..
        } = self
        {
            if checker.ping_timeout_ms == 0 || checker.retry_time_secs == Some(0) {
                return Err(anyhow::anyhow!(
                    "online_checker ping_timeout_ms and retry_time_secs must be greater than 0"
                ));
            }
        }
        Ok(())
    }

    /// Instantiate the interceptor against the shared cluster manager
    pub fn build(
        &self,
        clusters: &Arc<ClusterManager>,
        node_timeout: Duration,
    ) -> WaypointResult<Arc<dyn Interceptor>> {
        match self {
            InterceptorConfig::Balancer {
                name,
                priority,
                failover,
                session,
                online_checker,
            } => {
                let mut interceptor = LoadBalancingInterceptor::new(Arc::clone(clusters))
                    .with_failover(*failover)
                    .with_node_timeout(node_timeout);
                if let Some(name) = name {
                    interceptor = interceptor.with_name(name.as_str());
                }
                if let Some(priority) = priority {
                    interceptor = interceptor.with_priority(*priority);
                }
                if let Some(session) = session {
                    interceptor = interceptor.with_session_extractor(session.build()?);
                }
                if let Some(checker) = online_checker {
                    interceptor = interceptor.with_online_checker(Arc::new(checker.build()));
                }
                Ok(Arc::new(interceptor))
            }
            InterceptorConfig::ClusterNotification {
                priority,
                validate_signature,
                key,
                replay_window_secs,
            } => {
                let mut interceptor = ClusterNotificationInterceptor::new(Arc::clone(clusters))?;
                if *validate_signature {
                    let key = key.as_deref().filter(|k| !k.is_empty()).ok_or_else(|| {
                        WaypointError::config("cluster_notification requires a key when validate_signature is set")
                    })?;
                    interceptor = interceptor
                        .with_signature(key.as_bytes(), Duration::from_secs(*replay_window_secs));
                }
                if let Some(priority) = priority {
                    interceptor = interceptor.with_priority(*priority);
                }
                Ok(Arc::new(interceptor))
            }
            InterceptorConfig::Headers {
                name,
                priority,
                request,
                response,
                remove_request,
                remove_response,
            } => {
                let mut interceptor = HeaderInterceptor::from_maps(name, request, response)?
                    .remove_from_request(remove_request)?
                    .remove_from_response(remove_response)?;
                if let Some(priority) = priority {
                    interceptor = interceptor.with_priority(*priority);
                }
                Ok(Arc::new(interceptor))
            }
        }
    }
}

impl RuleConfig {
    pub fn key(&self) -> WaypointResult<RuleKey> {
        let mut key = RuleKey::new(self.port)
            .with_host(&self.host)
            .with_method(&self.method);
        key = match (&self.path, &self.path_regex) {
            (Some(_), Some(_)) => {
                return Err(WaypointError::config(format!(
                    "Rule '{}' sets both path and path_regex",
                    self.name
                )))
            }
            (Some(path), None) => key.with_path(path),
            (None, Some(regex)) => key.with_path_regex(regex)?,
            (None, None) => key,
        };
        if let Some(ip) = self.ip {
            key = key.with_ip(ip);
        }
        Ok(key)
    }

    /// Build the rule with its interceptor chain. A balancing rule without an
    /// explicit balancer interceptor gets a default one.
    pub fn build(&self, clusters: &Arc<ClusterManager>, node_timeout: Duration) -> WaypointResult<Rule> {
        let mut rule = Rule::new(self.name.as_str(), self.key()?)
            .with_blocking(self.block_request, self.block_response)
            .with_tls(self.inbound_tls, self.outbound_tls);

        if let Some(target) = &self.target {
            rule = rule.with_target(target.host.as_str(), target.port);
        }

        let mut interceptors = self
            .interceptors
            .iter()
            .map(|i| i.build(clusters, node_timeout))
            .collect::<WaypointResult<Vec<_>>>()?;

        if let Some(balancing) = &self.balancing {
            rule = rule.with_balancing(balancing.build()?);
            if !self.interceptors.iter().any(InterceptorConfig::is_balancer) {
                interceptors.push(Arc::new(
                    LoadBalancingInterceptor::new(Arc::clone(clusters)).with_node_timeout(node_timeout),
                ));
            }
        }

        Ok(rule.with_interceptors(interceptors))
    }

    /// Validate the rule on its own
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            return Err(anyhow::anyhow!("Rule name cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("Rule '{}' must listen on a non-zero port", self.name));
        }
        match (&self.target, &self.balancing) {
            (Some(_), Some(_)) => {
                return Err(anyhow::anyhow!(
                    "Rule '{}' sets both a target and balancing",
                    self.name
                ))
            }
            (None, None) if !self.has_terminal_interceptor() => {
                return Err(anyhow::anyhow!(
                    "Rule '{}' needs a target, balancing or a cluster_notification interceptor",
                    self.name
                ))
            }
            _ => {}
        }
        match self.balancing.as_ref().map(|b| &b.strategy) {
            Some(StrategyConfig::ByThread {
                max_per_endpoint,
                attempts,
                ..
            }) if *max_per_endpoint == 0 || *attempts == 0 => {
                return Err(anyhow::anyhow!(
                    "Rule '{}': by_thread max_per_endpoint and attempts must be greater than 0",
                    self.name
                ));
            }
            Some(StrategyConfig::FaultMonitoring {
                min_flawless_ratio, ..
            }) if !(0.0..=1.0).contains(min_flawless_ratio) => {
                return Err(anyhow::anyhow!(
                    "Rule '{}': fault_monitoring min_flawless_ratio must be between 0 and 1",
                    self.name
                ));
            }
            _ => {}
        }
        for interceptor in &self.interceptors {
            interceptor
                .validate()
                .map_err(|e| anyhow::anyhow!("Rule '{}': {}", self.name, e))?;
        }
        self.key()?;
        Ok(())
    }

    fn has_terminal_interceptor(&self) -> bool {
        self.interceptors
            .iter()
            .any(|i| matches!(i, InterceptorConfig::ClusterNotification { .. }))
    }
}
