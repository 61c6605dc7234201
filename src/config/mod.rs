//! # 配置管理模块
//!
//! 本模块负责网关的完整配置管理，包括：
//!
//! - TOML配置文件解析和验证
//! - 环境变量替换和扩展（`${VAR}` 与 `${VAR:-default}`）
//! - 从声明式配置构建路由规则、拦截器和集群
//! - 配置热重载支持
//!
//! ## 配置结构
//!
//! - `server`: 监听地址
//! - `logging`: 日志级别与输出格式
//! - `http_client`: 上游HTTP客户端连接池
//! - `balancer`: 会话超时、清理周期以及预先声明的集群
//! - `interceptors`: 全局（骨干）拦截器
//! - `rules`: 路由规则
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use waypoint::config::Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file_with_env("config.toml").await?;
//! println!("规则数量: {}", config.rules.len());
//! # Ok(())
//! # }
//! ```

pub mod balancer; // 集群与会话配置
pub mod http_client; // HTTP客户端配置模块
pub mod logging; // 日志配置模块
pub mod manager; // 配置管理器和热重载模块
pub mod rules; // 路由规则与拦截器配置
pub mod server; // 服务器配置模块

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub use balancer::{BalancerConfig, ClusterConfig, NodeConfig};
pub use http_client::HttpClientConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use manager::ConfigManager;
pub use rules::{
    BalancingConfig, InterceptorConfig, RuleConfig, SessionExtractorConfig, StrategyConfig,
    TargetConfig,
};
pub use server::ServerConfig;

use crate::balancer::ClusterManager;
use crate::error::{WaypointError, WaypointResult};
use crate::interceptor::Interceptor;
use crate::router::Router;
use crate::rules::{Rule, RuleTable};

/// 网关主配置结构
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 上游HTTP客户端连接池配置（可选）
    pub http_client: Option<HttpClientConfig>,
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// 全局拦截器，按优先级插入骨干链
    #[serde(default)]
    pub interceptors: Vec<InterceptorConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Config {
    /// Load configuration from file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parse, default and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded_content = expand_env_vars(content);
        let mut config: Config = toml::from_str(&expanded_content)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Apply default values where needed
    fn apply_defaults(&mut self) {
        if self.http_client.is_none() {
            self.http_client = Some(HttpClientConfig::default());
        }

        for rule in &mut self.rules {
            if rule.path.as_deref() == Some("") {
                rule.path = None;
            }
        }
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        self.balancer.validate()?;

        if let Some(http_client) = &self.http_client {
            http_client.validate()?;
        }

        for rule in &self.rules {
            rule.validate()?;
        }

        for interceptor in &self.interceptors {
            interceptor.validate()?;
        }

        if self.rules.is_empty() {
            warn!("No rules configured - the gateway will not listen on any port");
        }

        self.validate_cross_dependencies()?;
        Ok(())
    }

    /// Rule keys must be unique and balancing rules must reference declared clusters
    fn validate_cross_dependencies(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(WaypointError::inconsistency(format!(
                    "Duplicate rule name '{}'",
                    rule.name
                ))
                .into());
            }
            let key = rule.key()?;
            if !keys.insert(key.clone()) {
                return Err(WaypointError::inconsistency(format!(
                    "Rule '{}' duplicates the key {} of an earlier rule",
                    rule.name, key
                ))
                .into());
            }

            if let Some(balancing) = &rule.balancing {
                if balancing.endpoints.is_empty() && !self.balancer.declares(balancing.cluster_name()) {
                    return Err(WaypointError::inconsistency(format!(
                        "Rule '{}' balances over undeclared cluster '{}'",
                        rule.name,
                        balancing.cluster_name()
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Cluster manager with the declared clusters and their initial nodes
    pub fn build_cluster_manager(&self) -> Arc<ClusterManager> {
        let manager = Arc::new(ClusterManager::new(self.balancer.get_session_timeout()));
        for cluster in &self.balancer.clusters {
            let nodes: Vec<_> = cluster
                .nodes
                .iter()
                .map(|n| (n.host.clone(), n.port, n.status))
                .collect();
            manager.register(&cluster.name, &nodes);
        }
        manager
    }

    pub fn build_rules(&self, clusters: &Arc<ClusterManager>) -> WaypointResult<Vec<Arc<Rule>>> {
        let node_timeout = self.balancer.get_node_timeout();
        self.rules
            .iter()
            .map(|r| r.build(clusters, node_timeout).map(Arc::new))
            .collect()
    }

    /// Standard backbone plus the configured global interceptors
    pub fn build_backbone(
        &self,
        rules: &Arc<RuleTable>,
        clusters: &Arc<ClusterManager>,
    ) -> WaypointResult<Vec<Arc<dyn Interceptor>>> {
        let mut backbone = Router::default_backbone(rules, self.fail_over_on_5xx());
        for interceptor in &self.interceptors {
            backbone.push(interceptor.build(clusters, self.balancer.get_node_timeout())?);
        }
        Ok(backbone)
    }

    /// Assemble rule table, cluster manager and pipeline into a router
    pub fn build_router(&self) -> WaypointResult<Router> {
        let clusters = self.build_cluster_manager();
        let rules = Arc::new(RuleTable::from_rules(self.build_rules(&clusters)?)?);
        let backbone = self.build_backbone(&rules, &clusters)?;
        Ok(Router::with_pipeline(
            rules,
            clusters,
            Arc::new(crate::interceptor::Pipeline::new(backbone)),
        ))
    }

    pub fn fail_over_on_5xx(&self) -> bool {
        self.http_client.as_ref().is_some_and(|c| c.fail_over_on_5xx)
    }
}

/// Expand environment variables in configuration content
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let mut cursor = 0;

    while let Some(offset) = result[cursor..].find("${") {
        let start = cursor + offset;
        let Some(end) = result[start..].find('}') else {
            break; // Malformed ${VAR expression
        };

        let var_expr = &result[start + 2..start + end];
        let replacement = if let Some(default_pos) = var_expr.find(":-") {
            let var_name = &var_expr[..default_pos];
            let default_value = &var_expr[default_pos + 2..];
            env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        } else {
            env::var(var_expr).unwrap_or_else(|_| {
                warn!(
                    "Environment variable '{}' not found, using empty string",
                    var_expr
                );
                String::new()
            })
        };

        result.replace_range(start..start + end + 1, &replacement);
        cursor = start + replacement.len();
    }

    result
}
