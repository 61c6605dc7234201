use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::balancer::{HealthMonitor, NodeStatus};

/// Cluster manager and session sweeper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// Idle time after which a session binding is dropped
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_sweep_delay")]
    pub sweep_delay_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Down nodes older than this vanish from node listings; 0 keeps them forever
    #[serde(default)]
    pub node_timeout_secs: u64,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Periodic health requests against every cluster node; off when absent
    pub health_monitor: Option<HealthMonitorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_health_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl HealthMonitorConfig {
    pub fn build(&self) -> HealthMonitor {
        HealthMonitor::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.interval_ms),
        )
        .with_timeout(Duration::from_millis(self.timeout_ms))
        .with_path(self.path.as_str())
    }
}

/// A cluster declared up front, with its initial nodes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_node_status")]
    pub status: NodeStatus,
}

fn default_session_timeout() -> u64 {
    120
}

fn default_sweep_delay() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_health_delay() -> u64 {
    crate::balancer::health::DEFAULT_HEALTH_DELAY.as_millis() as u64
}

fn default_health_interval() -> u64 {
    crate::balancer::health::DEFAULT_HEALTH_INTERVAL.as_millis() as u64
}

fn default_health_timeout() -> u64 {
    crate::balancer::health::DEFAULT_HEALTH_TIMEOUT.as_millis() as u64
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_node_status() -> NodeStatus {
    NodeStatus::Up
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
            sweep_delay_secs: default_sweep_delay(),
            sweep_interval_secs: default_sweep_interval(),
            node_timeout_secs: 0,
            clusters: Vec::new(),
            health_monitor: None,
        }
    }
}

impl BalancerConfig {
    /// Validate balancer configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "Balancer session_timeout_secs must be greater than 0"
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "Balancer sweep_interval_secs must be greater than 0"
            ));
        }

        if let Some(health) = &self.health_monitor {
            if health.interval_ms == 0 || health.timeout_ms == 0 {
                return Err(anyhow::anyhow!(
                    "Balancer health_monitor interval_ms and timeout_ms must be greater than 0"
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(anyhow::anyhow!("Cluster name cannot be empty"));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(anyhow::anyhow!(
                    "Cluster '{}' is declared more than once",
                    cluster.name
                ));
            }
            for node in &cluster.nodes {
                if node.host.is_empty() || node.port == 0 {
                    return Err(anyhow::anyhow!(
                        "Cluster '{}' has a node with an empty host or port 0",
                        cluster.name
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn get_session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn get_sweep_delay(&self) -> Duration {
        Duration::from_secs(self.sweep_delay_secs)
    }

    pub fn get_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn get_node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Whether `name` is the default cluster or declared here
    pub fn declares(&self, name: &str) -> bool {
        name == crate::balancer::DEFAULT_CLUSTER || self.clusters.iter().any(|c| c.name == name)
    }
}
