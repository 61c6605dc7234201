use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Server configuration
///
/// Listening ports come from the rules; only the interface is configured here.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
}

fn default_bind_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
        }
    }
}
