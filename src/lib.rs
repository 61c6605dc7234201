//! # Waypoint - 基于规则路由的HTTP网关
//!
//! Waypoint是一个用Rust编写的HTTP网关：它根据配置的路由规则匹配入站请求，
//! 让请求和响应依次通过可插拔的拦截器流水线，并在需要时把请求分发到
//! 后端集群中的某个节点。
//!
//! ## 核心功能
//!
//! - **规则匹配**: 按端口、主机、方法、路径或路径正则匹配路由规则
//! - **拦截器流水线**: 请求按优先级正序、响应按逆序处理，支持 CONTINUE / RETURN / ABORT
//! - **负载均衡**: 轮询、按并发数限制（by-thread）与故障感知（fault-monitoring）三种分发策略，支持故障转移与节点健康检查
//! - **集群管理**: 节点上线、下线、摘除，会话粘性与过期会话清理
//! - **集群通知**: 带签名和防重放校验的节点状态变更接口
//! - **配置热重载**: 无需重启即可替换路由表
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use waypoint::config::Config;
//! use waypoint::proxy::ProxyServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file_with_env("config.toml").await?;
//!     let router = config.build_router()?;
//!     let server = ProxyServer::new(router, config.server.bind_host);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod exchange;
pub mod interceptor;
pub mod proxy;
pub mod router;
pub mod rules;

// Re-export commonly used types
pub use balancer::{ClusterManager, DispatchingStrategy, Node, NodeStatus, SessionSweeper};
pub use error::{ErrorSeverity, WaypointError, WaypointResult};
pub use exchange::{Cancellation, Exchange, ExchangeState};
pub use interceptor::{Interceptor, Outcome, Pipeline};
pub use router::Router;
pub use rules::{Rule, RuleKey, RuleTable};
