//! # 代理服务器模块
//!
//! 本模块负责网关的 HTTP 入口与出口：
//!
//! - `ProxyServer`: 为路由表中的每个端口启动一个 hyper 监听器，
//!   运行时新增规则的端口会自动开始监听
//! - `http_client`: 共享的出站 HTTP/HTTPS 客户端连接池
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waypoint::balancer::ClusterManager;
//! use waypoint::proxy::ProxyServer;
//! use waypoint::router::Router;
//! use waypoint::rules::RuleTable;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let router = Router::new(
//!     Arc::new(RuleTable::new()),
//!     Arc::new(ClusterManager::default()),
//!     false,
//! );
//! let server = ProxyServer::new(router, "0.0.0.0".parse()?);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod http_client; // HTTP客户端连接池管理
pub mod server; // 按端口监听的代理服务器

pub use server::ProxyServer;
