//! # 负载均衡模块
//!
//! 本模块管理后端节点集群，并为匹配到的请求选择目标节点。
//!
//! ## 组成部分
//!
//! - **节点 (Node)**: 后端地址及其状态（UP / DOWN / TAKEOUT）和请求统计
//! - **集群管理 (ClusterManager)**: 按名称组织节点，维护会话与节点的绑定
//! - **会话清理 (SessionSweeper)**: 定期清除超时未使用的会话
//! - **分发策略 (DispatchingStrategy)**: 轮询、按并发数限制的 by-thread 策略，以及避开故障节点的 fault-monitoring 策略
//! - **健康检查**: 按失败次数自动下线节点 (NodeOnlineChecker)，以及周期性探测节点 (HealthMonitor)
//! - **会话标识提取**: 从 Cookie 或 XML 报文元素中读取会话 ID
//! - **集群通知**: 通过签名的 HTTP 请求上线、下线或摘除节点
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::time::Duration;
//! use waypoint::balancer::{ClusterManager, SessionSweeper};
//!
//! # async fn example() {
//! let clusters = Arc::new(ClusterManager::default());
//! clusters.up("orders", "10.0.0.5", 8080);
//! clusters.takeout("orders", "10.0.0.6", 8080);
//!
//! let available = clusters.get_available_nodes("orders", Duration::ZERO);
//! assert_eq!(available.len(), 1);
//!
//! let sweeper = SessionSweeper::default();
//! sweeper.start(Arc::clone(&clusters));
//! # }
//! ```

pub mod cluster; // 集群：节点列表与会话表
pub mod fault_monitoring; // 故障感知分发策略
pub mod health; // 周期性健康检查
pub mod interceptor; // 负载均衡拦截器
pub mod manager; // 集群管理器
pub mod node; // 后端节点
pub mod notification; // 集群状态通知
pub mod online; // 按失败次数下线 / 恢复节点
pub mod session; // 会话 ID 提取
pub mod strategy; // 分发策略
pub mod sweeper; // 过期会话清理

pub use cluster::{Cluster, Session, DEFAULT_CLUSTER};
pub use fault_monitoring::FaultMonitoringStrategy;
pub use health::HealthMonitor;
pub use interceptor::LoadBalancingInterceptor;
pub use manager::{ClusterListener, ClusterManager, DEFAULT_SESSION_TIMEOUT};
pub use node::{Node, NodeStats, NodeStatus};
pub use notification::{
    notification_url, sign_notification, ClusterNotificationInterceptor, NodeAction, Notification,
};
pub use online::NodeOnlineChecker;
pub use session::{
    CookieSessionIdExtractor, MessageSide, SessionIdExtractor, XmlElementSessionIdExtractor,
};
pub use strategy::{ByThreadStrategy, DispatchingStrategy, RoundRobinStrategy};
pub use sweeper::SessionSweeper;
