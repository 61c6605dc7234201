//! # 路由规则模块
//!
//! 本模块决定入站请求属于哪一条配置的路由规则：
//!
//! - `RuleKey`: 不可变的匹配键（端口、主机、方法、路径或路径正则）
//! - `Rule`: 路由条目，包含拦截器链、转发目标或负载均衡设置
//! - `RuleTable`: 写时复制的路由表，支持运行时增删规则和变更通知
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waypoint::rules::{Rule, RuleKey, RuleTable};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let table = RuleTable::new();
//! let key = RuleKey::new(8080).with_method("GET").with_path("/service");
//! table.add(Arc::new(Rule::new("service", key).with_target("localhost", 3000)))?;
//! assert_eq!(table.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod key; // 匹配键
pub mod rule; // 路由条目
pub mod table; // 路由表

pub use key::{HostPattern, MatchInput, MethodPattern, PathPattern, RuleKey};
pub use rule::{Balancing, EndpointSource, Rule, Target};
pub use table::{RuleListener, RuleTable};
