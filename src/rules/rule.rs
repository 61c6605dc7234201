//! 路由规则
//!
//! 一条 `Rule` 由匹配键、拦截器链以及目标（单一主机或后端节点集合）组成。
//! 拦截器链和静态节点列表可以在流量进行中被替换，读取方总是拿到一致的快照。

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;

use super::key::RuleKey;
use crate::balancer::{ClusterManager, DispatchingStrategy, Node, DEFAULT_CLUSTER};
use crate::interceptor::Interceptor;

/// 单一转发目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// 负载均衡节点来源
pub enum EndpointSource {
    /// 静态节点列表
    Static(ArcSwap<Vec<Arc<Node>>>),
    /// 由集群管理器维护的动态集群
    Cluster(String),
}

/// 负载均衡规则的后端设置
pub struct Balancing {
    strategy: Arc<dyn DispatchingStrategy>,
    source: EndpointSource,
}

impl Balancing {
    pub fn with_endpoints(strategy: Arc<dyn DispatchingStrategy>, endpoints: Vec<Arc<Node>>) -> Self {
        Self {
            strategy,
            source: EndpointSource::Static(ArcSwap::from_pointee(endpoints)),
        }
    }

    pub fn with_cluster<S: Into<String>>(strategy: Arc<dyn DispatchingStrategy>, cluster: S) -> Self {
        Self {
            strategy,
            source: EndpointSource::Cluster(cluster.into()),
        }
    }

    pub fn strategy(&self) -> &Arc<dyn DispatchingStrategy> {
        &self.strategy
    }

    pub fn source(&self) -> &EndpointSource {
        &self.source
    }

    /// 会话绑定所在的集群；静态节点列表使用默认集群
    pub fn cluster_name(&self) -> &str {
        match &self.source {
            EndpointSource::Static(_) => DEFAULT_CLUSTER,
            EndpointSource::Cluster(name) => name,
        }
    }

    /// 替换静态节点列表；动态集群返回 false
    pub fn set_endpoints(&self, endpoints: Vec<Arc<Node>>) -> bool {
        match &self.source {
            EndpointSource::Static(current) => {
                current.store(Arc::new(endpoints));
                true
            }
            EndpointSource::Cluster(_) => false,
        }
    }

    /// 当前可用于分发的节点
    pub fn available_endpoints(&self, clusters: &ClusterManager, node_timeout: Duration) -> Vec<Arc<Node>> {
        match &self.source {
            EndpointSource::Static(endpoints) => endpoints
                .load()
                .iter()
                .filter(|n| n.is_up())
                .cloned()
                .collect(),
            EndpointSource::Cluster(name) => clusters.get_available_nodes(name, node_timeout),
        }
    }
}

/// 命名的路由条目
pub struct Rule {
    name: String,
    key: RuleKey,
    interceptors: ArcSwap<Vec<Arc<dyn Interceptor>>>,
    target: Option<Target>,
    balancing: Option<Balancing>,
    block_request: bool,
    block_response: bool,
    inbound_tls: bool,
    outbound_tls: bool,
    /// 已经为本规则运行过的一次性拦截器
    once_ran: Mutex<HashSet<String>>,
}

impl Rule {
    pub fn new<S: Into<String>>(name: S, key: RuleKey) -> Self {
        Self {
            name: name.into(),
            key,
            interceptors: ArcSwap::from_pointee(Vec::new()),
            target: None,
            balancing: None,
            block_request: false,
            block_response: false,
            inbound_tls: false,
            outbound_tls: false,
            once_ran: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_target<S: Into<String>>(mut self, host: S, port: u16) -> Self {
        self.target = Some(Target {
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_balancing(mut self, balancing: Balancing) -> Self {
        self.balancing = Some(balancing);
        self
    }

    pub fn with_interceptors(self, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        self.set_interceptors(interceptors);
        self
    }

    pub fn with_blocking(mut self, block_request: bool, block_response: bool) -> Self {
        self.block_request = block_request;
        self.block_response = block_response;
        self
    }

    pub fn with_tls(mut self, inbound: bool, outbound: bool) -> Self {
        self.inbound_tls = inbound;
        self.outbound_tls = outbound;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// 目标基础URL；出站TLS时使用https
    pub fn target_url(&self) -> Option<String> {
        let target = self.target.as_ref()?;
        let scheme = if self.outbound_tls { "https" } else { "http" };
        Some(format!("{}://{}:{}", scheme, target.host, target.port))
    }

    pub fn balancing(&self) -> Option<&Balancing> {
        self.balancing.as_ref()
    }

    pub fn block_request(&self) -> bool {
        self.block_request
    }

    pub fn block_response(&self) -> bool {
        self.block_response
    }

    pub fn inbound_tls(&self) -> bool {
        self.inbound_tls
    }

    pub fn outbound_tls(&self) -> bool {
        self.outbound_tls
    }

    /// 拦截器链快照，按优先级升序
    pub fn interceptors(&self) -> Arc<Vec<Arc<dyn Interceptor>>> {
        self.interceptors.load_full()
    }

    /// 整体替换拦截器链（稳定排序，同优先级保持原顺序）
    pub fn set_interceptors(&self, mut interceptors: Vec<Arc<dyn Interceptor>>) {
        interceptors.sort_by_key(|i| i.priority());
        self.interceptors.store(Arc::new(interceptors));
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.rcu(|current| {
            let mut next: Vec<Arc<dyn Interceptor>> = current.iter().cloned().collect();
            next.push(Arc::clone(&interceptor));
            next.sort_by_key(|i| i.priority());
            next
        });
    }

    pub fn remove_interceptor(&self, name: &str) -> bool {
        let previous = self.interceptors.rcu(|current| {
            current
                .iter()
                .filter(|i| i.name() != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|i| i.name() == name)
    }

    /// 记录一次性拦截器的运行；首次调用返回 true
    pub fn mark_once(&self, interceptor: &str) -> bool {
        self.once_ran.lock().insert(interceptor.to_string())
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("key", &self.key.to_string())
            .field("target", &self.target)
            .field("balancing", &self.balancing.as_ref().map(|b| b.cluster_name()))
            .field("interceptors", &self.interceptors.load().len())
            .finish()
    }
}
