//! 规则匹配键
//!
//! `RuleKey` 描述一条规则接受哪些流量：端口、主机、方法和路径。

use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::error::WaypointResult;
use crate::exchange::Exchange;

/// 通配符
pub const WILDCARD: &str = "*";

/// 主机匹配模式（区分大小写）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostPattern {
    Any,
    Exact(String),
}

/// HTTP方法匹配模式
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodPattern {
    Any,
    Exact(String),
}

/// 路径匹配模式
#[derive(Debug, Clone)]
pub enum PathPattern {
    Any,
    /// 与请求路径（不含查询串）完全相等
    Literal(String),
    /// 对路径和查询串做整体匹配
    Regex { source: String, compiled: Regex },
}

impl PathPattern {
    pub fn regex(source: &str) -> WaypointResult<Self> {
        let compiled = Regex::new(&format!("^(?:{})$", source))?;
        Ok(PathPattern::Regex {
            source: source.to_string(),
            compiled,
        })
    }

    fn identity(&self) -> (u8, &str) {
        match self {
            PathPattern::Any => (0, ""),
            PathPattern::Literal(path) => (1, path),
            PathPattern::Regex { source, .. } => (2, source),
        }
    }

    fn matches(&self, path: &str, path_and_query: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Literal(expected) => expected == path,
            PathPattern::Regex { compiled, .. } => compiled.is_match(path_and_query),
        }
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for PathPattern {}

impl Hash for PathPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// 入站请求中参与匹配的字段
#[derive(Debug, Clone)]
pub struct MatchInput<'a> {
    /// Host头（可带端口）
    pub host: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub path_and_query: &'a str,
    pub port: u16,
    pub local_ip: Option<IpAddr>,
}

impl<'a> MatchInput<'a> {
    pub fn from_exchange(exc: &'a Exchange) -> Self {
        let request = exc.request();
        let host = request
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().host())
            .unwrap_or("");

        Self {
            host,
            method: request.method().as_str(),
            path: request.uri().path(),
            path_and_query: exc.path_and_query(),
            port: exc.local_addr().port(),
            local_ip: Some(exc.local_addr().ip()),
        }
    }
}

/// 去掉Host头中的端口部分，兼容IPv6字面量
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// 规则的不可变匹配键
///
/// 相等性和哈希基于全部匹配字段，用于检测重复路由。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    port: u16,
    host: HostPattern,
    method: MethodPattern,
    path: PathPattern,
    ip: Option<IpAddr>,
}

impl RuleKey {
    /// 匹配指定端口上全部流量的键
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: HostPattern::Any,
            method: MethodPattern::Any,
            path: PathPattern::Any,
            ip: None,
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = if host == WILDCARD || host.is_empty() {
            HostPattern::Any
        } else {
            HostPattern::Exact(host.to_string())
        };
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = if method == WILDCARD || method.is_empty() {
            MethodPattern::Any
        } else {
            MethodPattern::Exact(method.to_string())
        };
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = PathPattern::Literal(path.to_string());
        self
    }

    pub fn with_path_regex(mut self, regex: &str) -> WaypointResult<Self> {
        self.path = PathPattern::regex(regex)?;
        Ok(self)
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &HostPattern {
        &self.host
    }

    pub fn method(&self) -> &MethodPattern {
        &self.method
    }

    pub fn path(&self) -> &PathPattern {
        &self.path
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// 判断入站请求是否属于此规则
    pub fn matches(&self, input: &MatchInput<'_>) -> bool {
        if self.port != input.port {
            return false;
        }

        if let Some(ip) = self.ip {
            if input.local_ip != Some(ip) {
                return false;
            }
        }

        if let HostPattern::Exact(expected) = &self.host {
            if expected != strip_port(input.host) {
                return false;
            }
        }

        if let MethodPattern::Exact(expected) = &self.method {
            if expected != input.method {
                return false;
            }
        }

        self.path.matches(input.path, input.path_and_query)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = match &self.host {
            HostPattern::Any => WILDCARD,
            HostPattern::Exact(h) => h,
        };
        let method = match &self.method {
            MethodPattern::Any => WILDCARD,
            MethodPattern::Exact(m) => m,
        };
        let path = match &self.path {
            PathPattern::Any => "*".to_string(),
            PathPattern::Literal(p) => p.clone(),
            PathPattern::Regex { source, .. } => format!("~{}", source),
        };
        write!(f, "{} {}:{}{}", method, host, self.port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(host: &'a str, method: &'a str, pq: &'a str, port: u16) -> MatchInput<'a> {
        MatchInput {
            host,
            method,
            path: pq.split('?').next().unwrap_or(pq),
            path_and_query: pq,
            port,
            local_ip: None,
        }
    }

    #[test]
    fn test_wildcard_rule_matches_everything_on_port() {
        let key = RuleKey::new(8080)
            .with_host("*")
            .with_method("*")
            .with_path_regex(".*")
            .unwrap();

        assert!(key.matches(&input("a.com", "GET", "/x", 8080)));
        assert!(key.matches(&input("b.org:8080", "DELETE", "/y/z?q=1", 8080)));
        assert!(!key.matches(&input("a.com", "GET", "/x", 8081)));
    }

    #[test]
    fn test_exact_host() {
        let key = RuleKey::new(80).with_host("example.com");
        assert!(key.matches(&input("example.com", "GET", "/", 80)));
        assert!(key.matches(&input("example.com:80", "GET", "/", 80)));
        assert!(!key.matches(&input("other.com", "GET", "/", 80)));
        // Host comparison is case-sensitive
        assert!(!key.matches(&input("Example.com", "GET", "/", 80)));
    }

    #[test]
    fn test_literal_path_ignores_query() {
        let key = RuleKey::new(9000).with_method("GET").with_path("/service");
        assert!(key.matches(&input("h", "GET", "/service?a=1", 9000)));
        assert!(!key.matches(&input("h", "GET", "/service/x", 9000)));
        assert!(!key.matches(&input("h", "POST", "/service", 9000)));
    }

    #[test]
    fn test_regex_path_is_anchored() {
        let key = RuleKey::new(80).with_path_regex("/api/.*").unwrap();
        assert!(key.matches(&input("h", "GET", "/api/v1?x=y", 80)));
        assert!(!key.matches(&input("h", "GET", "/v2/api/x", 80)));
    }

    #[test]
    fn test_local_ip_restriction() {
        let key = RuleKey::new(80).with_ip("10.0.0.1".parse().unwrap());
        let mut req = input("h", "GET", "/", 80);
        assert!(!key.matches(&req));
        req.local_ip = Some("10.0.0.1".parse().unwrap());
        assert!(key.matches(&req));
    }

    #[test]
    fn test_key_equality_detects_duplicates() {
        let a = RuleKey::new(80).with_host("h").with_path_regex("/a.*").unwrap();
        let b = RuleKey::new(80).with_host("h").with_path_regex("/a.*").unwrap();
        let c = RuleKey::new(80).with_host("h").with_path("/a.*");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
    }
}
