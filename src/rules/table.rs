//! 路由表
//!
//! 写时复制的规则集合：匹配总是在一个不可变快照上进行，增删规则时整体替换快照。

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::key::MatchInput;
use super::rule::Rule;
use crate::error::{WaypointError, WaypointResult};

/// 规则变更监听器
pub trait RuleListener: Send + Sync {
    fn rule_added(&self, rule: &Arc<Rule>);

    fn rule_removed(&self, _rule: &Arc<Rule>) {}
}

/// 路由表
pub struct RuleTable {
    rules: ArcSwap<Vec<Arc<Rule>>>,
    /// 串行化写操作，读操作无锁
    write_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn RuleListener>>>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 用一组规则构建路由表，拒绝重复的匹配键
    pub fn from_rules(rules: Vec<Arc<Rule>>) -> WaypointResult<Self> {
        check_unique(&rules)?;
        let table = Self::new();
        table.rules.store(Arc::new(rules));
        Ok(table)
    }

    pub fn add_listener(&self, listener: Arc<dyn RuleListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn RuleListener>> {
        self.listeners.read().clone()
    }

    /// 当前规则快照
    pub fn snapshot(&self) -> Arc<Vec<Arc<Rule>>> {
        self.rules.load_full()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.load().is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.load().iter().find(|r| r.name() == name).cloned()
    }

    /// 所有规则使用的端口
    pub fn ports(&self) -> BTreeSet<u16> {
        self.rules.load().iter().map(|r| r.key().port()).collect()
    }

    /// 第一条匹配的规则
    pub fn match_rule(&self, input: &MatchInput<'_>) -> Option<Arc<Rule>> {
        self.rules
            .load()
            .iter()
            .find(|rule| rule.key().matches(input))
            .cloned()
    }

    /// 添加规则；匹配键或名称重复时返回配置不一致错误
    pub fn add(&self, rule: Arc<Rule>) -> WaypointResult<()> {
        {
            let _guard = self.write_lock.lock();
            let current = self.rules.load_full();
            if let Some(existing) = current
                .iter()
                .find(|r| r.key() == rule.key() || r.name() == rule.name())
            {
                return Err(WaypointError::inconsistency(format!(
                    "Rule '{}' ({}) conflicts with existing rule '{}' ({})",
                    rule.name(),
                    rule.key(),
                    existing.name(),
                    existing.key()
                )));
            }

            let mut next: Vec<Arc<Rule>> = current.iter().cloned().collect();
            next.push(Arc::clone(&rule));
            self.rules.store(Arc::new(next));
        }

        info!(rule = %rule.name(), key = %rule.key(), "Rule added");
        for listener in self.listeners() {
            listener.rule_added(&rule);
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Rule>> {
        let removed = {
            let _guard = self.write_lock.lock();
            let current = self.rules.load_full();
            let removed = current.iter().find(|r| r.name() == name).cloned()?;
            let next: Vec<Arc<Rule>> = current
                .iter()
                .filter(|r| !Arc::ptr_eq(r, &removed))
                .cloned()
                .collect();
            self.rules.store(Arc::new(next));
            removed
        };

        info!(rule = %name, "Rule removed");
        for listener in self.listeners() {
            listener.rule_removed(&removed);
        }
        Some(removed)
    }

    /// 整体替换路由表
    pub fn replace_all(&self, rules: Vec<Arc<Rule>>) -> WaypointResult<()> {
        check_unique(&rules)?;

        let previous = {
            let _guard = self.write_lock.lock();
            self.rules.swap(Arc::new(rules.clone()))
        };

        let listeners = self.listeners();
        for old in previous.iter().filter(|old| !rules.iter().any(|r| Arc::ptr_eq(r, old))) {
            for listener in &listeners {
                listener.rule_removed(old);
            }
        }
        for new in rules.iter().filter(|new| !previous.iter().any(|r| Arc::ptr_eq(r, new))) {
            for listener in &listeners {
                listener.rule_added(new);
            }
        }

        debug!(rules = rules.len(), "Rule table replaced");
        Ok(())
    }
}

fn check_unique(rules: &[Arc<Rule>]) -> WaypointResult<()> {
    let mut keys = HashSet::new();
    let mut names = HashSet::new();
    for rule in rules {
        if !keys.insert(rule.key().clone()) {
            return Err(WaypointError::inconsistency(format!(
                "Duplicate rule key {} (rule '{}')",
                rule.key(),
                rule.name()
            )));
        }
        if !names.insert(rule.name().to_string()) {
            return Err(WaypointError::inconsistency(format!(
                "Duplicate rule name '{}'",
                rule.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rule(name: &str, key: RuleKey) -> Arc<Rule> {
        Arc::new(Rule::new(name, key))
    }

    fn input(host: &str, port: u16) -> MatchInput<'_> {
        MatchInput {
            host,
            method: "GET",
            path: "/",
            path_and_query: "/",
            port,
            local_ip: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl RuleListener for Recorder {
        fn rule_added(&self, _rule: &Arc<Rule>) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn rule_removed(&self, _rule: &Arc<Rule>) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let table = RuleTable::new();
        table.add(rule("a", RuleKey::new(80).with_host("h"))).unwrap();

        let err = table
            .add(rule("b", RuleKey::new(80).with_host("h")))
            .unwrap_err();
        assert!(matches!(err, WaypointError::ConfigurationInconsistency { .. }));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_first_match_wins() {
        let table = RuleTable::new();
        table.add(rule("specific", RuleKey::new(80).with_host("h"))).unwrap();
        table.add(rule("catch-all", RuleKey::new(80))).unwrap();

        assert_eq!(table.match_rule(&input("h", 80)).unwrap().name(), "specific");
        assert_eq!(table.match_rule(&input("x", 80)).unwrap().name(), "catch-all");
        assert!(table.match_rule(&input("h", 81)).is_none());
    }

    #[test]
    fn test_snapshot_is_stable_while_rules_change() {
        let table = RuleTable::new();
        table.add(rule("a", RuleKey::new(80))).unwrap();
        let snapshot = table.snapshot();

        table.remove("a").unwrap();
        table.add(rule("b", RuleKey::new(81))).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "a");
        assert_eq!(table.ports().into_iter().collect::<Vec<_>>(), vec![81]);
    }

    #[test]
    fn test_listeners_notified() {
        let table = RuleTable::new();
        let recorder = Arc::new(Recorder::default());
        table.add_listener(recorder.clone());

        let kept = rule("kept", RuleKey::new(80));
        table.add(Arc::clone(&kept)).unwrap();
        table.add(rule("dropped", RuleKey::new(81))).unwrap();
        table
            .replace_all(vec![kept, rule("new", RuleKey::new(82))])
            .unwrap();

        assert_eq!(recorder.added.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replace_all_rejects_duplicates() {
        let table = RuleTable::new();
        let result = table.replace_all(vec![
            rule("a", RuleKey::new(80)),
            rule("b", RuleKey::new(80)),
        ]);
        assert!(result.is_err());
        assert!(table.is_empty());
    }
}
