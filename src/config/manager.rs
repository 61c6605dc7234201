use anyhow::Result;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Config;
use crate::balancer::ClusterManager;
use crate::error::WaypointResult;
use crate::rules::RuleTable;

type ReloadHook = Arc<dyn Fn(&Config) + Send + Sync>;

/// Configuration manager with hot-reload support
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
    _watcher: Option<RecommendedWatcher>,
    reload_hook: Option<ReloadHook>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Config::from_file_with_env(&config_path).await?;

        Ok(ConfigManager {
            config: Arc::new(RwLock::new(config)),
            config_path,
            _watcher: None,
            reload_hook: None,
        })
    }

    /// Get a clone of the current configuration
    pub fn get_config(&self) -> Config {
        self.config.read().clone()
    }

    /// Set a callback to be invoked after config reload succeeds
    pub fn set_reload_hook<F>(&mut self, hook: F)
    where
        F: Fn(&Config) + Send + Sync + 'static,
    {
        self.reload_hook = Some(Arc::new(hook));
    }

    /// Start watching for configuration file changes
    pub async fn start_hot_reload(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);
        let config_arc = Arc::clone(&self.config);
        let config_path = self.config_path.clone();
        let reload_hook = self.reload_hook.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        error!("Failed to send file change event: {}", e);
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        // Editors often replace the file, so watch the directory as well
        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;
        if let Some(parent) = config_path.parent() {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        info!("Started watching config file: {:?}", config_path);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle_config_change(&event, &config_arc, &config_path, reload_hook.as_ref()).await;
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }

    /// Manually reload configuration from file
    pub async fn reload_config(&self) -> Result<()> {
        info!(
            "Manually reloading configuration from {:?}",
            self.config_path
        );

        let new_config = Config::from_file_with_env(&self.config_path)
            .await
            .inspect_err(|e| error!("Failed to reload configuration: {}", e))?;
        *self.config.write() = new_config.clone();
        if let Some(hook) = &self.reload_hook {
            (hook)(&new_config);
        }
        info!("Configuration reloaded successfully");
        Ok(())
    }
}

/// Swap the rule table for the rules of a freshly loaded configuration
///
/// Clusters declared for the first time are registered with their initial
/// nodes; clusters that already exist keep their runtime node state.
pub fn apply_rules(config: &Config, rules: &RuleTable, clusters: &Arc<ClusterManager>) -> WaypointResult<()> {
    let known = clusters.cluster_names();
    for cluster in &config.balancer.clusters {
        if known.contains(&cluster.name) {
            continue;
        }
        let nodes: Vec<_> = cluster
            .nodes
            .iter()
            .map(|n| (n.host.clone(), n.port, n.status))
            .collect();
        clusters.register(&cluster.name, &nodes);
    }

    rules.replace_all(config.build_rules(clusters)?)
}

/// Handle configuration file change events
async fn handle_config_change(
    event: &Event,
    config: &Arc<RwLock<Config>>,
    config_path: &Path,
    reload_hook: Option<&ReloadHook>,
) {
    use notify::EventKind;

    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return;
    }

    let config_file_changed = event.paths.iter().any(|path| path == config_path);
    if !config_file_changed {
        return;
    }

    debug!("Config file change detected: {:?}", event);

    // Let the writer finish
    tokio::time::sleep(Duration::from_millis(100)).await;

    match Config::from_file_with_env(config_path).await {
        Ok(new_config) => {
            *config.write() = new_config.clone();
            info!("Configuration hot-reloaded successfully");

            if let Some(hook) = reload_hook {
                (hook)(&new_config);
            }
        }
        Err(e) => {
            warn!(
                "Failed to hot-reload configuration (keeping current): {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    const ONE_RULE: &str = r#"
[[rules]]
name = "a"
port = 9000
target = { host = "localhost", port = 3000 }
"#;

    const TWO_RULES: &str = r#"
[[balancer.clusters]]
name = "orders"
nodes = [{ host = "10.0.0.1", port = 8080 }]

[[rules]]
name = "a"
port = 9000
target = { host = "localhost", port = 3000 }

[[rules]]
name = "b"
port = 9001

[rules.balancing]
cluster = "orders"
"#;

    #[tokio::test]
    async fn test_manual_reload_runs_hook() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ONE_RULE.as_bytes()).unwrap();
        file.flush().unwrap();

        let mut manager = ConfigManager::new(file.path()).await.unwrap();
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reloads);
        manager.set_reload_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::fs::write(file.path(), TWO_RULES).unwrap();
        manager.reload_config().await.unwrap();

        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_config().rules.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ONE_RULE.as_bytes()).unwrap();
        file.flush().unwrap();

        let manager = ConfigManager::new(file.path()).await.unwrap();
        std::fs::write(file.path(), "[[rules]]\nname = 1").unwrap();
        assert!(manager.reload_config().await.is_err());
        assert_eq!(manager.get_config().rules.len(), 1);
    }

    #[test]
    fn test_apply_rules_replaces_table() {
        let first = Config::from_toml_str(ONE_RULE).unwrap();
        let clusters = first.build_cluster_manager();
        let rules = RuleTable::from_rules(first.build_rules(&clusters).unwrap()).unwrap();

        let second = Config::from_toml_str(TWO_RULES).unwrap();
        apply_rules(&second, &rules, &clusters).unwrap();

        assert_eq!(rules.len(), 2);
        assert!(rules.get("b").is_some());
        assert_eq!(
            clusters.get_all_nodes("orders", Duration::ZERO).len(),
            1
        );
    }
}
