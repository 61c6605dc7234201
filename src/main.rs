use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use waypoint::balancer::{notification_url, NodeAction, Notification, SessionSweeper};
use waypoint::config::{manager, Config, ConfigManager, LoggingConfig};
use waypoint::proxy::{http_client, ProxyServer};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "HTTP gateway with rule-based routing and cluster-aware load balancing")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway
    Serve {
        #[arg(short, long, default_value = "config/waypoint.toml")]
        config: String,

        #[arg(short, long)]
        verbose: bool,
    },
    /// Send a node state change to a running gateway
    Notify {
        /// up, down or takeout
        action: NodeAction,

        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        #[arg(long, default_value = waypoint::balancer::DEFAULT_CLUSTER)]
        cluster: String,

        /// Base URL of the gateway, e.g. http://gateway:9000
        #[arg(long)]
        url: String,

        /// Shared signing key
        #[arg(long, env = "WAYPOINT_NOTIFY_KEY")]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Serve { config, verbose } => serve(&config, verbose).await,
        Command::Notify {
            action,
            host,
            port,
            cluster,
            url,
            key,
        } => {
            LoggingConfig::default().init_tracing(false);
            let notification = Notification::new(cluster, host, port);
            let target = notification_url(&url, action, &notification, key.as_deref().map(str::as_bytes))?;
            let status = http_client::get_status(&target, Duration::from_secs(10)).await?;
            if status.is_success() {
                info!("Notification '{}' accepted ({})", action, status);
                Ok(())
            } else {
                Err(anyhow::anyhow!("Notification '{}' rejected with {}", action, status))
            }
        }
    }
}

async fn serve(config_path: &str, verbose: bool) -> Result<()> {
    let mut config_manager = ConfigManager::new(config_path).await?;
    let config: Config = config_manager.get_config();
    config.logging.init_tracing(verbose);

    info!("Starting waypoint gateway");
    info!("Loaded configuration from {}", config_path);

    http_client::init(config.http_client.as_ref());

    let router = config.build_router()?;
    let rules = Arc::clone(router.rules());
    let clusters = Arc::clone(router.clusters());

    let sweeper = SessionSweeper::new(
        config.balancer.get_sweep_delay(),
        config.balancer.get_sweep_interval(),
    );
    sweeper.start(Arc::clone(&clusters));

    let health_monitor = config.balancer.health_monitor.as_ref().map(|h| h.build());
    if let Some(monitor) = &health_monitor {
        monitor.start(Arc::clone(&clusters));
    }

    {
        let rules = Arc::clone(&rules);
        let clusters = Arc::clone(&clusters);
        config_manager.set_reload_hook(move |new_config| {
            match manager::apply_rules(new_config, &rules, &clusters) {
                Ok(()) => info!(rules = rules.len(), "Rules reloaded"),
                Err(e) => error!("Failed to apply reloaded rules (keeping current): {}", e),
            }
        });
    }
    if let Err(e) = config_manager.start_hot_reload().await {
        warn!("Config hot reload disabled: {}", e);
    }

    let server = Arc::new(ProxyServer::new(router, config.server.bind_host));
    let mut running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut running => {
            sweeper.stop();
            if let Some(monitor) = &health_monitor {
                monitor.stop();
            }
            return result?;
        }
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("Received CTRL+C, shutting down gracefully..."),
                Err(e) => error!("Failed to listen for CTRL+C: {}", e),
            }
        }
    }

    server.shutdown();
    sweeper.stop();
    if let Some(monitor) = &health_monitor {
        monitor.stop();
    }
    match running.await {
        Ok(result) => result?,
        Err(e) => error!("Proxy server task failed: {}", e),
    }

    info!("Waypoint stopped");
    Ok(())
}
