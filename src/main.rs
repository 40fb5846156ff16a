//! Upstream balancer demonstration binary.
//!
//! Loads a cluster configuration, runs one control loop per cluster with TCP
//! health checks, reloads the file on change and stops on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use upstream_balancer::config::loader::load_config;
use upstream_balancer::config::watcher::ConfigWatcher;
use upstream_balancer::health::ProbeTransportRegistry;
use upstream_balancer::lifecycle::signals;
use upstream_balancer::observability::{logging, metrics};
use upstream_balancer::{ClusterManager, Shutdown};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "upstream-balancer", version, about = "Upstream load balancing core")]
struct Args {
    /// Path to the configuration file (TOML, or JSON with a `.json` extension).
    #[arg(short, long, default_value = "upstream.toml")]
    config: PathBuf,

    /// Do not watch the configuration file for changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init(&config.observability.log_level);
    tracing::info!(config = ?args.config, clusters = config.clusters.len(), "upstream-balancer starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let manager = Arc::new(ClusterManager::new(ProbeTransportRegistry::with_tcp()));
    let mut tasks = manager.apply_config(&config, &shutdown);

    // Keep the watcher alive for the lifetime of the process.
    let (_watcher, mut reloads) = if args.no_watch {
        (None, None)
    } else {
        let (watcher, rx) = ConfigWatcher::new(&args.config, config.clone());
        (Some(watcher.run()?), Some(rx))
    };

    let stop = signals::shutdown_signal();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            Some(next) = recv_reload(reloads.as_mut()) => {
                tracing::info!(clusters = next.clusters.len(), "Applying reloaded configuration");
                tasks.extend(manager.apply_config(&next, &shutdown));
            }
            _ = &mut stop => break,
        }
    }

    shutdown.trigger();
    let aborted = Shutdown::drain(tasks, SHUTDOWN_DEADLINE).await;
    tracing::info!(aborted, "Shutdown complete");
    Ok(())
}

async fn recv_reload(
    rx: Option<&mut tokio::sync::mpsc::UnboundedReceiver<upstream_balancer::UpstreamConfig>>,
) -> Option<upstream_balancer::UpstreamConfig> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
