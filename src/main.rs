//! peermux - peer connection multiplexer
//!
//! Bridges local TCP applications to peers reachable over a native
//! peer-to-peer transport, multiplexing many streams over one physical link
//! per peer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peermux::transport::StaticTransport;
use peermux::{config::ConfigManager, ConnectionManager, ShutdownCoordinator};

/// CLI arguments for peermux
#[derive(Parser, Debug)]
#[command(name = "peermux")]
#[command(about = "Peer connection multiplexer")]
#[command(version)]
#[command(long_about = "
peermux - peer connection multiplexer

Exposes every configured peer as a local TCP port and forwards streams
arriving from the native transport to the router port.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  PEERMUX_ROUTER_PORT   - Local port of the application's router server
  PEERMUX_MAX_PEERS     - Maximum number of peer listeners kept alive
  PEERMUX_IDLE_TIMEOUT  - Physical link idle timeout (e.g., 30s, 2m)
  PEERMUX_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    #[arg(short, long, default_value = "peermux.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    #[arg(short, long, help = "Router port (overrides config file)")]
    pub router_port: Option<u16>,

    #[arg(long, help = "Maximum number of peer listeners")]
    pub max_peers: Option<usize>,

    #[arg(long, help = "Physical link idle timeout in seconds")]
    pub idle_timeout: Option<u64>,

    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.router_port,
        args.max_peers,
        args.idle_timeout,
        args.log_level.as_deref(),
    );

    init_tracing(&config.monitoring.log_level, args.verbose)?;
    info!("Starting peermux v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Router port: {}", config.bridge.router_port);
        info!("  Max peers: {}", config.bridge.max_peers);
        info!("  Physical idle timeout: {:?}", config.bridge.physical_idle_timeout);
        info!("  Configured peers: {}", config.peers.len());
        return Ok(());
    }

    let transport = Arc::new(StaticTransport::from_peers(&config.peers));
    let manager = ConnectionManager::new(config.bridge.clone(), transport);
    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));

    let mut events = manager.subscribe();
    let event_logger = shutdown_coordinator.spawn("event-logger", async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "peermux::events", "{}", json),
                    Err(e) => warn!("Failed to serialise event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let native_port = manager
        .start()
        .await
        .context("Failed to start connection manager")?;
    info!("Native bridge port: {}", native_port);

    for peer in &config.peers {
        match manager
            .create_peer_listener(&peer.peer_id, peer.please_connect)
            .await
        {
            Ok(port) => info!(peer = %peer.peer_id, "Peer reachable on 127.0.0.1:{}", port),
            Err(e) => warn!(peer = %peer.peer_id, "Failed to create peer listener: {}", e),
        }
    }

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    shutdown_coordinator.stop_manager(&manager).await?;
    if let Err(e) = event_logger.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true),
        )
        .with(env_filter)
        .try_init()
        .context("Failed to initialise tracing")?;

    Ok(())
}
