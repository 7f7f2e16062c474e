//! Configuration Manager

use super::{BridgeConfig, Config};
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            // Validated by the caller once CLI overrides are merged.
            tracing::info!("Configuration loaded successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            Ok(Config::default())
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(router_port) = std::env::var("PEERMUX_ROUTER_PORT") {
            config.bridge.router_port = router_port
                .parse::<u16>()
                .with_context(|| format!("Invalid PEERMUX_ROUTER_PORT: {}", router_port))?;
        }

        if let Ok(max_peers) = std::env::var("PEERMUX_MAX_PEERS") {
            config.bridge.max_peers = max_peers
                .parse::<usize>()
                .with_context(|| format!("Invalid PEERMUX_MAX_PEERS: {}", max_peers))?;
        }

        if let Ok(timeout) = std::env::var("PEERMUX_IDLE_TIMEOUT") {
            config.bridge.physical_idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PEERMUX_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("PEERMUX_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.bridge
            .validate()
            .with_context(|| "Bridge configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        self.validate_peers()
            .with_context(|| "Peer table validation failed")?;

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    fn validate_peers(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.peer_id.is_empty() {
                bail!("Peer {} has empty peer_id", i);
            }

            if !seen.insert(peer.peer_id.as_str()) {
                bail!("Peer {} duplicates peer_id '{}'", i, peer.peer_id);
            }

            if peer.listening_port == 0
                && (peer.client_port.is_none() || peer.server_port.is_none())
            {
                bail!(
                    "Peer '{}' needs either listening_port or both client_port and server_port",
                    peer.peer_id
                );
            }
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        router_port: Option<u16>,
        max_peers: Option<usize>,
        idle_timeout_secs: Option<u64>,
        log_level: Option<&str>,
    ) {
        if let Some(port) = router_port {
            self.bridge.router_port = port;
            tracing::info!("CLI override: router port set to {}", port);
        }

        if let Some(max_peers) = max_peers {
            self.bridge.max_peers = max_peers;
            tracing::info!("CLI override: max peers set to {}", max_peers);
        }

        if let Some(secs) = idle_timeout_secs {
            self.bridge.physical_idle_timeout = Duration::from_secs(secs);
            tracing::info!("CLI override: physical idle timeout set to {}s", secs);
        }

        if let Some(level) = log_level {
            self.monitoring.log_level = level.to_string();
        }
    }
}

impl BridgeConfig {
    /// Validate bridge configuration
    pub fn validate(&self) -> Result<()> {
        if self.router_port == 0 {
            bail!("router_port must be set to the port of the local router server");
        }

        if self.max_peers == 0 {
            bail!("max_peers must be greater than 0");
        }

        if self.max_peers > 1024 {
            bail!("max_peers cannot exceed 1024");
        }

        if self.physical_idle_timeout.is_zero() {
            bail!("physical_idle_timeout must be greater than 0");
        }

        if self.reverse_rendezvous_timeout.is_zero() {
            bail!("reverse_rendezvous_timeout must be greater than 0");
        }

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.max_frame_size < self.buffer_size {
            bail!("max_frame_size must be at least buffer_size");
        }

        Ok(())
    }
}
