//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Static native transport table, only consumed by the binary.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Bridge configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Local port of the application's router server; every bridged stream ends there.
    pub router_port: u16,
    /// Maximum number of peer listeners kept alive at once.
    pub max_peers: usize,
    #[serde(with = "humantime_serde")]
    pub physical_idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reverse_rendezvous_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    pub max_frame_size: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

/// One entry of the static native transport table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    pub peer_id: String,
    /// Forward descriptor port. Zero selects the reverse descriptor below.
    #[serde(default)]
    pub listening_port: u16,
    #[serde(default)]
    pub client_port: Option<u16>,
    #[serde(default)]
    pub server_port: Option<u16>,
    #[serde(default)]
    pub please_connect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            router_port: 0,
            max_peers: 20,
            physical_idle_timeout: Duration::from_secs(30),
            reverse_rendezvous_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            buffer_size: 16 * 1024,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            monitoring: MonitoringConfig::default(),
            peers: vec![],
        }
    }
}

impl BridgeConfig {
    /// Convenience constructor used by embedders and tests.
    pub fn with_router_port(router_port: u16) -> Self {
        Self {
            router_port,
            ..Self::default()
        }
    }
}
