//! Table-driven native transport

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ConnectionDescriptor, NativeTransport};
use crate::config::PeerConfig;
use crate::lock;

type Route = std::result::Result<ConnectionDescriptor, String>;

/// Answers connect requests from a fixed table of peer id to descriptor.
#[derive(Debug, Default)]
pub struct StaticTransport {
    routes: Mutex<HashMap<String, Route>>,
    connect_counts: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer, to model a slow native layer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build the table from `[[peers]]` config entries.
    pub fn from_peers(peers: &[PeerConfig]) -> Self {
        let transport = Self::new();
        for peer in peers {
            let descriptor = if peer.listening_port != 0 {
                ConnectionDescriptor::Forward {
                    listening_port: peer.listening_port,
                }
            } else {
                ConnectionDescriptor::Reverse {
                    client_port: peer.client_port.unwrap_or_default(),
                    server_port: peer.server_port.unwrap_or_default(),
                }
            };
            transport.set_route(&peer.peer_id, descriptor);
        }
        transport
    }

    pub fn set_route(&self, peer_id: &str, descriptor: ConnectionDescriptor) {
        lock(&self.routes).insert(peer_id.to_string(), Ok(descriptor));
    }

    /// Make connects to `peer_id` fail with `error`.
    pub fn set_error(&self, peer_id: &str, error: impl Into<String>) {
        lock(&self.routes).insert(peer_id.to_string(), Err(error.into()));
    }

    pub fn remove_route(&self, peer_id: &str) {
        lock(&self.routes).remove(peer_id);
    }

    /// Number of connect calls made for `peer_id` so far.
    pub fn connect_count(&self, peer_id: &str) -> usize {
        lock(&self.connect_counts).get(peer_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NativeTransport for StaticTransport {
    async fn connect(&self, peer_id: &str) -> std::result::Result<ConnectionDescriptor, String> {
        *lock(&self.connect_counts)
            .entry(peer_id.to_string())
            .or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let route = lock(&self.routes)
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| Err(format!("Unknown peer {}", peer_id)));
        debug!(peer = %peer_id, ?route, "Native connect");
        route
    }
}
