//! Connection Manager Implementation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::events::BridgeEvent;
use crate::bridge::{BridgeContext, NativeBridgeListener, PeerStreamRouter};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lock;
use crate::transport::NativeTransport;

/// Lifecycle of a [`ConnectionManager`]. Stopped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Initialized,
    Started,
    Stopped,
}

struct PeerEntry {
    router: Arc<PeerStreamRouter>,
    /// Insertion order; breaks ties between equal activity timestamps.
    seq: u64,
}

/// Live peer routers keyed by peer identifier
#[derive(Default)]
pub(crate) struct PeerTable {
    entries: HashMap<String, PeerEntry>,
    next_seq: u64,
}

impl PeerTable {
    pub(crate) fn get(&self, peer_id: &str) -> Option<&Arc<PeerStreamRouter>> {
        self.entries.get(peer_id).map(|entry| &entry.router)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, router: Arc<PeerStreamRouter>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(router.peer_id().to_string(), PeerEntry { router, seq });
    }

    /// Remove the least recently active router. The caller closes it.
    pub(crate) fn evict_oldest(&mut self) -> Option<Arc<PeerStreamRouter>> {
        let oldest = least_recent(
            self.entries
                .iter()
                .map(|(peer_id, entry)| (peer_id, entry.router.last_active(), entry.seq)),
        )?
        .clone();
        self.entries.remove(&oldest).map(|entry| entry.router)
    }

    /// Remove `router` if it is still the entry for its peer.
    pub(crate) fn remove_router(&mut self, router: &Arc<PeerStreamRouter>) -> bool {
        let current = self
            .entries
            .get(router.peer_id())
            .is_some_and(|entry| Arc::ptr_eq(&entry.router, router));
        if current {
            self.entries.remove(router.peer_id());
        }
        current
    }

    pub(crate) fn remove_if_port(&mut self, peer_id: &str, port: u16) -> Option<Arc<PeerStreamRouter>> {
        if self.get(peer_id)?.port() != port {
            return None;
        }
        self.entries.remove(peer_id).map(|entry| entry.router)
    }

    fn drain(&mut self) -> Vec<Arc<PeerStreamRouter>> {
        self.entries.drain().map(|(_, entry)| entry.router).collect()
    }

    fn routers(&self) -> impl Iterator<Item = &Arc<PeerStreamRouter>> {
        self.entries.values().map(|entry| &entry.router)
    }
}

/// Key with the oldest activity; equal times go to the earliest insertion.
fn least_recent<K>(candidates: impl Iterator<Item = (K, Instant, u64)>) -> Option<K> {
    candidates
        .min_by_key(|&(_, last_active, seq)| (last_active, seq))
        .map(|(key, _, _)| key)
}

pub(crate) struct ManagerShared {
    pub(crate) ctx: Arc<BridgeContext>,
    pub(crate) transport: Arc<dyn NativeTransport>,
    state: Mutex<ManagerState>,
    /// Serialises start and stop, and orders them against peer creation.
    pub(crate) lifecycle: AsyncMutex<()>,
    pub(crate) native: AsyncMutex<Option<Arc<NativeBridgeListener>>>,
    pub(crate) peers: AsyncMutex<PeerTable>,
}

impl ManagerShared {
    pub(crate) fn state(&self) -> ManagerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ManagerState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn check_started(&self) -> Result<()> {
        match self.state() {
            ManagerState::Initialized => Err(BridgeError::NotStarted),
            ManagerState::Started => Ok(()),
            ManagerState::Stopped => Err(BridgeError::Stopped),
        }
    }
}

/// Per-peer entry of [`ManagerStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer_id: String,
    pub port: u16,
    pub bound: bool,
    pub connections: usize,
    /// Milliseconds since the peer's link last saw traffic.
    pub idle_ms: u64,
}

/// Point-in-time snapshot of a manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub state: ManagerState,
    pub native_port: Option<u16>,
    pub incoming_connections: usize,
    pub peers: Vec<PeerStats>,
}

/// Owns the native listener, the bounded set of peer routers and their
/// shared lifecycle. Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    /// Create a manager in the `Initialized` state
    pub fn new(mut config: BridgeConfig, transport: Arc<dyn NativeTransport>) -> Self {
        if config.max_peers == 0 {
            warn!("max_peers is 0, keeping at most one peer listener");
            config.max_peers = 1;
        }

        Self {
            shared: Arc::new(ManagerShared {
                ctx: Arc::new(BridgeContext::new(config)),
                transport,
                state: Mutex::new(ManagerState::Initialized),
                lifecycle: AsyncMutex::new(()),
                native: AsyncMutex::new(None),
                peers: AsyncMutex::new(PeerTable::default()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state()
    }

    pub fn router_port(&self) -> u16 {
        self.shared.ctx.router_port()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.ctx.config
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.ctx.events.subscribe()
    }

    /// Start the manager and create the native listener. Returns the native
    /// listener's port, which the native layer routes inbound links to.
    /// Calling it again while started returns the same port.
    pub async fn start(&self) -> Result<u16> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        match self.state() {
            ManagerState::Stopped => return Err(BridgeError::Stopped),
            ManagerState::Started => {
                if let Some(native) = self.shared.native.lock().await.as_ref() {
                    return Ok(native.port());
                }
            }
            ManagerState::Initialized => self.shared.set_state(ManagerState::Started),
        }

        match NativeBridgeListener::create(self).await {
            Ok(port) => {
                info!(router_port = self.router_port(), "Connection manager started, native port {}", port);
                Ok(port)
            }
            Err(e) => {
                warn!("Failed to create native listener: {}", e);
                self.shared.set_state(ManagerState::Initialized);
                Err(e)
            }
        }
    }

    /// Close the native listener and every peer router. Stopping twice is a
    /// no-op; stopping a manager that never started is an error.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        match self.state() {
            ManagerState::Initialized => return Err(BridgeError::NotStarted),
            ManagerState::Stopped => return Ok(()),
            ManagerState::Started => self.shared.set_state(ManagerState::Stopped),
        }

        info!("Stopping connection manager");
        // Routers go first so links they share with the native listener die
        // while the routers are already closing.
        let routers = self.shared.peers.lock().await.drain();
        debug!(peers = routers.len(), "Closing peer listeners");
        for router in routers {
            router.close().await;
        }

        let native = self.shared.native.lock().await.take();
        if let Some(native) = native {
            native.close().await;
        }

        info!("Connection manager stopped");
        Ok(())
    }

    /// Port the application uses to reach `peer_id`.
    pub async fn create_peer_listener(&self, peer_id: &str, please_connect: bool) -> Result<u16> {
        PeerStreamRouter::get(self, peer_id, please_connect).await
    }

    /// Close the peer router for `peer_id` if it still listens on `port`.
    pub async fn terminate_outgoing_connection(&self, peer_id: &str, port: u16) -> bool {
        PeerStreamRouter::terminate(self, peer_id, port).await
    }

    /// Destroy the inbound physical link with this connection id.
    pub async fn terminate_incoming_connection(&self, connection_id: u64) -> bool {
        match self.shared.native.lock().await.as_ref() {
            Some(native) => native.terminate_incoming_connection(connection_id),
            None => false,
        }
    }

    pub async fn native_listener_port(&self) -> Option<u16> {
        self.shared.native.lock().await.as_ref().map(|native| native.port())
    }

    pub async fn peer_port(&self, peer_id: &str) -> Option<u16> {
        self.shared.peers.lock().await.get(peer_id).map(|router| router.port())
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    pub async fn stats(&self) -> ManagerStats {
        let (native_port, incoming_connections) = match self.shared.native.lock().await.as_ref() {
            Some(native) => (Some(native.port()), native.connection_count()),
            None => (None, 0),
        };

        let now = Instant::now();
        let mut peers: Vec<PeerStats> = self
            .shared
            .peers
            .lock()
            .await
            .routers()
            .map(|router| PeerStats {
                peer_id: router.peer_id().to_string(),
                port: router.port(),
                bound: router.is_bound(),
                connections: router.connection_count(),
                idle_ms: now.saturating_duration_since(router.last_active()).as_millis() as u64,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        ManagerStats {
            state: self.state(),
            native_port,
            incoming_connections,
            peers,
        }
    }
}
