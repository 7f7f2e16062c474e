//! Native Bridge Listener
//!
//! Single inbound gateway for physical links that the native transport
//! surfaces as TCP connections. Each link is wrapped in a multiplexer and
//! every stream the remote peer opens on it is forwarded to the router port.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::rendezvous::{PendingSignal, Rendezvous};
use super::streams::forward_incoming_streams;
use super::BridgeContext;
use crate::connection::{BridgeEvent, ConnectionManager, IncomingConnectionState, ManagerState};
use crate::error::{BridgeError, Result};
use crate::lock;
use crate::mux::{Multiplexer, MuxOptions};
use crate::server::{loopback, AcceptedConnection, CloseableServer};

/// One physical link accepted from the native transport
#[derive(Debug, Clone)]
pub struct InboundLink {
    pub id: u64,
    /// Remote port of the physical socket; reverse descriptors name it as `clientPort`.
    pub remote_port: u16,
    pub mux: Multiplexer,
}

/// Result of looking up an inbound link by remote port
pub(crate) enum LinkLookup {
    Found(Multiplexer),
    Pending(PendingSignal<u16, Multiplexer>),
}

#[derive(Default)]
struct RegistryInner {
    links: HashMap<u64, InboundLink>,
    pending: Rendezvous<u16, Multiplexer>,
}

/// Live inbound links plus routers waiting for a link that has not arrived yet
#[derive(Default)]
pub(crate) struct LinkRegistry {
    inner: Mutex<RegistryInner>,
}

impl LinkRegistry {
    fn insert(&self, link: InboundLink) {
        let mut inner = lock(&self.inner);
        if inner
            .pending
            .signal(&link.remote_port, link.mux.clone())
            .is_none()
        {
            debug!(link = link.id, remote_port = link.remote_port, "Link resolved a pending reverse connection");
        }
        inner.links.insert(link.id, link);
    }

    fn remove(&self, id: u64) -> Option<InboundLink> {
        lock(&self.inner).links.remove(&id)
    }

    fn drain(&self) -> Vec<InboundLink> {
        lock(&self.inner).links.drain().map(|(_, link)| link).collect()
    }

    fn len(&self) -> usize {
        lock(&self.inner).links.len()
    }

    fn find(inner: &RegistryInner, remote_port: u16) -> Option<Multiplexer> {
        inner
            .links
            .values()
            .find(|link| link.remote_port == remote_port && !link.mux.is_destroyed())
            .map(|link| link.mux.clone())
    }

    pub(crate) fn find_by_remote_port(&self, remote_port: u16) -> Option<Multiplexer> {
        Self::find(&lock(&self.inner), remote_port)
    }

    /// Look the link up, or register interest in it, under one lock so a link
    /// accepted in between cannot be missed.
    pub(crate) fn find_or_register(&self, remote_port: u16) -> LinkLookup {
        let mut inner = lock(&self.inner);
        match Self::find(&inner, remote_port) {
            Some(mux) => LinkLookup::Found(mux),
            None => LinkLookup::Pending(inner.pending.register(remote_port)),
        }
    }

    /// Withdraw a registration whose wait ended without a match. A link that
    /// slipped in right at the deadline still counts.
    pub(crate) fn settle_pending(&self, signal: &mut PendingSignal<u16, Multiplexer>) -> Option<Multiplexer> {
        let mut inner = lock(&self.inner);
        inner.pending.cancel(signal);
        signal
            .take_late()
            .or_else(|| Self::find(&inner, *signal.key()))
    }
}

/// Listener for physical links arriving from the native transport
pub struct NativeBridgeListener {
    server: CloseableServer,
    registry: Arc<LinkRegistry>,
    ctx: Arc<BridgeContext>,
}

impl NativeBridgeListener {
    /// Bind the manager's native listener and return its port.
    ///
    /// There is exactly one per manager, and only a started manager may
    /// create it.
    pub async fn create(manager: &ConnectionManager) -> Result<u16> {
        let shared = manager.shared();
        if shared.state() != ManagerState::Started {
            return Err(BridgeError::NotStarted);
        }

        let mut slot = shared.native.lock().await;
        if slot.is_some() {
            return Err(BridgeError::AlreadyCreated);
        }

        let listener = Self::bind(Arc::clone(&shared.ctx)).await?;
        let port = listener.port();
        *slot = Some(Arc::new(listener));
        Ok(port)
    }

    pub(crate) async fn bind(ctx: Arc<BridgeContext>) -> Result<Self> {
        let registry = Arc::new(LinkRegistry::default());

        let on_connection = {
            let ctx = Arc::clone(&ctx);
            let registry = Arc::clone(&registry);
            move |conn: AcceptedConnection| {
                tokio::spawn(serve_physical_link(
                    conn,
                    Arc::clone(&ctx),
                    Arc::clone(&registry),
                ));
            }
        };

        let server = CloseableServer::bind(loopback(0), "native-bridge", on_connection).await?;
        info!("Native bridge listener on port {}", server.port());

        Ok(Self {
            server,
            registry,
            ctx,
        })
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Number of live inbound physical links.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn find_by_remote_port(&self, remote_port: u16) -> Option<Multiplexer> {
        self.registry.find_by_remote_port(remote_port)
    }

    pub(crate) fn registry(&self) -> &LinkRegistry {
        &self.registry
    }

    /// Destroy the inbound link with this connection id. Unknown ids are
    /// ignored.
    pub fn terminate_incoming_connection(&self, connection_id: u64) -> bool {
        match self.registry.remove(connection_id) {
            Some(link) => {
                debug!(link = connection_id, "Terminating incoming connection");
                link.mux.destroy();
                true
            }
            None => false,
        }
    }

    /// Stop listening and destroy every inbound link. Idempotent.
    pub async fn close(&self) {
        for link in self.registry.drain() {
            link.mux.destroy();
        }
        self.server.close_all().await;
        debug!(router_port = self.ctx.router_port(), "Native bridge listener closed");
    }
}

async fn serve_physical_link(conn: AcceptedConnection, ctx: Arc<BridgeContext>, registry: Arc<LinkRegistry>) {
    let AcceptedConnection {
        id,
        peer_addr,
        stream,
        mut guard,
    } = conn;

    info!(link = id, peer = %peer_addr, "Incoming physical link");
    ctx.events.emit(BridgeEvent::IncomingConnectionState {
        connection_id: id,
        state: IncomingConnectionState::Connected,
    });

    let (mux, incoming) = Multiplexer::new(
        stream,
        format!("native#{}", id),
        MuxOptions::from_config(&ctx.config),
    );
    let forwarder = tokio::spawn(forward_incoming_streams(incoming, Arc::clone(&ctx)));
    registry.insert(InboundLink {
        id,
        remote_port: peer_addr.port(),
        mux: mux.clone(),
    });

    tokio::select! {
        _ = mux.closed() => {}
        _ = guard.killed() => {}
    }

    registry.remove(id);
    mux.destroy();
    forwarder.abort();

    info!(link = id, peer = %peer_addr, "Physical link disconnected");
    ctx.events.emit(BridgeEvent::IncomingConnectionState {
        connection_id: id,
        state: IncomingConnectionState::Disconnected,
    });
}
