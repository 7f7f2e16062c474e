//! Peer Stream Router
//!
//! One local listener per remote peer. Application connections accepted here
//! become streams on the peer's physical link. The link is either opened by
//! us towards a port the native layer hands out (forward) or is the link the
//! peer already opened to our native listener (reverse).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::native_listener::{LinkLookup, NativeBridgeListener};
use super::rendezvous::RendezvousOutcome;
use super::streams::forward_incoming_streams;
use super::BridgeContext;
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::lock;
use crate::mux::{Multiplexer, MuxOptions};
use crate::relay::{splice, RelaySession};
use crate::server::{loopback, AcceptedConnection, CloseableServer};
use crate::transport::{ConnectionDescriptor, NativeTransport};

/// Event string reported when an eager request gets a reverse answer.
const CANNOT_CONNECT_TO_PEER: &str = "Cannot Connect To Peer";

#[derive(Debug, Clone)]
enum LinkState {
    /// No link yet; the next application connection drives native connect.
    AwaitingFirstConnection,
    Connecting,
    Bound(Multiplexer),
    Closed,
}

struct RouterShared {
    peer_id: String,
    ctx: Arc<BridgeContext>,
    transport: Arc<dyn NativeTransport>,
    native: Option<Arc<NativeBridgeListener>>,
    link: watch::Sender<LinkState>,
    closing: AtomicBool,
    last_active: Mutex<Instant>,
}

/// Local listener that reaches one remote peer
pub struct PeerStreamRouter {
    shared: Arc<RouterShared>,
    server: CloseableServer,
}

impl PeerStreamRouter {
    /// Port the application connects to in order to reach `peer_id`.
    ///
    /// Repeated calls for a live peer return the same port. With
    /// `please_connect` the physical link is established before this returns;
    /// otherwise the first application connection establishes it.
    pub async fn get(manager: &ConnectionManager, peer_id: &str, please_connect: bool) -> Result<u16> {
        let shared = manager.shared();
        let native = {
            let _lifecycle = shared.lifecycle.lock().await;
            shared.check_started()?;
            shared.native.lock().await.clone()
        };

        let (router, evicted) = {
            let mut peers = shared.peers.lock().await;
            shared.check_started()?;
            if let Some(existing) = peers.get(peer_id) {
                return Ok(existing.port());
            }

            let evicted = if peers.len() >= shared.ctx.config.max_peers {
                peers.evict_oldest()
            } else {
                None
            };

            let router = Self::bind(
                peer_id,
                Arc::clone(&shared.ctx),
                Arc::clone(&shared.transport),
                native,
            )
            .await
            .map(Arc::new);
            if let Ok(router) = &router {
                peers.insert(Arc::clone(router));
            }
            (router, evicted)
        };

        if let Some(evicted) = evicted {
            info!(peer = %evicted.peer_id(), "Evicting least recently active peer");
            evicted.close().await;
        }
        let router = router?;

        if please_connect {
            if let Err(e) = router.connect_eagerly().await {
                warn!(peer = %peer_id, "Eager connection failed: {}", e);
                shared.peers.lock().await.remove_router(&router);
                router.close().await;
                return Err(e);
            }
        }

        Ok(router.port())
    }

    /// Close the router for `peer_id` if it still listens on `port`. A port
    /// from an earlier router of the same peer is ignored.
    pub async fn terminate(manager: &ConnectionManager, peer_id: &str, port: u16) -> bool {
        let removed = manager
            .shared()
            .peers
            .lock()
            .await
            .remove_if_port(peer_id, port);

        match removed {
            Some(router) => {
                router.close().await;
                true
            }
            None => {
                debug!(peer = %peer_id, port, "Ignoring terminate for stale port");
                false
            }
        }
    }

    async fn bind(
        peer_id: &str,
        ctx: Arc<BridgeContext>,
        transport: Arc<dyn NativeTransport>,
        native: Option<Arc<NativeBridgeListener>>,
    ) -> Result<Self> {
        let (link, _) = watch::channel(LinkState::AwaitingFirstConnection);
        let shared = Arc::new(RouterShared {
            peer_id: peer_id.to_string(),
            ctx,
            transport,
            native,
            link,
            closing: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        });

        let on_connection = {
            let shared = Arc::clone(&shared);
            move |conn: AcceptedConnection| {
                tokio::spawn(handle_app_connection(Arc::clone(&shared), conn));
            }
        };
        let server = CloseableServer::bind(loopback(0), format!("peer:{}", peer_id), on_connection).await?;
        info!(peer = %peer_id, "Peer listener on port {}", server.port());

        Ok(Self { shared, server })
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Latest of creation, binding a link, or traffic received on it.
    pub fn last_active(&self) -> Instant {
        let touched = *lock(&self.shared.last_active);
        match &*self.shared.link.borrow() {
            LinkState::Bound(mux) => touched.max(mux.last_activity()),
            _ => touched,
        }
    }

    /// Whether a live physical link is bound.
    pub fn is_bound(&self) -> bool {
        matches!(&*self.shared.link.borrow(), LinkState::Bound(mux) if !mux.is_destroyed())
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Number of application connections currently open.
    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    /// Establish the link right away instead of on first use.
    async fn connect_eagerly(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.claim() {
            return Ok(());
        }

        let result = match shared.transport.connect(&shared.peer_id).await {
            Err(e) => Err(BridgeError::Native(e)),
            Ok(ConnectionDescriptor::Forward { listening_port }) => shared.connect_forward(listening_port).await,
            Ok(ConnectionDescriptor::Reverse { .. }) => {
                shared.ctx.events.failed_connection(CANNOT_CONNECT_TO_PEER, &shared.peer_id);
                Err(BridgeError::UnexpectedReverseConnection)
            }
        };

        match result.and_then(|mux| shared.bind_link(mux)) {
            Ok(_) => Ok(()),
            Err(e) => {
                shared.release_claim();
                Err(e)
            }
        }
    }

    /// Stop listening, drop every application connection and the physical
    /// link. Idempotent.
    pub async fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            debug!(peer = %self.shared.peer_id, "Closing peer listener");
        }
        self.shared.shutdown_link();
        self.server.close_all().await;
    }
}

impl Drop for PeerStreamRouter {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.shutdown_link();
    }
}

impl RouterShared {
    fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    /// Move from awaiting to connecting. Only one caller wins.
    fn claim(&self) -> bool {
        self.link.send_if_modified(|state| {
            if matches!(state, LinkState::AwaitingFirstConnection) {
                *state = LinkState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// Give up a claim so the next application connection starts afresh.
    fn release_claim(&self) {
        self.link.send_if_modified(|state| {
            if matches!(state, LinkState::Connecting) {
                *state = LinkState::AwaitingFirstConnection;
                true
            } else {
                false
            }
        });
    }

    fn shutdown_link(&self) {
        if let LinkState::Bound(mux) = self.link.send_replace(LinkState::Closed) {
            mux.destroy();
        }
    }

    fn bind_link(self: &Arc<Self>, mux: Multiplexer) -> Result<Multiplexer> {
        let bound = self.link.send_if_modified(|state| match state {
            LinkState::Closed => false,
            _ => {
                *state = LinkState::Bound(mux.clone());
                true
            }
        });
        if !bound {
            mux.destroy();
            return Err(BridgeError::LinkClosed);
        }

        self.touch();
        info!(peer = %self.peer_id, mux = %mux.label(), "Physical link bound");
        tokio::spawn(Arc::clone(self).watch_link(mux.clone()));
        Ok(mux)
    }

    async fn watch_link(self: Arc<Self>, mux: Multiplexer) {
        mux.closed().await;

        let reset = self.link.send_if_modified(|state| match state {
            LinkState::Bound(bound) if bound.same_session(&mux) => {
                *state = LinkState::AwaitingFirstConnection;
                true
            }
            _ => false,
        });
        if reset && !self.closing.load(Ordering::SeqCst) {
            info!(peer = %self.peer_id, "Physical link closed");
            self.ctx.events.failed_connection(BridgeError::LinkClosed, &self.peer_id);
        }
    }

    /// Wait for a usable link, establishing it if nobody else is.
    ///
    /// Returns `None` when the router closed, or when an establishment this
    /// call waited on failed.
    async fn acquire_link(self: &Arc<Self>) -> Option<Multiplexer> {
        let mut rx = self.link.subscribe();
        let mut saw_connecting = false;

        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                LinkState::Bound(mux) if !mux.is_destroyed() => return Some(mux),
                // Dying link; its watcher resets the state shortly.
                LinkState::Bound(_) => {}
                LinkState::Closed => return None,
                LinkState::Connecting => saw_connecting = true,
                LinkState::AwaitingFirstConnection => {
                    if saw_connecting {
                        return None;
                    }
                    if self.claim() {
                        // Our own attempt counts as one we waited on.
                        saw_connecting = true;
                        tokio::spawn(Arc::clone(self).establish_lazily());
                    }
                    continue;
                }
            }

            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Runs detached so an application socket going away cannot abandon a
    /// half-finished establishment.
    async fn establish_lazily(self: Arc<Self>) {
        let result = match self.transport.connect(&self.peer_id).await {
            Err(e) => Err(BridgeError::Native(e)),
            Ok(ConnectionDescriptor::Forward { listening_port }) => self.connect_forward(listening_port).await,
            Ok(ConnectionDescriptor::Reverse {
                client_port,
                server_port,
            }) => self.find_reverse(client_port, server_port).await,
        };

        if let Err(e) = result.and_then(|mux| self.bind_link(mux)) {
            warn!(peer = %self.peer_id, "Connection to peer failed: {}", e);
            self.release_claim();
            if !self.closing.load(Ordering::SeqCst) {
                self.ctx.events.failed_connection(&e, &self.peer_id);
            }
        }
    }

    async fn connect_forward(&self, listening_port: u16) -> Result<Multiplexer> {
        debug!(peer = %self.peer_id, listening_port, "Forward connection");
        let connect = TcpStream::connect(loopback(listening_port));
        let socket = match timeout(self.ctx.config.connect_timeout, connect).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(BridgeError::CannotConnectToPeer(e)),
            Err(_) => {
                return Err(BridgeError::CannotConnectToPeer(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };

        let (mux, incoming) = Multiplexer::new(
            socket,
            format!("peer:{}", self.peer_id),
            MuxOptions::from_config(&self.ctx.config),
        );
        tokio::spawn(forward_incoming_streams(incoming, Arc::clone(&self.ctx)));
        Ok(mux)
    }

    async fn find_reverse(&self, client_port: u16, server_port: u16) -> Result<Multiplexer> {
        debug!(peer = %self.peer_id, client_port, server_port, "Reverse connection");
        let native = match &self.native {
            Some(native) if native.port() == server_port => native,
            _ => return Err(BridgeError::MismatchedServerPort),
        };

        let mut signal = match native.registry().find_or_register(client_port) {
            LinkLookup::Found(mux) => return Ok(mux),
            LinkLookup::Pending(signal) => signal,
        };

        debug!(peer = %self.peer_id, client_port, "Waiting for inbound link");
        match signal.wait(self.ctx.config.reverse_rendezvous_timeout).await {
            RendezvousOutcome::Matched(mux) => Ok(mux),
            RendezvousOutcome::TimedOut | RendezvousOutcome::Superseded => native
                .registry()
                .settle_pending(&mut signal)
                .ok_or(BridgeError::IncomingConnectionDied),
        }
    }
}

async fn handle_app_connection(shared: Arc<RouterShared>, conn: AcceptedConnection) {
    let AcceptedConnection {
        id,
        peer_addr,
        stream: socket,
        mut guard,
    } = conn;

    let mux = tokio::select! {
        mux = shared.acquire_link() => mux,
        _ = guard.killed() => None,
    };
    let Some(mux) = mux else {
        debug!(peer = %shared.peer_id, conn = id, "No physical link, ending application connection");
        return;
    };

    let stream = match mux.open_stream() {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %shared.peer_id, conn = id, "Could not open stream: {}", e);
            return;
        }
    };

    let session = RelaySession::new(format!("{}#{}", shared.peer_id, id), peer_addr);
    let outcome = splice(
        socket,
        stream,
        &session,
        shared.ctx.config.buffer_size,
        guard.killed(),
    )
    .await;
    session.finish(&outcome);
}
