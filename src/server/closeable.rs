//! Listener that can force-close everything it ever accepted

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lock;

struct TrackedConnection {
    peer_addr: SocketAddr,
    kill: watch::Sender<bool>,
}

struct ServerShared {
    name: String,
    connections: Mutex<HashMap<u64, TrackedConnection>>,
    closed: AtomicBool,
    next_connection_id: AtomicU64,
}

/// A connection accepted by a [`CloseableServer`].
pub struct AcceptedConnection {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub stream: TcpStream,
    pub guard: ConnectionGuard,
}

/// Membership of one accepted connection in its server's tracking set.
///
/// Whoever owns the socket must also watch [`ConnectionGuard::killed`] and
/// drop the socket once it fires. Dropping the guard removes the entry.
pub struct ConnectionGuard {
    id: u64,
    shared: Arc<ServerShared>,
    kill_rx: watch::Receiver<bool>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the server has been closed with `close_all`.
    pub async fn killed(&mut self) {
        let _ = self.kill_rx.wait_for(|killed| *killed).await;
    }

    pub fn is_killed(&self) -> bool {
        *self.kill_rx.borrow() || self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = lock(&self.shared.connections).remove(&self.id) {
            debug!(server = %self.shared.name, id = self.id, peer = %conn.peer_addr, "Connection closed");
        }
    }
}

/// TCP listener wrapper that tracks every accepted connection.
pub struct CloseableServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl CloseableServer {
    /// Bind to `addr` and hand every accepted connection to `on_connection`.
    /// The callback runs on the accept loop, so it should spawn rather than block.
    pub async fn bind<F>(addr: SocketAddr, name: impl Into<String>, on_connection: F) -> io::Result<Self>
    where
        F: Fn(AcceptedConnection) + Send + Sync + 'static,
    {
        let name = name.into();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(server = %name, "Listening on {}", local_addr);

        let shared = Arc::new(ServerShared {
            name,
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), on_connection));

        Ok(Self {
            local_addr,
            shared,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Kill every tracked connection, then stop listening. Only the first
    /// call does anything.
    pub async fn close_all(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<_> = lock(&self.shared.connections).drain().collect();
        info!(
            server = %self.shared.name,
            connections = connections.len(),
            "Closing server and all tracked connections"
        );
        for (_, conn) in connections {
            conn.kill.send_replace(true);
        }

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            task.abort();
            // Wait for the listener to be dropped so the port refuses connections.
            let _ = task.await;
        }
    }
}

impl Drop for CloseableServer {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for (_, conn) in lock(&self.shared.connections).drain() {
            conn.kill.send_replace(true);
        }
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
    }
}

async fn accept_loop<F>(listener: TcpListener, shared: Arc<ServerShared>, on_connection: F)
where
    F: Fn(AcceptedConnection) + Send + Sync + 'static,
{
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(server = %shared.name, "Error accepting connection: {}", e);
                // Back off on descriptor exhaustion instead of spinning.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (kill, kill_rx) = watch::channel(false);
        {
            let mut connections = lock(&shared.connections);
            if shared.closed.load(Ordering::SeqCst) {
                debug!(server = %shared.name, peer = %peer_addr, "Rejecting connection accepted during close");
                continue;
            }
            connections.insert(id, TrackedConnection { peer_addr, kill });
        }

        debug!(server = %shared.name, id, peer = %peer_addr, "Accepted connection");
        on_connection(AcceptedConnection {
            id,
            peer_addr,
            stream,
            guard: ConnectionGuard {
                id,
                shared: Arc::clone(&shared),
                kill_rx,
            },
        });
    }
}
