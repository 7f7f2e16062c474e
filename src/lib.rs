//! peermux Library
//!
//! Lets a local application reach peers behind a native peer-to-peer
//! transport as ordinary local TCP services. Many logical streams share one
//! physical link per peer; links may be opened by either side.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod mux;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use bridge::{NativeBridgeListener, PeerStreamRouter};
pub use config::Config;
pub use connection::{BridgeEvent, ConnectionManager, IncomingConnectionState, ManagerState};
pub use error::{BridgeError, Result};
pub use server::CloseableServer;
pub use shutdown::ShutdownCoordinator;
pub use transport::{ConnectionDescriptor, NativeTransport, StaticTransport};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
