//! Listening Socket Module
//!
//! Listeners whose accepted connections can be torn down together.

pub mod closeable;

pub use closeable::{AcceptedConnection, CloseableServer, ConnectionGuard};

use std::net::{Ipv4Addr, SocketAddr};

/// Ephemeral loopback address; every bridge listener binds here.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
