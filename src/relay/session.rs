//! Relay Session
//!
//! Byte accounting for one local socket spliced onto one multiplexer stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::SpliceOutcome;

/// One local socket paired with one multiplexer stream
#[derive(Debug)]
pub struct RelaySession {
    pub label: String,
    pub socket_addr: SocketAddr,
    opened_at: Instant,
    to_stream: AtomicU64,
    to_socket: AtomicU64,
}

/// Snapshot of a pair's traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub label: String,
    pub socket_addr: SocketAddr,
    pub duration_ms: u64,
    /// Bytes read from the socket and written to the stream.
    pub to_stream: u64,
    /// Bytes read from the stream and written to the socket.
    pub to_socket: u64,
}

impl RelaySession {
    pub fn new(label: impl Into<String>, socket_addr: SocketAddr) -> Self {
        let label = label.into();
        debug!(pair = %label, socket = %socket_addr, "Pairing socket with stream");

        Self {
            label,
            socket_addr,
            opened_at: Instant::now(),
            to_stream: AtomicU64::new(0),
            to_socket: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_to_stream(&self, bytes: usize) {
        self.to_stream.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_to_socket(&self, bytes: usize) {
        self.to_socket.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            label: self.label.clone(),
            socket_addr: self.socket_addr,
            duration_ms: self.age().as_millis() as u64,
            to_stream: self.to_stream.load(Ordering::Relaxed),
            to_socket: self.to_socket.load(Ordering::Relaxed),
        }
    }

    /// Log the pair's totals together with how it ended.
    pub fn finish(&self, outcome: &SpliceOutcome) {
        let stats = self.stats();
        info!(
            pair = %stats.label,
            socket = %stats.socket_addr,
            duration_ms = stats.duration_ms,
            to_stream = stats.to_stream,
            to_socket = stats.to_socket,
            ?outcome,
            "Relay finished"
        );
    }
}
