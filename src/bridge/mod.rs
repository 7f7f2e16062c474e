//! Bridge Module
//!
//! The inbound native listener, the per-peer routers and the plumbing they
//! share.

pub mod native_listener;
pub mod peer_router;
pub mod rendezvous;
pub mod streams;

pub use native_listener::NativeBridgeListener;
pub use peer_router::PeerStreamRouter;
pub use rendezvous::{PendingSignal, Rendezvous, RendezvousOutcome};

use crate::config::BridgeConfig;
use crate::connection::EventBus;

/// Settings and event sink shared by every listener of one manager
#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub events: EventBus,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            events: EventBus::default(),
        }
    }

    pub fn router_port(&self) -> u16 {
        self.config.router_port
    }
}
