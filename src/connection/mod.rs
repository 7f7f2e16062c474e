//! Connection Management Module
//!
//! Lifecycle of the native listener and the peer routers, and the events
//! they publish.

pub mod events;
pub mod manager;

pub use events::{BridgeEvent, EventBus, IncomingConnectionState};
pub use manager::{ConnectionManager, ManagerState, ManagerStats, PeerStats};
