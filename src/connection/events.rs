//! Events published by the bridge layer

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// State of an inbound physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingConnectionState {
    Connected,
    Disconnected,
}

/// Notifications for the orchestration code above this layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    IncomingConnectionState {
        connection_id: u64,
        state: IncomingConnectionState,
    },
    /// A peer could not be reached, or its link went away after `get()` resolved.
    #[serde(rename_all = "camelCase")]
    FailedConnection {
        error: String,
        peer_identifier: String,
    },
    #[serde(rename_all = "camelCase")]
    RouterPortConnectionFailed {
        error: String,
        router_port: u16,
    },
}

/// Fan-out of [`BridgeEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: BridgeEvent) {
        trace!(?event, "Emitting bridge event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn failed_connection(&self, error: impl ToString, peer_identifier: &str) {
        self.emit(BridgeEvent::FailedConnection {
            error: error.to_string(),
            peer_identifier: peer_identifier.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
