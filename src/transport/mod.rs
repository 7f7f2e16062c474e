//! Native Transport Module
//!
//! The peer-to-peer radio link lives outside this crate. All the bridge needs
//! from it is a connect primitive; inbound links surface as plain TCP accepts
//! on the native listener port.

pub mod static_table;

pub use static_table::StaticTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Answer of the native layer to a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// The native layer opened a local port that reaches the peer.
    Forward { listening_port: u16 },
    /// The peer already connected to us; its link arrived on the native
    /// listener (`server_port`) from `client_port`.
    Reverse { client_port: u16, server_port: u16 },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    listening_port: u16,
    #[serde(default)]
    client_port: Option<u16>,
    #[serde(default)]
    server_port: Option<u16>,
}

impl ConnectionDescriptor {
    /// Parse the native layer's JSON answer. A `listeningPort` of zero
    /// selects the reverse form, which then needs both other ports.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawDescriptor = serde_json::from_str(json)
            .map_err(|e| BridgeError::Protocol(format!("invalid connection descriptor: {}", e)))?;

        if raw.listening_port != 0 {
            return Ok(Self::Forward {
                listening_port: raw.listening_port,
            });
        }

        match (raw.client_port, raw.server_port) {
            (Some(client_port), Some(server_port)) => Ok(Self::Reverse {
                client_port,
                server_port,
            }),
            _ => Err(BridgeError::Protocol(
                "reverse connection descriptor without clientPort/serverPort".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> String {
        let raw = match *self {
            Self::Forward { listening_port } => RawDescriptor {
                listening_port,
                client_port: None,
                server_port: None,
            },
            Self::Reverse {
                client_port,
                server_port,
            } => RawDescriptor {
                listening_port: 0,
                client_port: Some(client_port),
                server_port: Some(server_port),
            },
        };
        // Only plain integers; serialisation cannot fail.
        serde_json::to_string(&raw).unwrap_or_default()
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, Self::Reverse { .. })
    }
}

/// Connect primitive of the native peer-to-peer layer
#[async_trait]
pub trait NativeTransport: Send + Sync {
    /// Ask the native layer for a route to `peer_id`. Errors are the native
    /// layer's own messages and are surfaced unchanged.
    async fn connect(&self, peer_id: &str) -> std::result::Result<ConnectionDescriptor, String>;
}
