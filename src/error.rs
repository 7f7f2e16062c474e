//! Error types for peermux

use thiserror::Error;

/// Main error type for the bridge layer.
///
/// The lifecycle and race variants render the exact strings the native
/// orchestration layer matches on, so their `Display` output must not change.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Call Start!")]
    NotStarted,

    #[error("We are stopped!")]
    Stopped,

    #[error("Don't call directly!")]
    AlreadyCreated,

    #[error("Mismatched serverPort")]
    MismatchedServerPort,

    #[error("Incoming connection died")]
    IncomingConnectionDied,

    #[error("Unexpected Reverse Connection")]
    UnexpectedReverseConnection,

    #[error("Cannot Connect To Peer")]
    CannotConnectToPeer(#[source] std::io::Error),

    /// Failure reported by the native transport, passed through verbatim.
    #[error("{0}")]
    Native(String),

    #[error("Physical link closed")]
    LinkClosed,

    #[error("Multiplexer destroyed")]
    MuxClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Lifecycle errors are raised before any side effect took place.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            BridgeError::NotStarted | BridgeError::Stopped | BridgeError::AlreadyCreated
        )
    }
}

/// Result type alias for peermux
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_messages() {
        assert_eq!(BridgeError::NotStarted.to_string(), "Call Start!");
        assert_eq!(BridgeError::Stopped.to_string(), "We are stopped!");
        assert_eq!(BridgeError::AlreadyCreated.to_string(), "Don't call directly!");
        assert!(BridgeError::Stopped.is_lifecycle());
        assert!(!BridgeError::MismatchedServerPort.is_lifecycle());
    }

    #[test]
    fn test_native_error_is_verbatim() {
        let err = BridgeError::Native("Peer not available".to_string());
        assert_eq!(err.to_string(), "Peer not available");
    }
}
