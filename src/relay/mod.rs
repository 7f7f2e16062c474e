//! Data Relay Module
//!
//! Pairs local sockets with multiplexer streams.

pub mod pipe;
pub mod session;

pub use pipe::{splice, SpliceOutcome};
pub use session::{ConnectionStats, RelaySession};
