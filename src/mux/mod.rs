//! Stream Multiplexing Module
//!
//! Carries many ordered byte streams over one physical connection.

pub mod codec;
pub mod multiplexer;
pub mod stream;

pub use codec::{Frame, FrameKind, MuxCodec};
pub use multiplexer::{IncomingStreams, MuxOptions, Multiplexer};
pub use stream::{MuxStream, MuxStreamReader, MuxStreamWriter};
