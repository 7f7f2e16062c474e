//! Bidirectional splice of a local socket and a multiplexer stream

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::RelaySession;
use crate::mux::MuxStream;

/// How a splice ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceOutcome {
    /// Both directions finished cleanly.
    Completed,
    /// One side failed or was reset; the other side was torn down with it.
    Reset(io::ErrorKind),
    /// The owner asked for teardown.
    Cancelled,
}

/// Copy bytes both ways between `socket` and `stream` until both directions
/// finish, either side fails, or `cancel` resolves.
///
/// Two copy loops run side by side. A clean end of one direction is
/// forwarded as a half-close and the other direction keeps flowing until it
/// ends too, so a stream that finishes does not destroy its socket outright.
/// A failure in either direction tears down both. Each loop waits for its
/// destination to accept a chunk before reading the next one. The socket and
/// the stream are owned here, so teardown happens exactly once when this
/// returns.
pub async fn splice<F>(
    socket: TcpStream,
    stream: MuxStream,
    session: &RelaySession,
    buffer_size: usize,
    cancel: F,
) -> SpliceOutcome
where
    F: Future<Output = ()>,
{
    let (mut socket_rx, mut socket_tx) = socket.into_split();
    let (mut stream_rx, stream_tx) = stream.split();

    let outcome = {
        let upstream = async {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let n = socket_rx.read(&mut buf).await?;
                if n == 0 {
                    stream_tx.finish();
                    return Ok::<(), io::Error>(());
                }
                stream_tx.write(Bytes::copy_from_slice(&buf[..n])).await?;
                session.record_to_stream(n);
            }
        };

        let downstream = async {
            while let Some(data) = stream_rx.read().await? {
                socket_tx.write_all(&data).await?;
                session.record_to_socket(data.len());
            }
            socket_tx.shutdown().await?;
            Ok::<(), io::Error>(())
        };

        tokio::select! {
            result = async { tokio::try_join!(upstream, downstream) } => match result {
                Ok(_) => SpliceOutcome::Completed,
                Err(e) => {
                    debug!(pair = %session.label, "Relay torn down: {}", e);
                    SpliceOutcome::Reset(e.kind())
                }
            },
            _ = cancel => SpliceOutcome::Cancelled,
        }
    };

    if outcome != SpliceOutcome::Completed {
        stream_tx.reset();
    }
    outcome
}
