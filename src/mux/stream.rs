//! Logical streams inside a multiplexer session

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::codec::Frame;
use super::multiplexer::MuxInner;

/// Identifies a stream within one session. Ids are allocated per side, so the
/// opener is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    pub id: u64,
    /// True when this side opened the stream.
    pub local: bool,
}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    End,
}

struct StreamShared {
    key: StreamKey,
    mux: Arc<MuxInner>,
    local_finished: AtomicBool,
    remote_finished: AtomicBool,
    reset: AtomicBool,
}

impl StreamShared {
    async fn write(&self, data: Bytes) -> io::Result<()> {
        if self.reset.load(Ordering::SeqCst) || self.local_finished.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after stream end",
            ));
        }
        if self.mux.is_destroyed() || !self.mux.has_stream(&self.key) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.mux
            .send_data(Frame::data(self.key.id, self.key.local, data))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e))
    }

    fn finish(&self) {
        if self.reset.load(Ordering::SeqCst) || self.local_finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .mux
            .send_frame(Frame::close(self.key.id, self.key.local));
    }

    fn reset(&self) {
        if self.reset.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mux.release(self.key, false);
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        let clean = self.local_finished.load(Ordering::SeqCst)
            && self.remote_finished.load(Ordering::SeqCst);
        self.mux.release(self.key, clean);
    }
}

async fn read_event(
    shared: &StreamShared,
    inbound: &mut mpsc::Receiver<StreamEvent>,
) -> io::Result<Option<Bytes>> {
    if shared.remote_finished.load(Ordering::SeqCst) {
        return Ok(None);
    }
    match inbound.recv().await {
        Some(StreamEvent::Data(data)) => Ok(Some(data)),
        Some(StreamEvent::End) => {
            shared.remote_finished.store(true, Ordering::SeqCst);
            Ok(None)
        }
        None => Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "stream reset",
        )),
    }
}

/// One logical duplex channel of a [`Multiplexer`](super::Multiplexer).
///
/// Dropping a stream that was not finished in both directions resets it on
/// the remote side.
pub struct MuxStream {
    shared: Arc<StreamShared>,
    inbound: mpsc::Receiver<StreamEvent>,
}

impl MuxStream {
    pub(crate) fn new(
        key: StreamKey,
        mux: Arc<MuxInner>,
        inbound: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                key,
                mux,
                local_finished: AtomicBool::new(false),
                remote_finished: AtomicBool::new(false),
                reset: AtomicBool::new(false),
            }),
            inbound,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.key.id
    }

    /// Whether this side opened the stream.
    pub fn is_local(&self) -> bool {
        self.shared.key.local
    }

    /// Label of the owning multiplexer, for logging.
    pub fn mux_label(&self) -> &str {
        self.shared.mux.label()
    }

    /// Next chunk of data. `Ok(None)` means the remote side finished writing;
    /// an error means the stream or its multiplexer was reset.
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        read_event(&self.shared, &mut self.inbound).await
    }

    /// Send a chunk. Waits while the multiplexer's send window is full.
    pub async fn write(&self, data: Bytes) -> io::Result<()> {
        self.shared.write(data).await
    }

    /// Half-close: no more data will be written from this side.
    pub fn finish(&self) {
        self.shared.finish()
    }

    /// Abort the stream in both directions.
    pub fn reset(&self) {
        self.shared.reset()
    }

    pub fn split(self) -> (MuxStreamReader, MuxStreamWriter) {
        let reader = MuxStreamReader {
            shared: Arc::clone(&self.shared),
            inbound: self.inbound,
        };
        let writer = MuxStreamWriter {
            shared: self.shared,
        };
        (reader, writer)
    }
}

/// Read half of a [`MuxStream`]
pub struct MuxStreamReader {
    shared: Arc<StreamShared>,
    inbound: mpsc::Receiver<StreamEvent>,
}

impl MuxStreamReader {
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        read_event(&self.shared, &mut self.inbound).await
    }
}

/// Write half of a [`MuxStream`]
pub struct MuxStreamWriter {
    shared: Arc<StreamShared>,
}

impl MuxStreamWriter {
    pub async fn write(&self, data: Bytes) -> io::Result<()> {
        self.shared.write(data).await
    }

    pub fn finish(&self) {
        self.shared.finish()
    }

    pub fn reset(&self) {
        self.shared.reset()
    }
}
