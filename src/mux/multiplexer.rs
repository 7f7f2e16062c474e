//! Multiplexer session over one physical connection

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::codec::{Frame, FrameKind, MuxCodec};
use super::stream::{MuxStream, StreamEvent, StreamKey};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lock;

/// Tunables for a multiplexer session
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Destroy the session after this long without any frame in either direction.
    pub idle_timeout: Option<Duration>,
    pub max_frame_size: usize,
    /// Payload bytes queued for the physical socket before writers wait.
    pub send_window: usize,
    /// Frames buffered per stream before the reader stops pulling from the
    /// physical socket.
    pub stream_window: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            max_frame_size: 1024 * 1024,
            send_window: 256 * 1024,
            stream_window: 32,
        }
    }
}

impl MuxOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            idle_timeout: Some(config.physical_idle_timeout),
            max_frame_size: config.max_frame_size,
            ..Self::default()
        }
    }
}

/// A frame on its way to the writer task. Data frames hold send credit
/// until they reach the socket.
struct Outbound {
    frame: Frame,
    _credit: Option<OwnedSemaphorePermit>,
}

pub(crate) struct MuxInner {
    label: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    send_credit: Arc<Semaphore>,
    send_window: u32,
    stream_window: usize,
    streams: Mutex<HashMap<StreamKey, mpsc::Sender<StreamEvent>>>,
    incoming: Mutex<Option<mpsc::UnboundedSender<MuxStream>>>,
    next_stream_id: AtomicU64,
    destroyed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    /// Last frame read from the physical socket.
    last_activity: Mutex<Instant>,
    /// Last frame read or written.
    last_io: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MuxInner {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_stream(&self, key: &StreamKey) -> bool {
        lock(&self.streams).contains_key(key)
    }

    /// Queue a control frame. Control frames never wait for credit.
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue(frame, None)
    }

    /// Queue a data frame once enough send credit is free. Waits while the
    /// physical socket is behind.
    pub(crate) async fn send_data(&self, frame: Frame) -> Result<()> {
        let wanted = u32::try_from(frame.payload.len())
            .unwrap_or(u32::MAX)
            .clamp(1, self.send_window);
        let credit = Arc::clone(&self.send_credit)
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| BridgeError::MuxClosed)?;
        self.enqueue(frame, Some(credit))
    }

    fn enqueue(&self, frame: Frame, credit: Option<OwnedSemaphorePermit>) -> Result<()> {
        if self.is_destroyed() {
            return Err(BridgeError::MuxClosed);
        }
        self.outbound
            .send(Outbound {
                frame,
                _credit: credit,
            })
            .map_err(|_| BridgeError::MuxClosed)
    }

    fn new_stream_channel(&self) -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
        mpsc::channel(self.stream_window)
    }

    /// Drops the table entry for `key`. An unclean release of a live entry
    /// tells the remote side to reset its half.
    pub(crate) fn release(&self, key: StreamKey, clean: bool) {
        let removed = lock(&self.streams).remove(&key).is_some();
        if removed && !clean && !self.is_destroyed() {
            trace!(mux = %self.label, stream = key.id, "Resetting stream");
            let _ = self.send_frame(Frame::reset(key.id, key.local));
        }
    }

    fn touch_io(&self) {
        *lock(&self.last_io) = Instant::now();
    }

    fn touch_inbound(&self) {
        let now = Instant::now();
        *lock(&self.last_activity) = now;
        *lock(&self.last_io) = now;
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the senders resets every stream still held by a pipe.
        let streams: Vec<_> = lock(&self.streams).drain().collect();
        lock(&self.incoming).take();
        debug!(
            mux = %self.label,
            streams = streams.len(),
            "Destroying multiplexer"
        );
        drop(streams);
        self.send_credit.close();

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.closed_tx.send_replace(true);
    }

    /// Route one inbound frame. Waits while the target stream's buffer is
    /// full, which stops reading from the physical socket.
    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        // The sender's initiator bit tells us who opened the stream.
        let key = StreamKey {
            id: frame.stream_id,
            local: !frame.from_initiator,
        };

        match frame.kind {
            FrameKind::Open => self.accept_remote_stream(key),
            FrameKind::Data => {
                let tx = lock(&self.streams).get(&key).cloned();
                match tx {
                    Some(tx) => {
                        trace!(mux = %self.label, stream = key.id, bytes = frame.payload.len(), "Data");
                        // A closed channel means the stream was reset meanwhile.
                        let _ = tx.send(StreamEvent::Data(frame.payload)).await;
                    }
                    None => trace!(mux = %self.label, stream = key.id, "Data for unknown stream dropped"),
                }
            }
            FrameKind::Close => {
                let tx = lock(&self.streams).get(&key).cloned();
                if let Some(tx) = tx {
                    let _ = tx.send(StreamEvent::End).await;
                }
            }
            FrameKind::Reset => {
                if lock(&self.streams).remove(&key).is_some() {
                    trace!(mux = %self.label, stream = key.id, "Remote reset stream");
                }
            }
        }
    }

    fn accept_remote_stream(self: &Arc<Self>, key: StreamKey) {
        let (tx, rx) = self.new_stream_channel();
        {
            let mut streams = lock(&self.streams);
            if streams.contains_key(&key) {
                warn!(mux = %self.label, stream = key.id, "Duplicate stream open ignored");
                return;
            }
            streams.insert(key, tx);
        }

        let stream = MuxStream::new(key, Arc::clone(self), rx);
        let delivered = match lock(&self.incoming).as_ref() {
            Some(incoming) => incoming.send(stream).is_ok(),
            None => false,
        };
        if delivered {
            debug!(mux = %self.label, stream = key.id, "Remote opened stream");
        } else {
            // Nobody accepts remote streams here; dropping the stream resets it.
            debug!(mux = %self.label, stream = key.id, "Rejected remote stream");
        }
    }
}

/// Carries many independent byte streams over one physical duplex connection.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

/// Streams opened by the remote side, in arrival order.
pub struct IncomingStreams {
    rx: mpsc::UnboundedReceiver<MuxStream>,
}

impl IncomingStreams {
    /// Next remotely opened stream, or `None` once the multiplexer is destroyed.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await
    }
}

impl Multiplexer {
    /// Wrap `socket` in a multiplexer session. The socket is owned by the
    /// session from now on and closes when the session is destroyed.
    pub fn new(
        socket: TcpStream,
        label: impl Into<String>,
        options: MuxOptions,
    ) -> (Multiplexer, IncomingStreams) {
        let label = label.into();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let now = Instant::now();

        let inner = Arc::new(MuxInner {
            label,
            outbound: outbound_tx,
            send_credit: Arc::new(Semaphore::new(options.send_window.max(1))),
            send_window: u32::try_from(options.send_window.max(1)).unwrap_or(u32::MAX),
            stream_window: options.stream_window.max(1),
            streams: Mutex::new(HashMap::new()),
            incoming: Mutex::new(Some(incoming_tx)),
            next_stream_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            closed_tx,
            last_activity: Mutex::new(now),
            last_io: Mutex::new(now),
            tasks: Mutex::new(Vec::new()),
        });

        let (read_half, write_half) = socket.into_split();
        let reader = FramedRead::new(read_half, MuxCodec::new(options.max_frame_size));
        let writer = FramedWrite::new(write_half, MuxCodec::new(options.max_frame_size));

        let read_task = tokio::spawn(read_loop(Arc::clone(&inner), reader, options.idle_timeout));
        let write_task = tokio::spawn(write_loop(Arc::clone(&inner), writer, outbound_rx));
        lock(&inner.tasks).extend([read_task, write_task]);

        // A task may already have failed before its handle was stored.
        if inner.is_destroyed() {
            for task in lock(&inner.tasks).drain(..) {
                task.abort();
            }
        }

        debug!(mux = %inner.label, "Multiplexer created");
        (Multiplexer { inner }, IncomingStreams { rx: incoming_rx })
    }

    /// Open a new logical stream towards the remote side.
    pub fn open_stream(&self) -> Result<MuxStream> {
        if self.inner.is_destroyed() {
            return Err(BridgeError::MuxClosed);
        }

        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let key = StreamKey { id, local: true };
        let (tx, rx) = self.inner.new_stream_channel();
        lock(&self.inner.streams).insert(key, tx);

        let stream = MuxStream::new(key, Arc::clone(&self.inner), rx);
        self.inner.send_frame(Frame::open(id))?;
        trace!(mux = %self.inner.label, stream = id, "Opened stream");
        Ok(stream)
    }

    /// Tear down the session, every stream it owns and the physical socket.
    /// Calling this more than once is a no-op.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Resolves once the session has been destroyed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Time of the last frame received on the physical socket.
    pub fn last_activity(&self) -> Instant {
        *lock(&self.inner.last_activity)
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    pub fn label(&self) -> &str {
        self.inner.label()
    }

    /// Whether both handles refer to the same session.
    pub fn same_session(&self, other: &Multiplexer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("label", &self.inner.label)
            .field("destroyed", &self.inner.is_destroyed())
            .field("streams", &self.stream_count())
            .finish()
    }
}

async fn read_loop(
    inner: Arc<MuxInner>,
    mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, MuxCodec>,
    idle_timeout: Option<Duration>,
) {
    loop {
        let next = match idle_timeout {
            Some(idle) => {
                let deadline = *lock(&inner.last_io) + idle;
                match tokio::time::timeout_at(deadline.into(), reader.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if lock(&inner.last_io).elapsed() >= idle {
                            debug!(mux = %inner.label, ?idle, "Physical link idle timeout");
                            break;
                        }
                        // Outbound traffic moved the deadline.
                        continue;
                    }
                }
            }
            None => reader.next().await,
        };

        match next {
            Some(Ok(frame)) => {
                inner.touch_inbound();
                inner.dispatch(frame).await;
                // Waiting on a slow stream is not idle time.
                inner.touch_io();
            }
            Some(Err(e)) => {
                warn!(mux = %inner.label, "Physical link read error: {}", e);
                break;
            }
            None => {
                debug!(mux = %inner.label, "Physical link closed by remote");
                break;
            }
        }
    }

    inner.destroy();
}

async fn write_loop(
    inner: Arc<MuxInner>,
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, MuxCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    // Credit is returned when `queued` drops, after the frame is written.
    while let Some(queued) = outbound.recv().await {
        if let Err(e) = writer.send(queued.frame).await {
            warn!(mux = %inner.label, "Physical link write error: {}", e);
            break;
        }
        inner.touch_io();
    }

    inner.destroy();
}
