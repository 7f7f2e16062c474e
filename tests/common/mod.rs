//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

use peermux::config::BridgeConfig;
use peermux::mux::{IncomingStreams, Multiplexer, MuxOptions, MuxStream};
use peermux::BridgeEvent;

pub const WAIT: Duration = Duration::from_secs(5);

/// Bridge config pointing at `router_port` with test-friendly timeouts.
pub fn test_config(router_port: u16) -> BridgeConfig {
    let mut config = BridgeConfig::with_router_port(router_port);
    config.connect_timeout = Duration::from_secs(2);
    config.reverse_rendezvous_timeout = Duration::from_secs(1);
    config
}

/// Plain TCP echo server standing in for the application's router.
pub async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rx, mut tx) = socket.split();
                let _ = tokio::io::copy(&mut rx, &mut tx).await;
            });
        }
    });
    port
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo everything received on `stream` until the remote side finishes.
pub async fn echo_stream(mut stream: MuxStream) {
    while let Ok(Some(data)) = stream.read().await {
        if stream.write(data).await.is_err() {
            return;
        }
    }
    stream.finish();
}

pub fn serve_echo_streams(mut incoming: IncomingStreams) {
    tokio::spawn(async move {
        while let Some(stream) = incoming.accept().await {
            tokio::spawn(echo_stream(stream));
        }
    });
}

/// The far side of a forward connection: accepts physical links and echoes
/// every stream opened on them.
pub struct RemotePeer {
    pub port: u16,
    links: Arc<Mutex<Vec<Multiplexer>>>,
}

impl RemotePeer {
    pub async fn listen() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let links = Arc::new(Mutex::new(Vec::new()));

        let accepted = Arc::clone(&links);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (mux, incoming) = Multiplexer::new(socket, "remote-peer", MuxOptions::default());
                serve_echo_streams(incoming);
                accepted.lock().unwrap().push(mux);
            }
        });

        Self { port, links }
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn destroy_links(&self) {
        for mux in self.links.lock().unwrap().drain(..) {
            mux.destroy();
        }
    }
}

/// Connect to `port`, send `payload` and read the same number of bytes back.
pub async fn roundtrip(port: u16, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut socket = TcpStream::connect(("127.0.0.1", port)).await?;
    socket.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, socket.read_exact(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no echo"))??;
    Ok(buf)
}

/// Read from a mux stream until `len` bytes arrived.
pub async fn read_stream_exact(stream: &mut MuxStream, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    while buf.len() < len {
        match timeout(WAIT, stream.read()).await {
            Ok(Ok(Some(data))) => buf.extend_from_slice(&data),
            Ok(Ok(None)) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::ErrorKind::TimedOut.into()),
        }
    }
    Ok(buf.to_vec())
}

/// Whether the peer of `socket` closes it within the wait period.
pub async fn closed_by_peer(socket: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(timeout(WAIT, socket.read(&mut buf)).await, Ok(Ok(0)) | Ok(Err(_)))
}

pub async fn next_event<F>(rx: &mut broadcast::Receiver<BridgeEvent>, mut matches: F) -> BridgeEvent
where
    F: FnMut(&BridgeEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event was not emitted")
}

pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
