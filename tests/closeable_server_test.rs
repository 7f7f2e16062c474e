//! Integration tests for the closeable listener

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{closed_by_peer, wait_until};
use peermux::server::{loopback, AcceptedConnection, CloseableServer};

/// Echo server whose connections end when the server is closed.
async fn echo_server() -> CloseableServer {
    CloseableServer::bind(loopback(0), "echo", |conn: AcceptedConnection| {
        let AcceptedConnection {
            mut stream,
            mut guard,
            ..
        } = conn;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    _ = guard.killed() => break,
                    read = stream.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_close_all_destroys_connections_then_listener() {
    let server = echo_server().await;
    let port = server.port();

    let mut first = TcpStream::connect(loopback(port)).await.unwrap();
    let mut second = TcpStream::connect(loopback(port)).await.unwrap();

    first.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    wait_until(|| server.connection_count() == 2).await;

    server.close_all().await;
    assert!(server.is_closed());
    assert_eq!(server.connection_count(), 0);

    assert!(closed_by_peer(&mut first).await);
    assert!(closed_by_peer(&mut second).await);
    assert!(TcpStream::connect(loopback(port)).await.is_err());

    // Second close is a no-op.
    server.close_all().await;
}

#[tokio::test]
async fn test_dropped_guard_untracks_connection() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let server = CloseableServer::bind(loopback(0), "drop", move |conn: AcceptedConnection| {
        counter.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    })
    .await
    .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(closed_by_peer(&mut client).await);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.name(), "drop");
}
