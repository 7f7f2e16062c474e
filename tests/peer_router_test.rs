//! Integration tests for per-peer routers: forward and reverse links,
//! establishment races and eviction

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};

use common::{
    closed_by_peer, echo_server, next_event, roundtrip, serve_echo_streams, test_config, wait_until, RemotePeer,
};
use peermux::config::BridgeConfig;
use peermux::mux::{Multiplexer, MuxOptions};
use peermux::server::loopback;
use peermux::{BridgeError, BridgeEvent, ConnectionDescriptor, ConnectionManager, IncomingConnectionState, StaticTransport};

async fn started(config: BridgeConfig) -> (ConnectionManager, Arc<StaticTransport>, u16) {
    let transport = Arc::new(StaticTransport::new());
    let manager = ConnectionManager::new(config, transport.clone());
    let native_port = manager.start().await.unwrap();
    (manager, transport, native_port)
}

fn failed_with(event: &BridgeEvent, peer: &str) -> Option<String> {
    match event {
        BridgeEvent::FailedConnection {
            error,
            peer_identifier,
        } if peer_identifier == peer => Some(error.clone()),
        _ => None,
    }
}

/// A physical link into our native listener whose remote port is known in
/// advance, as the native layer would report it in a reverse descriptor.
async fn reverse_link(native_port: u16) -> (Multiplexer, u16) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind(loopback(0)).unwrap();
    let client_port = socket.local_addr().unwrap().port();
    let stream = socket.connect(loopback(native_port)).await.unwrap();
    let (mux, incoming) = Multiplexer::new(stream, "remote", MuxOptions::default());
    serve_echo_streams(incoming);
    (mux, client_port)
}

#[tokio::test]
async fn test_eager_forward_connection() {
    let remote = RemotePeer::listen().await;
    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    transport.set_route("peer-a", ConnectionDescriptor::Forward { listening_port: remote.port });

    let port = manager.create_peer_listener("peer-a", true).await.unwrap();
    assert_eq!(transport.connect_count("peer-a"), 1);
    wait_until(|| remote.link_count() == 1).await;

    assert_eq!(roundtrip(port, b"hello peer").await.unwrap(), b"hello peer");

    // Same peer, same port, no new native connect.
    assert_eq!(manager.create_peer_listener("peer-a", true).await.unwrap(), port);
    assert_eq!(manager.create_peer_listener("peer-a", false).await.unwrap(), port);
    assert_eq!(transport.connect_count("peer-a"), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_lazy_forward_connection_is_shared() {
    let remote = RemotePeer::listen().await;
    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    transport.set_route("peer-a", ConnectionDescriptor::Forward { listening_port: remote.port });

    let port = manager.create_peer_listener("peer-a", false).await.unwrap();
    assert_eq!(transport.connect_count("peer-a"), 0);

    let (first, second) = tokio::join!(roundtrip(port, b"one"), roundtrip(port, b"two"));
    assert_eq!(first.unwrap(), b"one");
    assert_eq!(second.unwrap(), b"two");
    assert_eq!(roundtrip(port, b"three").await.unwrap(), b"three");

    // Every application connection rode the same physical link.
    assert_eq!(transport.connect_count("peer-a"), 1);
    assert_eq!(remote.link_count(), 1);
    assert!(manager.stats().await.peers[0].bound);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_lazy_native_error_is_reported_and_retryable() {
    let remote = RemotePeer::listen().await;
    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();
    transport.set_error("peer-x", "Peer not available");

    let port = manager.create_peer_listener("peer-x", false).await.unwrap();
    let mut app = TcpStream::connect(loopback(port)).await.unwrap();
    let event = next_event(&mut events, |e| failed_with(e, "peer-x").is_some()).await;
    assert_eq!(failed_with(&event, "peer-x").unwrap(), "Peer not available");
    assert!(closed_by_peer(&mut app).await);

    transport.set_route("peer-x", ConnectionDescriptor::Forward { listening_port: remote.port });
    assert_eq!(roundtrip(port, b"retry").await.unwrap(), b"retry");
    assert_eq!(transport.connect_count("peer-x"), 2);

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_native_connect_is_issued_once_per_connection() {
    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    transport.set_error("peer-x", "Peer not available");
    let port = manager.create_peer_listener("peer-x", false).await.unwrap();

    for attempt in 1..=30 {
        let mut app = TcpStream::connect(loopback(port)).await.unwrap();
        assert!(closed_by_peer(&mut app).await);
        assert_eq!(transport.connect_count("peer-x"), attempt);
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_lazy_forward_connect_failure() {
    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();
    transport.set_route("peer-a", ConnectionDescriptor::Forward { listening_port: common::closed_port().await });

    let port = manager.create_peer_listener("peer-a", false).await.unwrap();
    let mut app = TcpStream::connect(loopback(port)).await.unwrap();
    let event = next_event(&mut events, |e| failed_with(e, "peer-a").is_some()).await;
    assert_eq!(failed_with(&event, "peer-a").unwrap(), "Cannot Connect To Peer");
    assert!(closed_by_peer(&mut app).await);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_eager_failures_tear_the_entry_down() {
    let (manager, transport, native_port) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();

    transport.set_error("peer-x", "Peer not available");
    match manager.create_peer_listener("peer-x", true).await {
        Err(BridgeError::Native(message)) => assert_eq!(message, "Peer not available"),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(manager.peer_count().await, 0);

    transport.set_route(
        "peer-r",
        ConnectionDescriptor::Reverse {
            client_port: 5555,
            server_port: native_port,
        },
    );
    let err = manager.create_peer_listener("peer-r", true).await.unwrap_err();
    assert!(matches!(err, BridgeError::UnexpectedReverseConnection));
    let event = next_event(&mut events, |e| failed_with(e, "peer-r").is_some()).await;
    assert_eq!(failed_with(&event, "peer-r").unwrap(), "Cannot Connect To Peer");
    assert_eq!(manager.peer_count().await, 0);

    let remote = RemotePeer::listen().await;
    transport.set_route("peer-x", ConnectionDescriptor::Forward { listening_port: remote.port });
    let port = manager.create_peer_listener("peer-x", true).await.unwrap();
    assert_eq!(roundtrip(port, b"ok").await.unwrap(), b"ok");

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_reverse_binds_existing_inbound_link() {
    let (manager, transport, native_port) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();

    let (_remote, client_port) = reverse_link(native_port).await;
    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::IncomingConnectionState { state: IncomingConnectionState::Connected, .. })
    })
    .await;

    transport.set_route(
        "peer-b",
        ConnectionDescriptor::Reverse {
            client_port,
            server_port: native_port,
        },
    );
    let port = manager.create_peer_listener("peer-b", false).await.unwrap();
    assert_eq!(roundtrip(port, b"reverse").await.unwrap(), b"reverse");
    assert_eq!(roundtrip(port, b"again").await.unwrap(), b"again");

    // No outbound link was opened; the inbound one is reused.
    let stats = manager.stats().await;
    assert_eq!(stats.incoming_connections, 1);
    assert_eq!(transport.connect_count("peer-b"), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_reports_no_failed_connections() {
    let (manager, transport, native_port) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();

    let (_remote, client_port) = reverse_link(native_port).await;
    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::IncomingConnectionState { state: IncomingConnectionState::Connected, .. })
    })
    .await;
    transport.set_route(
        "peer-b",
        ConnectionDescriptor::Reverse {
            client_port,
            server_port: native_port,
        },
    );
    let port = manager.create_peer_listener("peer-b", false).await.unwrap();
    assert_eq!(roundtrip(port, b"bound").await.unwrap(), b"bound");

    let mut during_stop = manager.subscribe();
    manager.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut seen = Vec::new();
    while let Ok(event) = during_stop.try_recv() {
        seen.push(event);
    }
    assert!(
        seen.iter().any(|e| matches!(
            e,
            BridgeEvent::IncomingConnectionState { state: IncomingConnectionState::Disconnected, .. }
        )),
        "inbound link was not closed: {:?}",
        seen
    );
    assert!(
        !seen.iter().any(|e| matches!(e, BridgeEvent::FailedConnection { .. })),
        "stop reported a failure: {:?}",
        seen
    );
}

#[tokio::test]
async fn test_reverse_answer_before_inbound_link() {
    let (manager, transport, native_port) = started(test_config(echo_server().await)).await;

    // Reserve the link's source port but do not connect yet.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind(loopback(0)).unwrap();
    let client_port = socket.local_addr().unwrap().port();

    transport.set_route(
        "peer-c",
        ConnectionDescriptor::Reverse {
            client_port,
            server_port: native_port,
        },
    );
    let port = manager.create_peer_listener("peer-c", false).await.unwrap();

    let app = tokio::spawn(roundtrip(port, b"raced"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stream = socket.connect(loopback(native_port)).await.unwrap();
    let (_remote, incoming) = Multiplexer::new(stream, "remote", MuxOptions::default());
    serve_echo_streams(incoming);

    assert_eq!(app.await.unwrap().unwrap(), b"raced");
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_reverse_link_never_arrives() {
    let mut config = test_config(echo_server().await);
    config.reverse_rendezvous_timeout = Duration::from_millis(200);
    let (manager, transport, native_port) = started(config).await;
    let mut events = manager.subscribe();

    transport.set_route(
        "peer-d",
        ConnectionDescriptor::Reverse {
            client_port: common::closed_port().await,
            server_port: native_port,
        },
    );
    let port = manager.create_peer_listener("peer-d", false).await.unwrap();
    let mut app = TcpStream::connect(loopback(port)).await.unwrap();

    let event = next_event(&mut events, |e| failed_with(e, "peer-d").is_some()).await;
    assert_eq!(failed_with(&event, "peer-d").unwrap(), "Incoming connection died");
    assert!(closed_by_peer(&mut app).await);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_server_port_resets_first_connection() {
    let remote = RemotePeer::listen().await;
    let (manager, transport, native_port) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();

    transport.set_route(
        "peer-e",
        ConnectionDescriptor::Reverse {
            client_port: 5555,
            server_port: native_port.wrapping_add(1),
        },
    );
    let port = manager.create_peer_listener("peer-e", false).await.unwrap();
    let mut app = TcpStream::connect(loopback(port)).await.unwrap();

    let event = next_event(&mut events, |e| failed_with(e, "peer-e").is_some()).await;
    assert_eq!(failed_with(&event, "peer-e").unwrap(), "Mismatched serverPort");
    assert!(closed_by_peer(&mut app).await);

    // The next application connection starts over with a fresh native connect.
    transport.set_route("peer-e", ConnectionDescriptor::Forward { listening_port: remote.port });
    assert_eq!(roundtrip(port, b"fresh").await.unwrap(), b"fresh");
    assert_eq!(transport.connect_count("peer-e"), 2);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_link_death_is_reported_and_reestablished() {
    let remote = RemotePeer::listen().await;
    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    let mut events = manager.subscribe();
    transport.set_route("peer-a", ConnectionDescriptor::Forward { listening_port: remote.port });

    let port = manager.create_peer_listener("peer-a", false).await.unwrap();
    assert_eq!(roundtrip(port, b"before").await.unwrap(), b"before");

    remote.destroy_links();
    let event = next_event(&mut events, |e| failed_with(e, "peer-a").is_some()).await;
    assert_eq!(failed_with(&event, "peer-a").unwrap(), "Physical link closed");

    assert_eq!(manager.create_peer_listener("peer-a", false).await.unwrap(), port);
    assert_eq!(roundtrip(port, b"after").await.unwrap(), b"after");
    assert_eq!(transport.connect_count("peer-a"), 2);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_terminate_ignores_stale_port() {
    let (manager, _transport, _) = started(test_config(echo_server().await)).await;

    let port = manager.create_peer_listener("peer-a", false).await.unwrap();
    assert!(!manager.terminate_outgoing_connection("peer-a", port.wrapping_add(1)).await);
    assert!(!manager.terminate_outgoing_connection("nobody", port).await);
    assert_eq!(manager.peer_port("peer-a").await, Some(port));

    assert!(manager.terminate_outgoing_connection("peer-a", port).await);
    assert_eq!(manager.peer_count().await, 0);
    assert!(TcpStream::connect(loopback(port)).await.is_err());
    assert!(!manager.terminate_outgoing_connection("peer-a", port).await);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_eviction_drops_least_recently_active_peer() {
    let remote = RemotePeer::listen().await;
    let mut config = test_config(echo_server().await);
    config.max_peers = 2;
    let (manager, transport, _) = started(config).await;
    for peer in ["a", "b", "c", "d"] {
        transport.set_route(peer, ConnectionDescriptor::Forward { listening_port: remote.port });
    }

    let port_a = manager.create_peer_listener("a", false).await.unwrap();
    let port_b = manager.create_peer_listener("b", false).await.unwrap();

    // Traffic on a's link makes b the oldest.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(roundtrip(port_a, b"keep").await.unwrap(), b"keep");

    // Let the stream teardown frames settle before c is created.
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.create_peer_listener("c", false).await.unwrap();
    assert_eq!(manager.peer_count().await, 2);
    assert_eq!(manager.peer_port("a").await, Some(port_a));
    assert_eq!(manager.peer_port("b").await, None);
    assert!(TcpStream::connect(loopback(port_b)).await.is_err());

    // a's last traffic predates c's creation, so a goes next.
    manager.create_peer_listener("d", false).await.unwrap();
    assert_eq!(manager.peer_count().await, 2);
    assert_eq!(manager.peer_port("a").await, None);
    assert!(manager.peer_port("c").await.is_some());
    assert!(manager.peer_port("d").await.is_some());
    assert!(TcpStream::connect(loopback(port_a)).await.is_err());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_application_writes_wait_for_a_stalled_link() {
    const CHUNK: usize = 1024 * 1024;
    const FLOOD_LIMIT: usize = 64 * 1024 * 1024;

    // The far side accepts the physical link and never reads from it.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    let held = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            sockets.push(socket);
        }
    });

    let (manager, transport, _) = started(test_config(echo_server().await)).await;
    transport.set_route("slow", ConnectionDescriptor::Forward { listening_port: silent_port });
    let port = manager.create_peer_listener("slow", false).await.unwrap();

    let mut app = TcpStream::connect(loopback(port)).await.unwrap();
    let chunk = vec![0u8; CHUNK];
    let mut written = 0;
    while written < FLOOD_LIMIT {
        match tokio::time::timeout(Duration::from_millis(500), app.write_all(&chunk)).await {
            Ok(Ok(())) => written += CHUNK,
            Ok(Err(e)) => panic!("application write failed: {}", e),
            Err(_) => break,
        }
    }
    assert!(written < FLOOD_LIMIT, "bridge accepted {} bytes for a link that reads nothing", written);

    manager.stop().await.unwrap();
    held.abort();
}
