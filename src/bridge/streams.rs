//! Forwarding of remotely opened streams to the application's router port

use std::future;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::BridgeContext;
use crate::connection::BridgeEvent;
use crate::mux::{IncomingStreams, MuxStream};
use crate::relay::{splice, RelaySession};
use crate::server::loopback;

/// Pair every stream the remote side opens with a fresh connection to the
/// router port. Returns once the multiplexer is destroyed.
pub async fn forward_incoming_streams(mut incoming: IncomingStreams, ctx: Arc<BridgeContext>) {
    while let Some(stream) = incoming.accept().await {
        tokio::spawn(bridge_to_router(stream, Arc::clone(&ctx)));
    }
}

async fn bridge_to_router(stream: MuxStream, ctx: Arc<BridgeContext>) {
    let router_port = ctx.router_port();
    let connect = TcpStream::connect(loopback(router_port));

    let socket = match timeout(ctx.config.connect_timeout, connect).await {
        Ok(Ok(socket)) => socket,
        result => {
            let error = match result {
                Ok(Err(e)) => e.to_string(),
                _ => "connect timed out".to_string(),
            };
            warn!(
                mux = %stream.mux_label(),
                stream = stream.id(),
                router_port,
                "Router port connection failed: {}", error
            );
            ctx.events.emit(BridgeEvent::RouterPortConnectionFailed { error, router_port });
            // Only this stream goes; the physical link stays up.
            stream.reset();
            return;
        }
    };

    let addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("Router socket vanished before relay: {}", e);
            stream.reset();
            return;
        }
    };

    let session = RelaySession::new(format!("{}/{}", stream.mux_label(), stream.id()), addr);
    let outcome = splice(
        socket,
        stream,
        &session,
        ctx.config.buffer_size,
        future::pending::<()>(),
    )
    .await;
    session.finish(&outcome);
}
