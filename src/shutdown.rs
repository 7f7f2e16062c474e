//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM or SIGINT, then stops the connection manager, which
//! closes every listener and physical link it owns. Background tasks of the
//! binary observe the same shutdown flag and wind down with it.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;

/// Cloneable view of the shutdown flag
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered. Resolves immediately if it
    /// already was.
    pub async fn triggered(&mut self) {
        // An error means the coordinator is gone, which is shutdown too.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Drives shutdown of the binary
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    /// Upper bound for stopping the manager
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, timeout }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Flag shutdown without waiting for an OS signal. Idempotent.
    pub fn trigger(&self) {
        if self.tx.send_if_modified(|triggered| !std::mem::replace(triggered, true)) {
            debug!("Shutdown triggered");
        }
    }

    /// Block until SIGTERM or SIGINT, then flag shutdown.
    pub async fn listen_for_signals(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use signal::unix::{signal as unix_signal, SignalKind};

            let mut sigterm = unix_signal(SignalKind::terminate())?;
            let mut sigint = unix_signal(SignalKind::interrupt())?;
            let mut flagged = self.signal();

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = flagged.triggered() => debug!("Shutdown requested internally"),
            }
        }

        #[cfg(not(unix))]
        {
            let mut flagged = self.signal();
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, shutting down");
                }
                _ = flagged.triggered() => debug!("Shutdown requested internally"),
            }
        }

        self.trigger();
        Ok(())
    }

    /// Stop `manager`, giving up after the configured timeout. Flags
    /// shutdown either way so background tasks exit.
    pub async fn stop_manager(&self, manager: &ConnectionManager) -> Result<()> {
        let started = Instant::now();
        let before = manager.stats().await;
        info!(
            peers = before.peers.len(),
            incoming = before.incoming_connections,
            "Stopping connection manager (timeout {:?})",
            self.timeout
        );

        let result = match tokio::time::timeout(self.timeout, manager.stop()).await {
            Ok(Ok(())) => {
                info!("Connection manager stopped after {:?}", started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Connection manager refused to stop: {}", e);
                Ok(())
            }
            Err(_) => Err(anyhow!("Connection manager did not stop within {:?}", self.timeout)),
        };

        self.trigger();
        result
    }

    /// Run `task` until it finishes or shutdown is flagged, whichever comes
    /// first.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.signal();
        tokio::spawn(async move {
            debug!(task = name, "Background task started");
            tokio::select! {
                _ = task => debug!(task = name, "Background task finished"),
                _ = shutdown.triggered() => debug!(task = name, "Background task stopped by shutdown"),
            }
        })
    }
}
