//! Graceful shutdown signalling for background loops

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Stop loops and also stop every in-flight position
    Emergency,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Emergency => write!(f, "emergency"),
        }
    }
}

/// Shutdown coordinator shared by the clock refresh, reconciliation and
/// service loops
pub struct GracefulShutdown {
    requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);
        Self {
            requested: AtomicBool::new(false),
            signal_tx,
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.signal_tx.subscribe(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown; later requests are ignored
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }
        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    /// Wait for SIGINT and translate it into a graceful shutdown
    pub async fn listen_for_ctrl_c(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => self.request_shutdown(ShutdownSignal::Graceful),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable receiving side of a [`GracefulShutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownListener {
    /// Resolve once shutdown is requested, returning the signal.
    ///
    /// Also resolves (as graceful) if the coordinator was dropped.
    pub async fn wait(&mut self) -> ShutdownSignal {
        match self.rx.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Graceful),
            Err(_) => ShutdownSignal::Graceful,
        }
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_observe_first_signal_only() {
        let shutdown = GracefulShutdown::new();
        let mut early = shutdown.listener();
        let late = shutdown.listener();

        let waiter = tokio::spawn(async move { early.wait().await });
        shutdown.request_shutdown(ShutdownSignal::Emergency);
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        let signal = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Emergency);
        assert_eq!(late.signal(), Some(ShutdownSignal::Emergency));
        assert!(shutdown.is_shutdown_requested());
    }

    #[tokio::test]
    async fn dropped_coordinator_releases_listeners() {
        let shutdown = GracefulShutdown::new();
        let mut listener = shutdown.listener();
        drop(shutdown);
        assert_eq!(listener.wait().await, ShutdownSignal::Graceful);
    }
}
