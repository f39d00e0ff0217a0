//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running task (the
//! pipeline loop, the metrics reporter). Once triggered, by SIGINT/SIGTERM
//! or programmatically, it stays triggered: tasks that check late still see
//! it, unlike a one-shot broadcast.
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//!
//! let listener = shutdown.clone();
//! tokio::spawn(async move { listener.listen_for_signals().await });
//!
//! while !shutdown.is_shutdown() {
//!     // one loop iteration
//! }
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A latched, cloneable shutdown flag with async notification.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Trigger shutdown manually (for tests or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.is_shutdown() {
            info!("Shutdown triggered programmatically");
        }
        self.sender.send_replace(true);
    }

    /// Resolve once shutdown has been triggered (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            // The sender lives as long as any clone of this signal, including self.
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// Returns early without triggering if another path shuts down first.
    pub async fn listen_for_signals(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = terminate.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => return Ok(()),
        }

        self.sender.send_replace(true);
        Ok(())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_starts_untriggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_clone_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let late = signal.clone();
        assert!(late.is_shutdown());
        tokio::time::timeout(Duration::from_millis(100), late.cancelled())
            .await
            .expect("already-triggered signal resolves immediately");
    }

    #[tokio::test]
    async fn test_listener_returns_when_triggered_elsewhere() {
        let signal = ShutdownSignal::new();
        let listener = signal.clone();
        let handle = tokio::spawn(async move { listener.listen_for_signals().await });

        signal.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
