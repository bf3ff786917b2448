//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into the API server and every consumer
//! worker. When a termination signal arrives, workers stop fetching but
//! finish the message they are on, including its commit, before releasing
//! their partition.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Default grace period for workers to wind down.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// Broadcast-based shutdown notification.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a signal with the default grace period (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a signal with a custom grace period.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender, timeout }
    }

    /// Grace period workers get to finish their in-flight message.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until SIGTERM or SIGINT, then notify all subscribers.
    pub async fn wait(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        let _ = self.sender.send(());
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown programmatically (tests, admin-initiated restarts).
    pub fn trigger(&self) {
        info!("shutdown triggered programmatically");
        let _ = self.sender.send(());
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

    #[tokio::test]
    async fn test_default_timeout() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_trigger_reaches_subscriber() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_the_signal() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();

        let mut receiver1 = signal.subscribe();
        let mut receiver2 = clone.subscribe();

        signal.trigger();

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
    }
}
