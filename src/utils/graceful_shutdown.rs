use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{signal, sync::broadcast, time::timeout};

/// Why the process is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Requested from code, e.g. by an embedding application
    Requested,
}

/// Shutdown signal fan-out plus the bound on cleanup work.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown triggered: {:?}", reason);
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Wait for SIGINT or SIGTERM and broadcast it.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for SIGINT: {}", e);
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
        self.trigger_shutdown(ShutdownReason::Signal);
    }

    /// Resolve once shutdown was triggered, including before this call.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if self.is_shutdown_initiated() {
            return receiver.try_recv().unwrap_or(ShutdownReason::Requested);
        }
        receiver.recv().await.unwrap_or(ShutdownReason::Requested)
    }

    /// Run one cleanup step within the shutdown timeout. Returns false on timeout.
    pub async fn bounded<F>(&self, step: &str, cleanup: F) -> bool
    where
        F: Future<Output = ()>,
    {
        match timeout(self.shutdown_timeout, cleanup).await {
            Ok(()) => {
                tracing::info!("{} stopped", step);
                true
            }
            Err(_) => {
                tracing::error!(
                    "{} did not stop within {:?}, continuing shutdown",
                    step,
                    self.shutdown_timeout
                );
                false
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_trigger_shutdown() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();
        assert!(!shutdown.is_shutdown_initiated());

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        shutdown.trigger_shutdown(ShutdownReason::Signal);

        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Requested);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_shutdown_signal().await })
        };
        tokio::task::yield_now().await;

        shutdown.trigger_shutdown(ShutdownReason::Signal);
        waiter.await.unwrap();
        // late waiters do not hang
        shutdown.wait_for_shutdown_signal().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_cleanup_times_out() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(2));

        assert!(shutdown.bounded("fast step", async {}).await);
        assert!(
            !shutdown
                .bounded("stuck step", std::future::pending::<()>())
                .await
        );
    }
}
