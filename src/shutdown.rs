//! Graceful shutdown coordination.
//!
//! One shared signal fans out to the accept loop and every connection
//! handler. On shutdown the supervisor stops accepting, broadcasts the
//! cancellation, and waits for active handlers to drain within a grace
//! period before the process exits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{info, warn};

/// Shutdown signal shared across tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    is_shutting_down: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Broadcast cancellation to every subscriber.
    pub fn trigger(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }

    /// Receiver that resolves once [`trigger`](Self::trigger) runs.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Count a connection for draining; the guard releases it on drop,
    /// panics included.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: self.active.clone(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for active connections to finish, up to `grace`.
    ///
    /// Returns true when everything drained in time.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let drained = async {
            while self.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        match timeout(grace, drained).await {
            Ok(()) => {
                info!("all connections drained");
                true
            }
            Err(_) => {
                warn!(
                    "shutdown grace expired with {} connections still active",
                    self.active_connections()
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases its connection slot when dropped.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
pub async fn wait_for_signal() {
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
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
