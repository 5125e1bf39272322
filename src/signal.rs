//! Signal handling for graceful shutdown.
//!
//! The controller and daemon loops finish their in-flight cycle and exit once
//! SIGINT or SIGTERM arrives.

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// A token shared across tasks to observe and request shutdown.
///
/// `cancelled()` resolves immediately once `cancel()` has been called, so
/// late waiters never miss the signal.
pub use tokio_util::sync::CancellationToken as ShutdownToken;

/// Listens for SIGINT and SIGTERM and cancels the token on the first one.
pub struct ShutdownGuard {
    token: ShutdownToken,
}

impl ShutdownGuard {
    /// Spawn the signal listener.
    ///
    /// If no handler can be registered the guard still works, it just never
    /// fires.
    pub fn new(token: ShutdownToken) -> Self {
        let listener = token.clone();
        tokio::spawn(async move {
            let sigint = signal(SignalKind::interrupt())
                .map_err(|e| warn!("Failed to register SIGINT handler: {}", e))
                .ok();
            let sigterm = signal(SignalKind::terminate())
                .map_err(|e| warn!("Failed to register SIGTERM handler: {}", e))
                .ok();

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, shutting down"),
                        _ = term.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, shutting down");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, shutting down");
                }
                (None, None) => {
                    warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }
            listener.cancel();
        });

        Self { token }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }
}
