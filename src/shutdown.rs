//! Ctrl-c driven shutdown for the daemon's long-running tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period for registered tasks once shutdown was signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Token handed to every task that must stop on shutdown
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.task_handles.push((name, handle));
    }

    /// Block until ctrl-c (or until something else cancels the token), then
    /// give the registered tasks a bounded time to finish.
    pub async fn wait_for_shutdown(mut self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                tracing::info!("🛑 Shutdown signal received");
            }
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }

        self.cancel_token.cancel();

        let tasks = std::mem::take(&mut self.task_handles);
        let drain = async {
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    tracing::warn!("Task {} ended abnormally: {}", name, e);
                }
            }
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, drain).await {
            Ok(_) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
