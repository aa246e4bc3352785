//! Graceful Shutdown Module
//!
//! Handles graceful shutdown: signal handling, waiting for the server to drain
//! in-flight connections, and removing the Unix socket file when one was bound.

use crate::{ProxyError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    /// Server task awaited during shutdown so in-flight requests can finish
    server_task: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Socket file removed once the server has stopped
    unix_socket: Option<PathBuf>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            server_task: Mutex::new(None),
            unix_socket: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set the server task to wait for
    pub async fn set_server_task(&self, task: JoinHandle<Result<()>>) {
        *self.server_task.lock().await = Some(task);
    }

    /// Set the Unix socket path to remove on shutdown
    pub fn set_unix_socket(&mut self, path: PathBuf) {
        self.unix_socket = Some(path);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No receivers left; the server already stopped
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        let result = match timeout(self.shutdown_timeout, self.wait_for_server()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error during graceful shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        };

        // Runs even after a timeout so a restart can bind the same path
        self.remove_unix_socket();
        result
    }

    async fn wait_for_server(&self) -> Result<()> {
        let task = self.server_task.lock().await.take();
        match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(ProxyError::SystemError(format!(
                    "Server task failed: {}",
                    e
                ))),
            },
            None => Ok(()),
        }
    }

    fn remove_unix_socket(&self) {
        if let Some(path) = &self.unix_socket {
            match std::fs::remove_file(path) {
                Ok(()) => info!("Removed unix socket {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove unix socket {:?}: {}", path, e),
            }
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    /// Create new shutdown signal from receiver
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal; a closed or lagged channel also counts
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}
