//! Agent process: HTTP listener, handler registry, startup and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use allocfs_config::AppConfig;

use crate::fs::{AllocDirs, AllocFsProvider};
use crate::http::{HttpState, router};
use crate::logs::LocalLogs;
use crate::rpc::{LOGS_HANDLER, StreamingRpc};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The allocfs agent.
pub struct Agent {
    config: AppConfig,
    allocs: Arc<dyn AllocFsProvider>,
    rpc: Arc<StreamingRpc>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    streams: CancellationToken,
}

impl Agent {
    /// Create an agent serving allocations from `alloc.root`, with the local
    /// `FileSystem.Logs` handler registered.
    pub fn new(config: AppConfig) -> Self {
        let allocs = AllocDirs::new(&config.alloc.root);
        let mut rpc = StreamingRpc::new();
        rpc.register(
            LOGS_HANDLER,
            Arc::new(LocalLogs::new(allocs.clone(), config.stream.clone())),
        );
        Self::with_parts(config, Arc::new(allocs), rpc)
    }

    /// Create an agent from an explicit filesystem provider and handler set.
    pub fn with_parts(
        config: AppConfig,
        allocs: Arc<dyn AllocFsProvider>,
        rpc: StreamingRpc,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            allocs,
            rpc: Arc::new(rpc),
            shutdown_tx,
            streams: CancellationToken::new(),
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, AgentError> {
        let addr = self.config.http.socket_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| AgentError::Bind { addr, source })
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), AgentError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve the HTTP API on `listener` until a shutdown signal or Ctrl-C.
    ///
    /// Live log streams are cancelled when shutdown begins so that graceful
    /// shutdown does not wait on followed logs.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), AgentError> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(%addr, alloc_root = %self.config.alloc.root, "allocfs agent listening");

        let state = Arc::new(HttpState {
            allocs: Arc::clone(&self.allocs),
            rpc: Arc::clone(&self.rpc),
            stream: self.config.stream.clone(),
            shutdown: self.streams.clone(),
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone();
        let streams = self.streams.clone();

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping agent");
                    }
                    _ = streams.cancelled() => {
                        info!("Shutdown requested, stopping agent");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Ctrl-C received, initiating graceful shutdown");
                        let _ = shutdown_tx.send(ShutdownSignal);
                    }
                }
                streams.cancel();
            })
            .await?;

        info!("Agent stopped");
        Ok(())
    }

    /// Request a graceful shutdown of the agent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
        self.streams.cancel();
    }

    /// Subscribe to the shutdown broadcast.
    pub fn shutdown_subscriber(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Get a reference to the agent's configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The registered streaming handlers.
    pub fn rpc(&self) -> &StreamingRpc {
        &self.rpc
    }
}
