//! TCP listener and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;

use crate::connection::ConnectionEngine;
use crate::state::{ServerState, pump_engine_events};

/// Server error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bound listener plus the shared state handed to every connection.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Bind a listener and wire up the built-in script engine.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(host: &str, port: u16) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((host, port)).await?;
        let (state, events) = ServerState::with_script_engine();
        tokio::spawn(pump_engine_events(Arc::clone(&state), events));
        Ok(Self { listener, state })
    }

    /// The bound address (useful when binding port 0).
    ///
    /// # Errors
    /// Returns error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared registries, engine, and broadcaster.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accept connections forever, one connection engine per socket.
    ///
    /// # Errors
    /// Returns error if accepting fails.
    pub async fn serve(self) -> Result<(), ServerError> {
        let conn_counter = AtomicU64::new(0);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(conn_id, %peer, "client connected");
            tokio::spawn(ConnectionEngine::run(
                Arc::clone(&self.state),
                stream,
                conn_id,
            ));
        }
    }
}
