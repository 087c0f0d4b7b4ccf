//! Server binary: environment-driven configuration, structured logging,
//! port-file persistence, and signal-driven shutdown.
//!
//! Run with: cargo run -p remote-repl-server
//!
//! `REPL_HOST` / `REPL_PORT` override the listen address; `RUST_LOG`
//! controls verbosity.

use remote_repl_server::{DEFAULT_HOST, DEFAULT_PORT, PORT_FILENAME, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let host = std::env::var("REPL_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_owned());
    let port = std::env::var("REPL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let server = Server::bind(&host, port).await?;
    let addr = server.local_addr()?;
    tracing::info!("server started on repl://{addr}");
    std::fs::write(PORT_FILENAME, addr.port().to_string())?;

    let result = tokio::select! {
        result = server.serve() => result.map_err(Into::into),
        () = shutdown_signal() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };

    let _ = std::fs::remove_file(PORT_FILENAME);
    result
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
