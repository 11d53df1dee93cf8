//! HTTP listener startup and drain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::HttpServerConfig;

/// Server startup error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid http.host or http.port: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("Failed to bind server: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Server(String),
}

/// Start the HTTP server and block until it has shut down.
///
/// `accepting` is raised only after the listener is bound, so readiness
/// reported elsewhere never runs ahead of the socket actually existing.
/// Once `shutdown` flips, the listener stops accepting and in-flight
/// requests get `shutdown_grace` to finish; connections still open after
/// that are aborted.
pub async fn start_server(
    app: Router,
    config: &HttpServerConfig,
    accepting: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    accepting.store(true, Ordering::SeqCst);
    tracing::info!(%addr, "HTTP server listening");

    let grace = config.shutdown_grace();

    let mut drain_signal = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = drain_signal.wait_for(|stop| *stop).await;
    });

    let mut abort_signal = shutdown;
    let drain_deadline = async move {
        let _ = abort_signal.wait_for(|stop| *stop).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|e| ServerError::Server(e.to_string()))?;
            tracing::info!("HTTP server drained");
        }
        _ = drain_deadline => {
            tracing::warn!(
                grace_seconds = grace.as_secs(),
                "Drain grace elapsed, aborting remaining connections"
            );
        }
    }

    Ok(())
}
