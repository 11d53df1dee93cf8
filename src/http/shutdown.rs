//! Shutdown signal handling.

use tokio::sync::watch;

/// Install SIGTERM and Ctrl+C listeners that flip the shared shutdown flag.
///
/// Every long-lived task watches the same flag: the listener stops accepting,
/// pool maintenance exits, and the health monitor stops publishing. The flag
/// only ever goes from `false` to `true`.
pub fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        let _ = shutdown.send(true);
    });
}
