//! Turnstile: a self-hosted visit tracker.
//!
//! This is the application entry point. It initializes tracing, loads
//! configuration from a TOML file, brings up the connection pool and health
//! monitor, wires the Axum router, and runs the HTTP server until a shutdown
//! signal drains it.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turnstile::config::{
    AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER, SCHEMA_INIT_RETRY_SECS,
    SHIPPER_DRAIN_TIMEOUT_SECS,
};
use turnstile::db::{ConnectionPool, Gateway, PgConnector, PoolConfig};
use turnstile::health::{HealthMonitor, HealthRecorder};
use turnstile::http::{spawn_signal_listener, start_server};
use turnstile::routes::create_router;
use turnstile::shipper::Shipper;
use turnstile::state::AppState;
use turnstile::visits::{PgVisitStore, VisitService, VisitStore};

/// Turnstile: a self-hosted visit tracker
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "turnstile=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Configuration comes first so the log format below can honor it
    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Loaded configuration");

    let connector = PgConnector::new(&config.database.url)?;
    tracing::info!(
        database = %connector.display_url(),
        max_size = config.database.max_size,
        min_idle = config.database.min_idle,
        "Database configured"
    );

    // Everything long-lived watches this flag; it only ever flips to true.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = ConnectionPool::new(connector, PoolConfig::from_database(&config.database));
    let maintenance_task = pool.spawn_maintenance(shutdown_rx.clone());

    let recorder = HealthRecorder::new();
    let monitor = HealthMonitor::new(pool.gauge(), Arc::clone(&recorder), config.health.clone());
    let health_rx = monitor.subscribe();
    let accepting = monitor.accepting_flag();
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let gateway = Gateway::new(pool.clone(), recorder, &config.database);
    let store: Arc<dyn VisitStore> = Arc::new(PgVisitStore::new(gateway));
    spawn_schema_init(Arc::clone(&store), shutdown_rx.clone());

    let (shipper, shipper_task) = Shipper::spawn(&config.tracking)?;
    let visits = VisitService::new(Arc::clone(&store), shipper.clone(), &config.tracking);

    let state = AppState::new(config.clone(), visits, health_rx);
    let app = create_router(state);

    spawn_signal_listener(shutdown_tx.clone());

    start_server(app, &config.http, accepting, shutdown_rx).await?;

    // The listener is gone. Flip the flag ourselves so the background tasks
    // also stop when the server ended for a reason other than a signal.
    let _ = shutdown_tx.send(true);

    shipper.close();
    if tokio::time::timeout(Duration::from_secs(SHIPPER_DRAIN_TIMEOUT_SECS), shipper_task)
        .await
        .is_err()
    {
        tracing::warn!("Shipper queue did not drain in time, some entries were not written");
    }

    pool.close(config.http.shutdown_grace()).await;
    let _ = maintenance_task.await;
    let _ = monitor_task.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Create the visits table in the background, retrying until the database is
/// reachable. The service accepts traffic while this runs; writes that lose
/// the race simply fail and are retried by their clients.
fn spawn_schema_init(store: Arc<dyn VisitStore>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            match store.init_schema().await {
                Ok(()) => {
                    tracing::info!("Database schema ready");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Schema init failed, will retry");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(SCHEMA_INIT_RETRY_SECS)) => {}
                _ = shutdown.changed() => break,
            }
        }
    });
}
