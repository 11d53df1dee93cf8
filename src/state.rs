//! Shared application state for request handlers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::AppConfig;
use crate::health::HealthSnapshot;
use crate::visits::VisitService;

/// Shared application state, cloneable across handlers via Arc-wrapped and
/// channel-backed fields.
///
/// Holds the configuration, the visit service (store, shipper, and stats
/// cache), and the receiving end of the health monitor's watch channel. The
/// health receiver is the reason the probe handler never blocks: it reads the
/// latest snapshot, it does not compute one.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub visits: VisitService,
    pub health: watch::Receiver<HealthSnapshot>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        visits: VisitService,
        health: watch::Receiver<HealthSnapshot>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            visits,
            health,
        }
    }
}
