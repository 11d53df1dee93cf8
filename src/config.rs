//! Configuration loading and constants.
//!
//! Loads application configuration from a TOML file and defines constants for
//! HTTP cache TTLs, pool retry behavior, shipper limits, logging format, and
//! default paths. `AppConfig` is the root configuration struct containing all
//! settings. A missing config file is not an error: the service is normally
//! deployed as a container configured through environment variables.

use const_format::formatcp;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// HTTP Response Cache Control
// =============================================================================
// These constants control Cache-Control headers for upstream caches (nginx,
// CDNs). All values are in seconds.

/// Static assets (CSS, JS) - long cache with immutable hint
pub const HTTP_CACHE_STATIC_MAX_AGE: u32 = 86400;

pub const CACHE_CONTROL_STATIC: &str =
    formatcp!("public, max-age={}, immutable", HTTP_CACHE_STATIC_MAX_AGE);

/// Health and API responses must always be fresh
pub const CACHE_CONTROL_NONE: &str = "no-store";

// =============================================================================
// Pool Retry and Timeout Constants
// =============================================================================

/// Delay in milliseconds before the first reconnect attempt
pub const POOL_BACKOFF_BASE_MS: u64 = 100;

/// Upper bound in milliseconds for a single reconnect delay
pub const POOL_BACKOFF_CAP_MS: u64 = 5_000;

/// Jitter applied to each reconnect delay, as a fraction of the delay
pub const POOL_BACKOFF_JITTER: f64 = 0.2;

/// Connect attempts per round before the pool gives up and reports the
/// failure to the health monitor
pub const POOL_CONNECT_ATTEMPTS: u32 = 5;

/// Re-probe an idle connection that sat unused longer than this many seconds
pub const POOL_REVALIDATE_IDLE_SECS: u64 = 30;

/// Cadence in seconds of the pool maintenance task (reaping idle connections,
/// reconnecting an empty pool)
pub const POOL_MAINTENANCE_INTERVAL_SECS: u64 = 5;

/// Poll interval in milliseconds while waiting for lent connections to come
/// home during shutdown
pub const POOL_DRAIN_POLL_MS: u64 = 50;

/// Seconds between attempts to create the visits table at startup. Retried
/// in the background so the service can come up before the database does.
pub const SCHEMA_INIT_RETRY_SECS: u64 = 5;

// =============================================================================
// Shipper Constants
// =============================================================================

/// Capacity of the shipper queue; entries beyond this are dropped with a
/// warning rather than blocking the request path
pub const SHIPPER_QUEUE_CAPACITY: usize = 1024;

/// Timeout in seconds for forwarding one entry to the remote ingest endpoint
pub const SHIPPER_FORWARD_TIMEOUT_SECS: u64 = 2;

/// How long shutdown waits for the shipper to flush its queue, in seconds
pub const SHIPPER_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Upper bound on a tracking call's request body; anything larger is treated
/// as an empty payload rather than rejected
pub const TRACKING_MAX_BODY_BYTES: usize = 64 * 1024;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "turnstile=debug,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Environment variable overriding `http.port`
pub const ENV_PORT: &str = "PORT";

/// Environment variable overriding `database.url`
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Environment variable overriding `tracking.forward_token`
pub const ENV_FORWARD_TOKEN: &str = "TURNSTILE_FORWARD_TOKEN";

/// Event name recorded when the client does not name one. Stats count
/// `visit`, `click`, and `exit` events separately.
pub const TRACKING_DEFAULT_EVENT: &str = "visit";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub http: HttpServerConfig,
    /// Database and connection pool settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Health monitor thresholds
    #[serde(default)]
    pub health: HealthConfig,
    /// Visit tracking and log shipping
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "HttpServerConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpServerConfig::default_port")]
    pub port: u16,
    /// Per-request deadline in seconds; requests past it get a timeout response
    #[serde(default = "HttpServerConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// How long in-flight requests may drain after a shutdown signal
    #[serde(default = "HttpServerConfig::default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Directory served for non-API paths
    #[serde(default = "HttpServerConfig::default_static_dir")]
    pub static_dir: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            request_timeout_seconds: Self::default_request_timeout(),
            shutdown_grace_seconds: Self::default_shutdown_grace(),
            static_dir: Self::default_static_dir(),
        }
    }
}

impl HttpServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }
    fn default_port() -> u16 {
        3000
    }
    fn default_request_timeout() -> u64 {
        30
    }
    fn default_shutdown_grace() -> u64 {
        30
    }
    fn default_static_dir() -> String {
        "public".to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Database and connection pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL (also settable via DATABASE_URL)
    #[serde(default)]
    pub url: String,
    /// Maximum open connections, idle and lent combined
    #[serde(default = "DatabaseConfig::default_max_size")]
    pub max_size: usize,
    /// Idle connections kept alive past the inactivity threshold
    #[serde(default = "DatabaseConfig::default_min_idle")]
    pub min_idle: usize,
    /// How long an acquire may wait for a free connection
    #[serde(default = "DatabaseConfig::default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
    /// Deadline for a single query on the gateway
    #[serde(default = "DatabaseConfig::default_query_timeout")]
    pub query_timeout_seconds: u64,
    /// Idle connections unused this long are closed by maintenance
    #[serde(default = "DatabaseConfig::default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_size: Self::default_max_size(),
            min_idle: Self::default_min_idle(),
            acquire_timeout_seconds: Self::default_acquire_timeout(),
            query_timeout_seconds: Self::default_query_timeout(),
            idle_timeout_seconds: Self::default_idle_timeout(),
        }
    }
}

impl DatabaseConfig {
    fn default_max_size() -> usize {
        8
    }
    fn default_min_idle() -> usize {
        1
    }
    fn default_acquire_timeout() -> u64 {
        5
    }
    fn default_query_timeout() -> u64 {
        10
    }
    fn default_idle_timeout() -> u64 {
        300
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

/// Health monitor thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Seconds between monitor evaluations; status is truthful within one tick
    #[serde(default = "HealthConfig::default_check_interval")]
    pub check_interval_seconds: u64,
    /// How long the pool may be without any valid connection before the
    /// service reports unhealthy
    #[serde(default = "HealthConfig::default_unhealthy_grace")]
    pub unhealthy_grace_seconds: u64,
    /// Fraction of gateway calls in one interval that must fail with
    /// connection loss or timeout to mark the service degraded
    #[serde(default = "HealthConfig::default_degraded_failure_ratio")]
    pub degraded_failure_ratio: f64,
    /// Consecutive clean intervals required to recover from degraded
    #[serde(default = "HealthConfig::default_recovery_intervals")]
    pub recovery_intervals: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: Self::default_check_interval(),
            unhealthy_grace_seconds: Self::default_unhealthy_grace(),
            degraded_failure_ratio: Self::default_degraded_failure_ratio(),
            recovery_intervals: Self::default_recovery_intervals(),
        }
    }
}

impl HealthConfig {
    fn default_check_interval() -> u64 {
        5
    }
    fn default_unhealthy_grace() -> u64 {
        30
    }
    fn default_degraded_failure_ratio() -> f64 {
        0.5
    }
    fn default_recovery_intervals() -> u32 {
        2
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn unhealthy_grace(&self) -> Duration {
        Duration::from_secs(self.unhealthy_grace_seconds)
    }
}

/// Visit tracking and log shipping
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// File that receives one JSON line per recorded visit
    #[serde(default = "TrackingConfig::default_log_path")]
    pub log_path: String,
    /// Optional remote ingest endpoint; entries are POSTed there as JSON
    pub forward_url: Option<String>,
    /// Bearer token for the ingest endpoint (also settable via
    /// TURNSTILE_FORWARD_TOKEN)
    pub forward_token: Option<String>,
    /// TTL for the cached /api/stats aggregate
    #[serde(default = "TrackingConfig::default_stats_cache_ttl")]
    pub stats_cache_ttl_seconds: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            log_path: Self::default_log_path(),
            forward_url: None,
            forward_token: None,
            stats_cache_ttl_seconds: Self::default_stats_cache_ttl(),
        }
    }
}

impl TrackingConfig {
    fn default_log_path() -> String {
        "logs/visits.log".to_string()
    }
    fn default_stats_cache_ttl() -> u64 {
        5
    }

    pub fn stats_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_cache_ttl_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    /// Load configuration from `path`, falling back to defaults if the file
    /// does not exist, then apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config: AppConfig = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => return Err(ConfigError::Io(e)),
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var(ENV_PORT) {
            self.http.port = port.parse().map_err(|_| {
                ConfigError::Validation(format!("{ENV_PORT} must be a port number, got {port:?}"))
            })?;
        }
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Ok(token) = std::env::var(ENV_FORWARD_TOKEN) {
            self.tracking.forward_token = Some(token);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Validation(format!(
                "No database configured. Set database.url or the {ENV_DATABASE_URL} environment variable"
            )));
        }
        if self.database.max_size == 0 {
            return Err(ConfigError::Validation(
                "database.max_size must be at least 1".to_string(),
            ));
        }
        if self.database.min_idle > self.database.max_size {
            return Err(ConfigError::Validation(format!(
                "database.min_idle ({}) cannot exceed database.max_size ({})",
                self.database.min_idle, self.database.max_size
            )));
        }
        if !(self.health.degraded_failure_ratio > 0.0 && self.health.degraded_failure_ratio <= 1.0)
        {
            return Err(ConfigError::Validation(
                "health.degraded_failure_ratio must be within (0, 1]".to_string(),
            ));
        }
        if self.health.check_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "health.check_interval_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
