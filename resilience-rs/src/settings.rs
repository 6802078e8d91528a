//! # Pipeline Configuration
//!
//! Every knob of the pipeline with its production default. Sources, in
//! increasing precedence: built-in defaults, an optional TOML file, then
//! `RESILIENCE__SECTION__KEY` environment variables (a `.env` file is
//! honoured).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LoggingConfig;
use crate::retry::RetryConfig;
use crate::types::{Error, ErrorKind, Result};

/// Durations are written as integer milliseconds in configuration sources.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Error tracker and circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive send failures that open the breaker
    pub max_failed_attempts: u32,
    /// How long the breaker stays open
    #[serde(with = "millis", rename = "breaker_reset_ms")]
    pub breaker_reset: Duration,
    /// Cadence of the open-breaker check
    #[serde(with = "millis", rename = "breaker_check_ms")]
    pub breaker_check: Duration,
    #[serde(with = "millis", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "millis", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    /// Hard limit on one ingestion call
    #[serde(with = "millis", rename = "send_timeout_ms")]
    pub send_timeout: Duration,
    /// Repeat network failures inside this window are suppressed
    #[serde(with = "millis", rename = "dedup_window_ms")]
    pub dedup_window: Duration,
    /// Cadence of the tracker's own data-store self-check
    #[serde(with = "millis", rename = "self_check_interval_ms")]
    pub self_check_interval: Duration,
    /// Cadence of the periodic queue flush
    #[serde(with = "millis", rename = "flush_interval_ms")]
    pub flush_interval: Duration,
    /// Upper bound on the flush attempted at shutdown
    #[serde(with = "millis", rename = "shutdown_flush_timeout_ms")]
    pub shutdown_flush_timeout: Duration,
    /// Key of the local slot mirroring the undelivered queue
    pub queue_storage_key: String,
    /// Default origin context stamped on reports that carry none
    pub origin_url: String,
    /// Default client identification stamped on reports that carry none
    pub client_context: String,
    /// Extra message patterns dropped before queueing
    pub ignore_patterns: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            breaker_reset: Duration::from_secs(60),
            breaker_check: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            dedup_window: Duration::from_secs(10 * 60),
            self_check_interval: Duration::from_secs(5 * 60),
            flush_interval: Duration::from_secs(30),
            shutdown_flush_timeout: Duration::from_secs(10),
            queue_storage_key: "error_tracker.queue".to_string(),
            origin_url: "app://client".to_string(),
            client_context: format!("resilience-rs/{}", env!("CARGO_PKG_VERSION")),
            ignore_patterns: Vec::new(),
        }
    }
}

impl TrackerConfig {
    /// Rejects settings the background worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(Error::new(ErrorKind::Configuration, message));

        if self.max_failed_attempts == 0 {
            return invalid("tracker.max_failed_attempts must be at least 1");
        }
        if self.initial_backoff > self.max_backoff {
            return invalid("tracker.initial_backoff_ms must not exceed tracker.max_backoff_ms");
        }
        if self.breaker_check.is_zero() || self.flush_interval.is_zero() || self.self_check_interval.is_zero() {
            return invalid("tracker intervals must be non-zero");
        }
        if self.send_timeout.is_zero() {
            return invalid("tracker.send_timeout_ms must be non-zero");
        }
        if self.breaker_reset.is_zero() {
            return invalid("tracker.breaker_reset_ms must be non-zero");
        }
        Ok(())
    }
}

/// Smart cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "millis", rename = "default_ttl_ms")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "millis", rename = "check_interval_ms")]
    pub check_interval: Duration,
    /// Maximum health records persisted per local calendar day
    pub daily_record_cap: u32,
    /// A steady state is recorded at least this often
    #[serde(with = "millis", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
    /// Local slot used by the storage read/write probe
    pub storage_probe_key: String,
    /// Local slot holding operations queued while offline
    pub pending_operations_key: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5 * 60),
            daily_record_cap: 50,
            heartbeat_interval: Duration::from_secs(60 * 60),
            storage_probe_key: "health.probe".to_string(),
            pending_operations_key: "pending_operations".to_string(),
        }
    }
}

/// Remote collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Ingestion endpoint accepting one report per call
    pub ingestion_url: String,
    /// Alert side-channel
    pub alerts_url: String,
    /// Health record sink
    pub health_records_url: String,
    /// Cheap, side-effect-free read against the primary data store
    pub data_store_probe_url: String,
    /// Pending operations are replayed as `POST {replay_base_url}/{operation}`
    pub replay_base_url: String,
    /// Project key sent alongside the session credential
    pub api_key: Option<String>,
    #[serde(with = "millis", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            ingestion_url: "http://localhost:54321/functions/v1/error-reports".to_string(),
            alerts_url: "http://localhost:54321/functions/v1/alerts".to_string(),
            health_records_url: "http://localhost:54321/rest/v1/health_records".to_string(),
            data_store_probe_url: "http://localhost:54321/rest/v1/settings?select=id&limit=1".to_string(),
            replay_base_url: "http://localhost:54321/rest/v1/rpc".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Local persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/resilience".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub tracker: TrackerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub endpoints: EndpointsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    /// Address for the Prometheus scrape endpoint; metrics stay in-process when unset
    pub metrics_listen_addr: Option<String>,
}

impl ResilienceConfig {
    /// Loads configuration from `path` (or `config/resilience.toml` when
    /// present) and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("config/resilience").required(false),
        };

        let cfg = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("RESILIENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded = Self::try_from(cfg)?;
        loaded.validate()?;
        debug!(data_dir = %loaded.storage.data_dir, "Configuration loaded");
        Ok(loaded)
    }

    /// Rejects settings that would stall or spin the pipeline
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(Error::new(ErrorKind::Configuration, message));

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be >= 1");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        self.tracker.validate()?;
        if self.health.check_interval.is_zero() {
            return invalid("health.check_interval_ms must be non-zero");
        }
        if self.health.daily_record_cap == 0 {
            return invalid("health.daily_record_cap must be at least 1");
        }
        Ok(())
    }
}

impl TryFrom<config::Config> for ResilienceConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        cfg.try_deserialize()
    }
}
