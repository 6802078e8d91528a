//! # Resilience Pipeline
//!
//! Client-side resilience and error telemetry for a long-lived process:
//! failures are captured, deduplicated and queued, then shipped to a remote
//! ingestion endpoint under a circuit breaker with exponential backoff.
//! Undelivered reports survive restarts, and a periodic health monitor
//! drives retry, cache fallback and offline replay.
//!
//! ## Components
//!
//! - [`RetryHandler`]: exponential-backoff retry of one operation
//! - [`SmartCache`]: TTL cache with lazy expiry
//! - [`ErrorTracker`]: capture, dedup, queue, breaker, drain
//! - [`AutoRecovery`]: cache fallback, reconnect probe, pending replay
//! - [`HealthMonitor`]: probes, rate-limited records, transition alerts
//! - [`SelfHealingManager`]: composition root and `fetch` entry point
//!

pub mod cache;
pub mod capture;
pub mod health;
pub mod http;
pub mod logging;
pub mod manager;
pub mod recovery;
pub mod remote;
pub mod report;
pub mod retry;
pub mod sanitization;
pub mod settings;
pub mod store;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use cache::SmartCache;
pub use capture::{CaptureEvent, CaptureKind, CaptureSink, CaptureSource, PanicHook, TaskWatcher};
pub use health::{HealthCheckResult, HealthMonitor, HealthRecord, HealthStatus, NetworkStatus};
pub use logging::{init_logging, LoggingConfig};
pub use manager::{FetchOptions, ManagerDeps, SelfHealingManager};
pub use recovery::{AutoRecovery, Fetched, OperationReplayer, PendingOperation, SyncSummary};
pub use report::{AdditionalData, ErrorReport, ErrorType, ReportSink, Severity};
pub use retry::{RetryConfig, RetryHandler};
pub use settings::ResilienceConfig;
pub use store::{FileStore, LocalStore, MemoryStore};
pub use tracker::{CircuitBreakerState, CircuitState, ErrorTracker};
pub use types::{Error, ErrorKind, Result};

/// Initializes logging with default settings
pub fn init() -> Result<()> {
    init_logging(None)
}

/// Initializes logging from a `config` source, falling back to defaults
/// for a missing or malformed `logging` section
pub fn init_with_config(config: config::Config) -> Result<()> {
    let log_config = LoggingConfig::try_from(config).ok();
    init_logging(log_config)
}
