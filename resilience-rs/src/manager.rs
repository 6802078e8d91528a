//! # Self-Healing Manager
//!
//! Composition root of the pipeline. Builds the tracker, the retry handler,
//! the recovery layer and the health monitor around one set of
//! collaborators, and exposes [`SelfHealingManager::fetch`] to the host.
//!
//! At most one manager exists per process: its tracker holds the
//! process-wide slot, so a second construction fails until the first
//! manager is dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::cache::SmartCache;
use crate::health::{Clock, HealthDeps, HealthMonitor, HealthRecordSink, NetworkStatus};
use crate::recovery::{AutoRecovery, Fetched, OperationReplayer, RecoveryDeps};
use crate::remote::{AlertSink, DataStoreProbe, IngestionClient, SessionProvider};
use crate::report::ReportSink;
use crate::retry::RetryHandler;
use crate::settings::ResilienceConfig;
use crate::store::LocalStore;
use crate::tracker::{ErrorTracker, TrackerDeps};
use crate::types::Result;

/// Every external collaborator of the pipeline
#[derive(Clone)]
pub struct ManagerDeps {
    pub ingestion: Arc<dyn IngestionClient>,
    pub alerts: Arc<dyn AlertSink>,
    pub session: Arc<dyn SessionProvider>,
    pub store: Arc<dyn LocalStore>,
    pub probe: Arc<dyn DataStoreProbe>,
    pub replayer: Arc<dyn OperationReplayer>,
    pub health_records: Arc<dyn HealthRecordSink>,
    pub network: NetworkStatus,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Cache lifetime of a fresh result; the configured default when unset
    pub ttl: Option<Duration>,
}

pub struct SelfHealingManager {
    tracker: Arc<ErrorTracker>,
    retry: RetryHandler,
    recovery: Arc<AutoRecovery>,
    health: Arc<HealthMonitor>,
}

impl SelfHealingManager {
    pub fn new(config: &ResilienceConfig, deps: ManagerDeps) -> Result<Self> {
        config.validate()?;

        let tracker = ErrorTracker::new(
            config.tracker.clone(),
            TrackerDeps {
                ingestion: deps.ingestion,
                alerts: Arc::clone(&deps.alerts),
                session: deps.session,
                store: Arc::clone(&deps.store),
                probe: Arc::clone(&deps.probe),
            },
        )?;
        let reporter: Arc<dyn ReportSink> = tracker.clone();

        let retry = RetryHandler::new(Arc::clone(&reporter), config.retry.clone());
        let recovery = Arc::new(AutoRecovery::new(
            retry.clone(),
            SmartCache::new(config.cache.default_ttl),
            RecoveryDeps {
                reporter,
                probe: Arc::clone(&deps.probe),
                store: Arc::clone(&deps.store),
                replayer: deps.replayer,
            },
            config.health.pending_operations_key.clone(),
        ));

        let health = HealthMonitor::new(
            config.health.clone(),
            HealthDeps {
                probe: deps.probe,
                store: deps.store,
                records: deps.health_records,
                alerts: deps.alerts,
                network: deps.network,
                clock: deps.clock,
            },
            Arc::clone(&recovery),
        );

        Ok(Self {
            tracker,
            retry,
            recovery,
            health,
        })
    }

    /// Starts the tracker worker and the health monitor
    pub fn start(&self) -> Result<()> {
        self.tracker.start()?;
        self.health.start()?;
        info!("Self-healing manager started");
        Ok(())
    }

    /// Stops the health monitor, then flushes the tracker once
    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.tracker.shutdown().await;
        info!("Self-healing manager stopped");
    }

    /// Resilient read: retry, cache the result, fall back to the cache
    pub async fn fetch<T, F, Fut>(&self, key: &str, operation: F, options: FetchOptions) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.recovery.execute_with_fallback(key, operation, options.ttl).await
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    pub fn recovery(&self) -> &Arc<AutoRecovery> {
        &self.recovery
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}

impl fmt::Debug for SelfHealingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealingManager")
            .field("tracker", &self.tracker)
            .field("health", &self.health)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::manager_deps;
    use crate::types::ErrorKind;

    // The only test in this binary that constructs managers
    #[tokio::test(start_paused = true)]
    async fn test_one_manager_per_process() {
        let config = ResilienceConfig::default();

        let first = SelfHealingManager::new(&config, manager_deps()).unwrap();
        let second = SelfHealingManager::new(&config, manager_deps());
        assert_eq!(second.unwrap_err().kind, ErrorKind::Initialization);

        let fetched = first
            .fetch("settings", || async { Ok(vec![1, 2]) }, FetchOptions::default())
            .await
            .unwrap();
        assert!(!fetched.from_cache);
        assert!(first.recovery().cache().has("settings"));

        drop(first);
        assert!(SelfHealingManager::new(&config, manager_deps()).is_ok());

        // Rejected before the slot is claimed
        let mut broken = ResilienceConfig::default();
        broken.tracker.self_check_interval = Duration::ZERO;
        let err = SelfHealingManager::new(&broken, manager_deps()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(SelfHealingManager::new(&config, manager_deps()).is_ok());
    }
}
