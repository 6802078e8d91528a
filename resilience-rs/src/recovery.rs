//! # Auto Recovery
//!
//! Recovery strategies built on top of the retry handler and the cache:
//! "try, else serve last-known-good", a data-store reconnect probe, and
//! replay of operations queued while the data store was unreachable.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SmartCache;
use crate::remote::DataStoreProbe;
use crate::report::{ErrorReport, ReportSink, Severity};
use crate::retry::RetryHandler;
use crate::store::{load_json, save_json, LocalStore};
use crate::types::Result;

/// A write that could not reach the data store and waits for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: Uuid,
    /// Name the replayer dispatches on
    pub operation: String,
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn new<S: Into<String>>(operation: S, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            payload,
            queued_at: Utc::now(),
        }
    }
}

/// Re-executes a pending operation against the data store
#[async_trait]
pub trait OperationReplayer: Send + Sync {
    async fn replay(&self, operation: &PendingOperation) -> Result<()>;
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub attempted: usize,
    pub replayed: usize,
    /// Operations whose replay was exhausted; they are not retried later
    pub dropped: usize,
}

/// A value and whether it came from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    pub from_cache: bool,
}

/// Collaborators the recovery layer consumes
#[derive(Clone)]
pub struct RecoveryDeps {
    pub reporter: Arc<dyn ReportSink>,
    pub probe: Arc<dyn DataStoreProbe>,
    pub store: Arc<dyn LocalStore>,
    pub replayer: Arc<dyn OperationReplayer>,
}

pub struct AutoRecovery {
    retry: RetryHandler,
    cache: SmartCache<serde_json::Value>,
    deps: RecoveryDeps,
    pending_key: String,
    // Serializes read-modify-write of the pending list
    pending_lock: Mutex<()>,
}

impl AutoRecovery {
    pub fn new(
        retry: RetryHandler,
        cache: SmartCache<serde_json::Value>,
        deps: RecoveryDeps,
        pending_key: impl Into<String>,
    ) -> Self {
        Self {
            retry,
            cache,
            deps,
            pending_key: pending_key.into(),
            pending_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &SmartCache<serde_json::Value> {
        &self.cache
    }

    /// Runs `operation` with retry and caches the result under `cache_key`.
    ///
    /// When every attempt fails, a live cached value is returned instead
    /// (`from_cache: true`). Without one the last operation error is returned.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        cache_key: &str,
        operation: F,
        ttl: Option<Duration>,
    ) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let error = match self.retry.execute(cache_key, operation, None).await {
            Ok(data) => {
                match serde_json::to_value(&data) {
                    Ok(value) => self.cache.set(cache_key, value, ttl),
                    Err(e) => warn!(cache_key = %cache_key, error = %e, "Result is not cacheable"),
                }
                return Ok(Fetched { data, from_cache: false });
            }
            Err(error) => error,
        };

        let Some(cached) = self.cache.get(cache_key) else {
            debug!(cache_key = %cache_key, "No cached fallback available");
            return Err(error);
        };

        let data = match serde_json::from_value::<T>(cached) {
            Ok(data) => data,
            Err(e) => {
                warn!(cache_key = %cache_key, error = %e, "Cached fallback has an unexpected shape");
                return Err(error);
            }
        };

        counter!("recovery.cache_fallbacks", 1);
        self.deps.reporter.track_error(
            ErrorReport::manual(format!("Used cache fallback for '{}'", cache_key), Severity::Medium)
                .data("cache_key", cache_key)
                .data("error", error.to_string()),
        );
        Ok(Fetched { data, from_cache: true })
    }

    /// Probes the data store once; escalation is left to the caller
    pub async fn reconnect_database(&self) -> bool {
        match self.deps.probe.probe().await {
            Ok(()) => {
                info!("Data store connection restored");
                self.deps.reporter.track_error(ErrorReport::manual(
                    "Database connection restored",
                    Severity::Low,
                ));
                true
            }
            Err(e) => {
                debug!(error = %e, "Data store still unreachable");
                false
            }
        }
    }

    /// Appends an operation to the persisted pending list
    pub async fn queue_pending(
        &self,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<PendingOperation> {
        let pending = PendingOperation::new(operation, payload);

        let _guard = self.pending_lock.lock().await;
        let mut list = self.load_pending().await?;
        list.push(pending.clone());
        save_json(self.deps.store.as_ref(), &self.pending_key, &list).await?;

        debug!(operation = %operation, pending = %list.len(), "Operation queued for replay");
        Ok(pending)
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.load_pending().await
    }

    async fn load_pending(&self) -> Result<Vec<PendingOperation>> {
        Ok(load_json(self.deps.store.as_ref(), &self.pending_key)
            .await?
            .unwrap_or_default())
    }

    /// Replays every pending operation once, each through the retry handler.
    ///
    /// Delivery is at-most-once: the processed batch is removed from the
    /// list when the pass completes, including operations whose replay was
    /// exhausted. Operations queued during the pass are kept.
    pub async fn sync_pending_data(&self) -> SyncSummary {
        let batch = match self.pending_operations().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Could not read pending operations");
                return SyncSummary::default();
            }
        };
        if batch.is_empty() {
            return SyncSummary::default();
        }

        info!(pending = %batch.len(), "Replaying pending operations");
        let mut summary = SyncSummary::default();

        for pending in &batch {
            summary.attempted += 1;
            let name = format!("replay {}", pending.operation);
            let replayer = &self.deps.replayer;

            match self.retry.execute(&name, || replayer.replay(pending), None).await {
                Ok(()) => summary.replayed += 1,
                Err(e) => {
                    warn!(
                        operation = %pending.operation,
                        id = %pending.id,
                        error = %e,
                        "Dropping pending operation after failed replay"
                    );
                    summary.dropped += 1;
                }
            }
        }

        let processed: HashSet<Uuid> = batch.iter().map(|p| p.id).collect();
        if let Err(e) = self.forget(&processed).await {
            warn!(error = %e, "Could not clear replayed operations");
        }

        counter!("recovery.replayed", summary.replayed as u64);
        counter!("recovery.dropped", summary.dropped as u64);
        info!(
            replayed = %summary.replayed,
            dropped = %summary.dropped,
            "Pending operation replay finished"
        );
        summary
    }

    async fn forget(&self, processed: &HashSet<Uuid>) -> Result<()> {
        let _guard = self.pending_lock.lock().await;
        let store = self.deps.store.as_ref();

        let remaining: Vec<_> = self
            .load_pending()
            .await?
            .into_iter()
            .filter(|p| !processed.contains(&p.id))
            .collect();

        if remaining.is_empty() {
            store.remove(&self.pending_key).await?;
        } else {
            save_json(store, &self.pending_key, &remaining).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for AutoRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoRecovery")
            .field("retry", &self.retry)
            .field("cached", &self.cache.len())
            .field("pending_key", &self.pending_key)
            .finish()
    }
}
