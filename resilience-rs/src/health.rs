//! # Health Monitor
//!
//! Periodic probes of the data store, the local store and the network,
//! with a rate-limited health record trail, transition alerts and
//! automatic recovery actions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::recovery::AutoRecovery;
use crate::remote::{Alert, AlertSink, DataStoreProbe};
use crate::report::{AdditionalData, Severity};
use crate::settings::HealthConfig;
use crate::store::LocalStore;
use crate::types::{Error, ErrorKind, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Outcome of the three probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub database: bool,
    pub storage: bool,
    pub network: bool,
}

impl HealthCheckResult {
    pub fn status(&self) -> HealthStatus {
        if self.database && self.storage && self.network {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn failed_checks(&self) -> Vec<&'static str> {
        [
            (self.database, "database"),
            (self.storage, "storage"),
            (self.network, "network"),
        ]
        .into_iter()
        .filter(|(passed, _)| !passed)
        .map(|(_, name)| name)
        .collect()
    }
}

/// A persisted health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub detail: HealthCheckResult,
}

#[async_trait]
pub trait HealthRecordSink: Send + Sync {
    async fn record(&self, record: &HealthRecord) -> Result<()>;
}

/// Wall clock used for the daily cap and the heartbeat
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Host-maintained connectivity flag
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Decides which checks are persisted.
///
/// A record is written iff fewer than `daily_cap` were written today and
/// the status changed, is degraded, or the heartbeat interval has passed.
#[derive(Debug, Clone)]
pub struct RecordingPolicy {
    daily_cap: u32,
    heartbeat: Duration,
    last_status: Option<HealthStatus>,
    last_record: Option<DateTime<Local>>,
    day: Option<NaiveDate>,
    today_count: u32,
}

impl RecordingPolicy {
    pub fn new(daily_cap: u32, heartbeat: Duration) -> Self {
        Self {
            daily_cap,
            heartbeat,
            last_status: None,
            last_record: None,
            day: None,
            today_count: 0,
        }
    }

    pub fn should_record(&mut self, status: HealthStatus, now: DateTime<Local>) -> bool {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.today_count = 0;
        }

        if self.today_count >= self.daily_cap {
            return false;
        }

        let changed = self.last_status != Some(status);
        let heartbeat_due = match self.last_record {
            Some(last) => (now - last).to_std().map_or(false, |elapsed| elapsed > self.heartbeat),
            None => true,
        };

        changed || status == HealthStatus::Degraded || heartbeat_due
    }

    /// Commits a successful write
    pub fn mark_recorded(&mut self, status: HealthStatus, now: DateTime<Local>) {
        self.today_count += 1;
        self.last_status = Some(status);
        self.last_record = Some(now);
    }

    pub fn today_count(&self) -> u32 {
        self.today_count
    }
}

/// Collaborators the monitor consumes
#[derive(Clone)]
pub struct HealthDeps {
    pub probe: Arc<dyn DataStoreProbe>,
    pub store: Arc<dyn LocalStore>,
    pub records: Arc<dyn HealthRecordSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub network: NetworkStatus,
    pub clock: Arc<dyn Clock>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    deps: HealthDeps,
    recovery: Arc<AutoRecovery>,
    policy: Mutex<RecordingPolicy>,
    alerted_status: Mutex<HealthStatus>,
    last_result: Mutex<Option<HealthCheckResult>>,
    resync_armed: Arc<AtomicBool>,
    check_lock: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, deps: HealthDeps, recovery: Arc<AutoRecovery>) -> Arc<Self> {
        let policy = RecordingPolicy::new(config.daily_record_cap, config.heartbeat_interval);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            deps,
            recovery,
            policy: Mutex::new(policy),
            alerted_status: Mutex::new(HealthStatus::Healthy),
            last_result: Mutex::new(None),
            resync_armed: Arc::new(AtomicBool::new(false)),
            check_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    /// Runs one check immediately, then every `check_interval`
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(Error::new(ErrorKind::Initialization, "Health monitor is already started"));
        }

        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *worker = Some(tokio::spawn(async move {
            let mut ticker = interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        monitor.run_check().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        }));

        info!(
            interval_secs = %self.config.check_interval.as_secs(),
            "Health monitor started"
        );
        Ok(())
    }

    /// Stops the periodic check and any armed network-restored hook
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Health monitor worker ended abnormally");
            }
        }
    }

    pub fn last_result(&self) -> Option<HealthCheckResult> {
        *lock(&self.last_result)
    }

    /// Probes, records, alerts and triggers recovery
    pub async fn run_check(&self) -> HealthCheckResult {
        let _serial = self.check_lock.lock().await;

        let (database, storage) = tokio::join!(self.check_database(), self.check_storage());
        let result = HealthCheckResult {
            database,
            storage,
            network: self.deps.network.is_online(),
        };
        let status = result.status();

        *lock(&self.last_result) = Some(result);
        gauge!("health.degraded", if status == HealthStatus::Degraded { 1.0 } else { 0.0 });
        debug!(
            status = %status,
            database = %result.database,
            storage = %result.storage,
            network = %result.network,
            "Health check completed"
        );

        self.record(result).await;
        self.alert_on_transition(result).await;

        if status == HealthStatus::Degraded {
            if !result.database {
                self.recovery.reconnect_database().await;
            }
            if !result.network {
                self.arm_resync();
            }
        }

        result
    }

    async fn check_database(&self) -> bool {
        matches!(timeout(PROBE_TIMEOUT, self.deps.probe.probe()).await, Ok(Ok(())))
    }

    async fn check_storage(&self) -> bool {
        let store = self.deps.store.as_ref();
        let key = &self.config.storage_probe_key;
        let marker = Utc::now().to_rfc3339();

        let round_trip = async {
            store.set(key, &marker).await?;
            let read = store.get(key).await?;
            store.remove(key).await?;
            Ok::<_, crate::store::StoreError>(read.as_deref() == Some(marker.as_str()))
        };

        match round_trip.await {
            Ok(intact) => intact,
            Err(e) => {
                debug!(error = %e, "Storage probe failed");
                false
            }
        }
    }

    async fn record(&self, result: HealthCheckResult) {
        let now = self.deps.clock.now();
        let status = result.status();

        if !lock(&self.policy).should_record(status, now) {
            return;
        }

        let record = HealthRecord {
            status,
            timestamp: now.with_timezone(&Utc),
            detail: result,
        };

        match self.deps.records.record(&record).await {
            Ok(()) => {
                lock(&self.policy).mark_recorded(status, now);
                counter!("health.records", 1);
            }
            Err(e) => warn!(error = %e, status = %status, "Could not persist health record"),
        }
    }

    async fn alert_on_transition(&self, result: HealthCheckResult) {
        let status = result.status();
        let previous = std::mem::replace(&mut *lock(&self.alerted_status), status);
        if previous != HealthStatus::Healthy || status != HealthStatus::Degraded {
            return;
        }

        let failed = result.failed_checks();
        warn!(failed = ?failed, "Health degraded");

        let mut metadata = AdditionalData::new();
        metadata.insert("failedChecks".to_string(), json!(failed));

        let alert = Alert {
            severity: Severity::High,
            title: "Client health degraded".to_string(),
            description: format!("Failed health checks: {}", failed.join(", ")),
            metadata,
        };
        if let Err(e) = self.deps.alerts.raise(alert).await {
            warn!(error = %e, "Could not raise health alert");
        }
    }

    /// Replays pending operations once the network is back; a no-op while
    /// a hook is already armed
    fn arm_resync(&self) {
        if self.resync_armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut online = self.deps.network.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let recovery = Arc::clone(&self.recovery);
        let armed = Arc::clone(&self.resync_armed);

        debug!("Waiting for network to replay pending operations");
        tokio::spawn(async move {
            let restored = tokio::select! {
                restored = async { online.wait_for(|up| *up).await.is_ok() } => restored,
                _ = shutdown.changed() => false,
            };
            armed.store(false, Ordering::Release);

            if restored {
                info!("Network restored, replaying pending operations");
                recovery.sync_pending_data().await;
            }
        });
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("last_result", &self.last_result())
            .finish()
    }
}
