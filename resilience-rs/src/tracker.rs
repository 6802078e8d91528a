//! # Error Tracker
//!
//! Captures failures, filters and deduplicates them, queues them, and
//! drains the queue to the ingestion endpoint under a circuit breaker.
//!
//! Breaker states:
//! - `Closed`: the queue drains continuously, with doubling backoff
//!   between consecutive send failures.
//! - `Open`: entered after `max_failed_attempts` consecutive failures. The
//!   queue is mirrored to the local store and draining stops until the
//!   periodic breaker check observes that `breaker_reset` has elapsed.
//!
//! The queue is FIFO with head re-queue on failure, so a failing report is
//! always retried before anything queued after it. At most one drain runs
//! at a time; concurrent calls to [`ErrorTracker::process_queue`] return
//! immediately.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use regex::RegexSet;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureEvent, CaptureSink, CaptureSource};
use crate::logging::log_report;
use crate::remote::{Alert, AlertSink, DataStoreProbe, IngestionClient, SessionProvider};
use crate::report::{AdditionalData, ErrorReport, ErrorType, ReportSink, Severity};
use crate::sanitization::sanitize_report;
use crate::settings::TrackerConfig;
use crate::store::{load_json, save_json, LocalStore};
use crate::types::{Error, ErrorKind, Result};

/// Noise that never enters the queue
const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    r"ResizeObserver loop",
    r"(?i)failed to send error report",
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Message patterns dropped before queueing
#[derive(Debug, Clone)]
pub struct IgnoreList {
    patterns: RegexSet,
}

impl IgnoreList {
    /// The built-in patterns plus `extra`
    pub fn new(extra: &[String]) -> Result<Self> {
        let patterns = DEFAULT_IGNORE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned());

        let patterns = RegexSet::new(patterns).map_err(|e| {
            Error::new(ErrorKind::Configuration, format!("Invalid ignore pattern: {}", e))
        })?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, message: &str) -> bool {
        self.patterns.is_match(message)
    }
}

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
        }
    }
}

/// Circuit breaker bookkeeping, owned by the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub reset_at: Option<Instant>,
    pub consecutive_failures: u32,
    /// Delay before the next attempt after a failure
    pub backoff_delay: Duration,
}

impl CircuitBreakerState {
    fn closed(initial_backoff: Duration) -> Self {
        Self {
            is_open: false,
            reset_at: None,
            consecutive_failures: 0,
            backoff_delay: initial_backoff,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

/// Identifies "the same" network failure for rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeduplicationKey {
    /// HTTP status, or `transport` when no response arrived
    pub status_or_kind: String,
    pub resource_url: String,
}

/// Collaborators the tracker consumes
#[derive(Clone)]
pub struct TrackerDeps {
    pub ingestion: Arc<dyn IngestionClient>,
    pub alerts: Arc<dyn AlertSink>,
    pub session: Arc<dyn SessionProvider>,
    pub store: Arc<dyn LocalStore>,
    pub probe: Arc<dyn DataStoreProbe>,
}

/// Outcome of a single send attempt
enum SendOutcome {
    Delivered,
    NoSession,
    Failed,
}

/// Clears the in-flight flag even when a drain is cancelled
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

static INSTANCE_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Held by the live tracker; dropping the tracker releases it
struct InstanceSlot;

impl InstanceSlot {
    fn claim() -> Result<Self> {
        if INSTANCE_CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::Initialization,
                "An ErrorTracker already exists in this process",
            ));
        }
        Ok(Self)
    }
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        INSTANCE_CLAIMED.store(false, Ordering::SeqCst);
    }
}

pub struct ErrorTracker {
    config: TrackerConfig,
    deps: TrackerDeps,
    ignore: IgnoreList,
    queue: Mutex<VecDeque<ErrorReport>>,
    breaker: Mutex<CircuitBreakerState>,
    dedup: Mutex<HashMap<DeduplicationKey, Instant>>,
    draining: AtomicBool,
    wake: Notify,
    sink: CaptureSink,
    events: Mutex<Option<mpsc::UnboundedReceiver<CaptureEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    _slot: Option<InstanceSlot>,
}

impl ErrorTracker {
    /// Builds an idle tracker; [`ErrorTracker::start`] launches the background worker.
    ///
    /// Claims the process-wide tracker slot: a second tracker cannot be
    /// built until the first one is dropped, so a persisted queue is only
    /// ever restored by one owner.
    pub fn new(config: TrackerConfig, deps: TrackerDeps) -> Result<Arc<Self>> {
        config.validate()?;
        let slot = InstanceSlot::claim()?;
        Self::assemble(config, deps, Some(slot))
    }

    /// A tracker outside the process slot, so unit tests can run side by side
    #[cfg(test)]
    pub(crate) fn detached(config: TrackerConfig, deps: TrackerDeps) -> Result<Arc<Self>> {
        Self::assemble(config, deps, None)
    }

    fn assemble(config: TrackerConfig, deps: TrackerDeps, slot: Option<InstanceSlot>) -> Result<Arc<Self>> {
        let ignore = IgnoreList::new(&config.ignore_patterns)?;
        let (sink, events) = CaptureSink::channel();
        let (shutdown_tx, _) = watch::channel(false);
        let breaker = CircuitBreakerState::closed(config.initial_backoff);

        Ok(Arc::new(Self {
            config,
            deps,
            ignore,
            queue: Mutex::new(VecDeque::new()),
            breaker: Mutex::new(breaker),
            dedup: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
            sink,
            events: Mutex::new(Some(events)),
            shutdown_tx,
            worker: Mutex::new(None),
            _slot: slot,
        }))
    }

    /// Restores the persisted queue, then runs the capture loop, the drain
    /// loop, the breaker check, the periodic flush and the data-store self-check
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let events = lock(&self.events).take().ok_or_else(|| {
            Error::new(ErrorKind::Initialization, "Error tracker is already started")
        })?;

        let tracker = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { tracker.run(events, shutdown).await });
        *lock(&self.worker) = Some(handle);

        info!(
            endpoint = %self.deps.ingestion.endpoint(),
            max_failed_attempts = %self.config.max_failed_attempts,
            "Error tracker started"
        );
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CaptureEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let now = Instant::now();
        let mut breaker_check = interval_at(now + self.config.breaker_check, self.config.breaker_check);
        let mut flush = interval_at(now + self.config.flush_interval, self.config.flush_interval);
        let mut self_check = interval_at(
            now + self.config.self_check_interval,
            self.config.self_check_interval,
        );
        for timer in [&mut breaker_check, &mut flush, &mut self_check] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        self.restore_queue().await;
        self.process_queue().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(event) = events.recv() => self.handle_capture(event),
                _ = self.wake.notified() => self.process_queue().await,
                _ = breaker_check.tick() => {
                    self.check_breaker();
                }
                _ = flush.tick() => self.process_queue().await,
                _ = self_check.tick() => self.self_check().await,
            }
        }

        // Events already emitted still make it into the queue
        while let Ok(event) = events.try_recv() {
            self.handle_capture(event);
        }
        debug!("Error tracker worker stopped");
    }

    /// Stops the background worker, makes one bounded flush attempt and
    /// mirrors whatever is left to the local store
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Error tracker worker ended abnormally");
            }
        }

        if timeout(self.config.shutdown_flush_timeout, self.drain(true)).await.is_err() {
            warn!("Final flush timed out");
        }
        self.persist_queue().await;
        info!(remaining = %self.queue_len(), "Error tracker shut down");
    }

    /// Handle for capture sources
    pub fn capture_sink(&self) -> CaptureSink {
        self.sink.clone()
    }

    /// Wires a platform hook into this tracker
    pub fn install_source(&self, source: &dyn CaptureSource) -> Result<()> {
        source.install(self.capture_sink())?;
        debug!(source = ?source.kind(), "Capture source installed");
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Reports in queue order
    pub fn queued_reports(&self) -> Vec<ErrorReport> {
        lock(&self.queue).iter().cloned().collect()
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerState {
        lock(&self.breaker).clone()
    }

    /// Turns a raw capture event into a report, applying the ingestion
    /// exclusion and the network deduplication window
    pub fn handle_capture(&self, event: CaptureEvent) {
        let report = match event {
            CaptureEvent::UncaughtException { message, stack, location } => {
                let mut report = ErrorReport::new(ErrorType::UncaughtException, message, Severity::High);
                report.stack = stack;
                if let Some(location) = location {
                    report = report.data("location", location);
                }
                report
            }
            CaptureEvent::UnhandledRejection { message, task } => {
                let report = ErrorReport::new(ErrorType::UnhandledRejection, message, Severity::High);
                match task {
                    Some(task) => report.data("task", task),
                    None => report,
                }
            }
            CaptureEvent::Network { status, method, url, message } => {
                if self.is_ingestion_call(&url) {
                    return;
                }
                if matches!(status, Some(code) if code < 500) {
                    return;
                }

                let key = DeduplicationKey {
                    status_or_kind: status.map_or_else(|| "transport".to_string(), |s| s.to_string()),
                    resource_url: url.clone(),
                };
                if !self.admit_network_failure(key) {
                    counter!("tracker.reports.deduplicated", 1);
                    return;
                }

                ErrorReport::new(ErrorType::NetworkError, message, Severity::Medium)
                    .data("status", status)
                    .data("method", method)
                    .data("resource", url)
            }
        };

        self.track_error(report);
    }

    fn is_ingestion_call(&self, url: &str) -> bool {
        let endpoint = self.deps.ingestion.endpoint();
        !endpoint.is_empty() && url.starts_with(endpoint)
    }

    /// True when no report for `key` was emitted inside the window; the
    /// timestamp is refreshed only when a report is emitted
    fn admit_network_failure(&self, key: DeduplicationKey) -> bool {
        let now = Instant::now();
        let mut dedup = lock(&self.dedup);

        if let Some(last_seen) = dedup.get(&key) {
            if now.duration_since(*last_seen) < self.config.dedup_window {
                debug!(
                    status = %key.status_or_kind,
                    resource = %key.resource_url,
                    "Suppressing repeated network failure"
                );
                return false;
            }
        }
        dedup.insert(key, now);
        true
    }

    /// Prepends the persisted queue to anything captured since startup
    pub async fn restore_queue(&self) {
        let persisted: Vec<ErrorReport> =
            match load_json(self.deps.store.as_ref(), &self.config.queue_storage_key).await {
                Ok(Some(reports)) => reports,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Could not read persisted error queue");
                    return;
                }
            };

        let mut queue = lock(&self.queue);
        let live: HashSet<_> = queue.iter().map(|r| r.id).collect();
        let restored: Vec<_> = persisted.into_iter().filter(|r| !live.contains(&r.id)).collect();
        let count = restored.len();

        for report in restored.into_iter().rev() {
            queue.push_front(report);
        }
        gauge!("tracker.queue.depth", queue.len() as f64);
        drop(queue);

        if count > 0 {
            info!(restored = %count, "Restored undelivered error reports");
            self.wake.notify_one();
        }
    }

    /// Mirrors the queue to the local slot; failures are logged and swallowed
    pub async fn persist_queue(&self) {
        let snapshot = self.queued_reports();
        let store = self.deps.store.as_ref();
        let key = &self.config.queue_storage_key;

        let result = if snapshot.is_empty() {
            store.remove(key).await
        } else {
            save_json(store, key, &snapshot).await
        };

        if let Err(e) = result {
            warn!(error = %e, queued = %snapshot.len(), "Could not persist error queue");
        }
    }

    /// Drains the queue until it is empty, the breaker opens, or no session
    /// is available. Returns immediately if a drain is already running.
    pub async fn process_queue(&self) {
        self.drain(false).await;
    }

    async fn drain(&self, final_flush: bool) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = DrainGuard(&self.draining);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if lock(&self.breaker).is_open {
                break;
            }
            let Some(report) = lock(&self.queue).pop_front() else {
                break;
            };

            match self.send(&report).await {
                SendOutcome::Delivered => {
                    self.record_success();
                    counter!("tracker.reports.sent", 1);
                    if report.severity.raises_alert() {
                        self.raise_alert(&report).await;
                    }
                }
                SendOutcome::NoSession => {
                    lock(&self.queue).push_front(report);
                    debug!("No authenticated session, pausing error queue");
                    break;
                }
                SendOutcome::Failed => {
                    lock(&self.queue).push_front(report);
                    counter!("tracker.send.failures", 1);

                    if let Some(delay) = self.record_failure() {
                        if final_flush || *shutdown.borrow() {
                            break;
                        }
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                    } else {
                        // Breaker just opened
                        self.persist_queue().await;
                        break;
                    }
                }
            }
        }

        gauge!("tracker.queue.depth", self.queue_len() as f64);
        self.persist_queue().await;
    }

    async fn send(&self, report: &ErrorReport) -> SendOutcome {
        let Some(session) = self.deps.session.current_session().await else {
            return SendOutcome::NoSession;
        };

        let mut report = report.clone();
        if report.user_id.is_none() {
            report.user_id = session.user_id.clone();
        }

        match timeout(
            self.config.send_timeout,
            self.deps.ingestion.send(&report, &session.token),
        )
        .await
        {
            Ok(Ok(())) => SendOutcome::Delivered,
            Ok(Err(e)) => {
                debug!(report_id = %report.id, error = %e, "Error report send failed");
                SendOutcome::Failed
            }
            Err(_) => {
                debug!(
                    report_id = %report.id,
                    timeout_ms = %self.config.send_timeout.as_millis(),
                    "Error report send timed out"
                );
                SendOutcome::Failed
            }
        }
    }

    fn record_success(&self) {
        let mut breaker = lock(&self.breaker);
        breaker.consecutive_failures = 0;
        breaker.backoff_delay = self.config.initial_backoff;
    }

    /// Counts a failure. Returns the delay to wait before the next attempt,
    /// or `None` when this failure opened the breaker.
    fn record_failure(&self) -> Option<Duration> {
        let mut breaker = lock(&self.breaker);
        breaker.consecutive_failures += 1;

        if breaker.consecutive_failures >= self.config.max_failed_attempts {
            breaker.is_open = true;
            breaker.reset_at = Some(Instant::now() + self.config.breaker_reset);
            gauge!("tracker.breaker.open", 1.0);
            warn!(
                failures = %breaker.consecutive_failures,
                reset_secs = %self.config.breaker_reset.as_secs(),
                "Circuit OPEN: error reporting paused"
            );
            return None;
        }

        let delay = breaker.backoff_delay;
        breaker.backoff_delay = (delay * 2).min(self.config.max_backoff);
        Some(delay)
    }

    /// Closes an open breaker once its cooldown has elapsed. Returns true
    /// on the OPEN to CLOSED transition.
    pub fn check_breaker(&self) -> bool {
        let mut breaker = lock(&self.breaker);
        let due = matches!(breaker.reset_at, Some(reset_at) if Instant::now() >= reset_at);
        if !breaker.is_open || !due {
            return false;
        }

        *breaker = CircuitBreakerState::closed(self.config.initial_backoff);
        drop(breaker);

        gauge!("tracker.breaker.open", 0.0);
        info!("Circuit CLOSED: resuming error reporting");
        self.wake.notify_one();
        true
    }

    async fn raise_alert(&self, report: &ErrorReport) {
        let mut title: String = report.message.chars().take(120).collect();
        if title.len() < report.message.len() {
            title.push('…');
        }

        let alert = Alert {
            severity: report.severity,
            title: format!("[{}] {}", report.error_type, title),
            description: report.message.clone(),
            metadata: alert_metadata(report),
        };

        if let Err(e) = self.deps.alerts.raise(alert).await {
            warn!(report_id = %report.id, error = %e, "Could not raise operator alert");
        }
    }

    /// The tracker's own coarse data-store check
    pub async fn self_check(&self) {
        let outcome = timeout(self.config.send_timeout, self.deps.probe.probe()).await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "probe timed out".to_string(),
        };

        error!(error = %failure, "Data store self-check failed");
        self.track_error(
            ErrorReport::new(
                ErrorType::HealthCheckFailed,
                format!("Data store self-check failed: {}", failure),
                Severity::Critical,
            )
            .data("check", "database"),
        );
    }
}

fn alert_metadata(report: &ErrorReport) -> AdditionalData {
    let mut metadata = AdditionalData::new();
    metadata.insert("reportId".to_string(), json!(report.id));
    metadata.insert("errorType".to_string(), json!(report.error_type));
    metadata.insert("url".to_string(), json!(report.url));
    metadata.insert("userId".to_string(), json!(report.user_id));
    metadata
}

impl ReportSink for ErrorTracker {
    fn track_error(&self, report: ErrorReport) {
        if self.ignore.is_ignored(&report.message) {
            counter!("tracker.reports.ignored", 1);
            return;
        }

        let mut report = sanitize_report(report);
        if report.url.is_empty() {
            report.url = self.config.origin_url.clone();
        }
        if report.client_context.is_empty() {
            report.client_context = self.config.client_context.clone();
        }

        log_report(&report);
        counter!("tracker.reports.captured", 1);

        let depth = {
            let mut queue = lock(&self.queue);
            queue.push_back(report);
            queue.len()
        };
        gauge!("tracker.queue.depth", depth as f64);
        self.wake.notify_one();
    }
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("endpoint", &self.deps.ingestion.endpoint())
            .field("queued", &self.queue_len())
            .field("breaker", &self.breaker_snapshot().state())
            .finish()
    }
}
