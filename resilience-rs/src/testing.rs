//! In-memory fakes for the remote collaborators

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use tokio::time::Instant;

use crate::health::{Clock, HealthRecord, HealthRecordSink, NetworkStatus};
use crate::manager::ManagerDeps;
use crate::recovery::{OperationReplayer, PendingOperation};
use crate::remote::{Alert, AlertSink, DataStoreProbe, IngestionClient, Session, SessionProvider};
use crate::report::{ErrorReport, ReportSink};
use crate::store::MemoryStore;
use crate::tracker::TrackerDeps;
use crate::types::{Error, ErrorKind, Result};

pub const INGESTION_URL: &str = "https://ingest.test/functions/v1/error-reports";

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl ReportSink for RecordingSink {
    fn track_error(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    Fail,
    Hang,
}

struct IngestionState {
    mode: Mutex<Mode>,
    latency: Mutex<Duration>,
    delivered: Mutex<Vec<ErrorReport>>,
    call_times: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Ingestion endpoint whose behaviour the test flips at will
#[derive(Clone)]
pub struct ScriptedIngestion {
    state: Arc<IngestionState>,
}

impl ScriptedIngestion {
    fn with_mode(mode: Mode) -> Self {
        Self {
            state: Arc::new(IngestionState {
                mode: Mutex::new(mode),
                latency: Mutex::new(Duration::ZERO),
                delivered: Mutex::new(Vec::new()),
                call_times: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_mode(Mode::Succeed)
    }

    pub fn failing() -> Self {
        Self::with_mode(Mode::Fail)
    }

    /// Never answers
    pub fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        *self.state.mode.lock().unwrap() = if failing { Mode::Fail } else { Mode::Succeed };
    }

    pub fn delivered(&self) -> Vec<ErrorReport> {
        self.state.delivered.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.state.call_times.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.state.call_times.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestionClient for ScriptedIngestion {
    async fn send(&self, report: &ErrorReport, _credential: &str) -> Result<()> {
        let state = &self.state;
        state.call_times.lock().unwrap().push(Instant::now());
        let now_in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let latency = *state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mode = *state.mode.lock().unwrap();
        let outcome = match mode {
            Mode::Succeed => {
                state.delivered.lock().unwrap().push(report.clone());
                Ok(())
            }
            Mode::Fail => Err(Error::new(ErrorKind::Communication, "ingestion returned 503").transient()),
            Mode::Hang => std::future::pending().await,
        };
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn endpoint(&self) -> &str {
        INGESTION_URL
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: Alert) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Communication, "alerts unavailable"));
        }
        self.alerts.lock().unwrap().push(alert);
        Ok(())
    }
}

pub struct ScriptedProbe {
    healthy: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataStoreProbe for ScriptedProbe {
    async fn probe(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Communication, "data store unreachable"))
        }
    }
}

pub struct TestSession(Option<Session>);

impl TestSession {
    pub fn signed_in() -> Self {
        Self(Some(Session {
            token: "test-token".to_string(),
            user_id: Some("user-1".to_string()),
        }))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SessionProvider for TestSession {
    async fn current_session(&self) -> Option<Session> {
        self.0.clone()
    }
}

/// Replays everything except operations marked as failing
#[derive(Default)]
pub struct ScriptedReplayer {
    failing: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedReplayer {
    pub fn fail_operation(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    pub fn attempts(&self, operation: &str) -> u32 {
        self.attempts.lock().unwrap().get(operation).copied().unwrap_or(0)
    }
}

#[async_trait]
impl OperationReplayer for ScriptedReplayer {
    async fn replay(&self, operation: &PendingOperation) -> Result<()> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(operation.operation.clone())
            .or_default() += 1;

        if self.failing.lock().unwrap().contains(&operation.operation) {
            return Err(Error::operation(format!("{} rejected", operation.operation)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHealthSink {
    records: Mutex<Vec<HealthRecord>>,
}

impl RecordingHealthSink {
    pub fn records(&self) -> Vec<HealthRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthRecordSink for RecordingHealthSink {
    async fn record(&self, record: &HealthRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Wall clock the test moves by hand
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn at(year: i32, month: u32, day: u32, hour: u32) -> Self {
        Self {
            now: Mutex::new(Local.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

/// Signed-in session, healthy probe, empty memory store
pub fn deps_with(ingestion: ScriptedIngestion) -> TrackerDeps {
    TrackerDeps {
        ingestion: Arc::new(ingestion),
        alerts: Arc::new(RecordingAlerts::default()),
        session: Arc::new(TestSession::signed_in()),
        store: Arc::new(MemoryStore::new()),
        probe: Arc::new(ScriptedProbe::new(true)),
    }
}

pub fn manager_deps() -> ManagerDeps {
    ManagerDeps {
        ingestion: Arc::new(ScriptedIngestion::succeeding()),
        alerts: Arc::new(RecordingAlerts::default()),
        session: Arc::new(TestSession::signed_in()),
        store: Arc::new(MemoryStore::new()),
        probe: Arc::new(ScriptedProbe::new(true)),
        replayer: Arc::new(ScriptedReplayer::default()),
        health_records: Arc::new(RecordingHealthSink::default()),
        network: NetworkStatus::default(),
        clock: Arc::new(ManualClock::at(2024, 3, 5, 9)),
    }
}
