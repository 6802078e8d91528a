#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use resilience::health::{HealthRecordSink, SystemClock};
use resilience::remote::{Alert, AlertSink, DataStoreProbe, IngestionClient, Session, SessionProvider, StaticSession};
use resilience::tracker::TrackerDeps;
use resilience::{
    ErrorKind, ErrorReport, HealthRecord, LocalStore, ManagerDeps, NetworkStatus, OperationReplayer,
    PendingOperation,
};

pub const INGESTION_URL: &str = "https://ingest.test/functions/v1/error-reports";

#[derive(Default)]
pub struct FakeIngestion {
    failing: AtomicBool,
    calls: AtomicUsize,
    delivered: Mutex<Vec<ErrorReport>>,
}

impl FakeIngestion {
    pub fn failing() -> Arc<Self> {
        let ingestion = Self::default();
        ingestion.failing.store(true, Ordering::SeqCst);
        Arc::new(ingestion)
    }

    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<ErrorReport> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl IngestionClient for FakeIngestion {
    async fn send(&self, report: &ErrorReport, _credential: &str) -> resilience::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(resilience::Error::new(ErrorKind::Communication, "ingestion returned 503"));
        }
        self.delivered.lock().unwrap().push(report.clone());
        Ok(())
    }

    fn endpoint(&self) -> &str {
        INGESTION_URL
    }
}

#[derive(Default)]
pub struct FakeAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl FakeAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for FakeAlerts {
    async fn raise(&self, alert: Alert) -> resilience::Result<()> {
        self.alerts.lock().unwrap().push(alert);
        Ok(())
    }
}

pub struct FakeProbe(pub AtomicBool);

impl FakeProbe {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }
}

#[async_trait]
impl DataStoreProbe for FakeProbe {
    async fn probe(&self) -> resilience::Result<()> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(resilience::Error::new(ErrorKind::Communication, "data store unreachable"))
        }
    }
}

#[derive(Default)]
pub struct FakeHealthRecords {
    records: Mutex<Vec<HealthRecord>>,
}

impl FakeHealthRecords {
    pub fn records(&self) -> Vec<HealthRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthRecordSink for FakeHealthRecords {
    async fn record(&self, record: &HealthRecord) -> resilience::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeReplayer {
    replayed: Mutex<Vec<String>>,
}

impl FakeReplayer {
    pub fn replayed(&self) -> Vec<String> {
        self.replayed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperationReplayer for FakeReplayer {
    async fn replay(&self, operation: &PendingOperation) -> resilience::Result<()> {
        self.replayed.lock().unwrap().push(operation.operation.clone());
        Ok(())
    }
}

pub fn session() -> Arc<dyn SessionProvider> {
    Arc::new(StaticSession(Session {
        token: "integration-token".to_string(),
        user_id: Some("operator-7".to_string()),
    }))
}

pub fn tracker_deps(ingestion: Arc<FakeIngestion>, store: Arc<dyn LocalStore>) -> TrackerDeps {
    TrackerDeps {
        ingestion,
        alerts: Arc::new(FakeAlerts::default()),
        session: session(),
        store,
        probe: FakeProbe::healthy(),
    }
}

pub struct ManagerFakes {
    pub ingestion: Arc<FakeIngestion>,
    pub alerts: Arc<FakeAlerts>,
    pub records: Arc<FakeHealthRecords>,
    pub replayer: Arc<FakeReplayer>,
    pub network: NetworkStatus,
}

pub fn manager_deps(store: Arc<dyn LocalStore>) -> (ManagerDeps, ManagerFakes) {
    let fakes = ManagerFakes {
        ingestion: FakeIngestion::succeeding(),
        alerts: Arc::new(FakeAlerts::default()),
        records: Arc::new(FakeHealthRecords::default()),
        replayer: Arc::new(FakeReplayer::default()),
        network: NetworkStatus::new(true),
    };
    let deps = ManagerDeps {
        ingestion: fakes.ingestion.clone(),
        alerts: fakes.alerts.clone(),
        session: session(),
        store,
        probe: FakeProbe::healthy(),
        replayer: fakes.replayer.clone(),
        health_records: fakes.records.clone(),
        network: fakes.network.clone(),
        clock: Arc::new(SystemClock),
    };
    (deps, fakes)
}
