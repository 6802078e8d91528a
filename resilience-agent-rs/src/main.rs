// resilience-agent-rs/src/main.rs
// Host process for the resilience pipeline: loads configuration, wires the
// HTTP collaborators through one tracked client and runs until Ctrl-C or
// SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};

use resilience::health::SystemClock;
use resilience::http::{
    build_client, HttpAlertSink, HttpDataStoreProbe, HttpHealthRecordSink, HttpIngestionClient,
    HttpOperationReplayer, TrackedHttpClient,
};
use resilience::remote::{Session, SessionProvider, SharedSession};
use resilience::{
    init_logging, FileStore, ManagerDeps, NetworkStatus, PanicHook, ResilienceConfig, SelfHealingManager,
};

fn install_metrics(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr.parse().with_context(|| format!("Invalid metrics address {}", addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus recorder")?;

    metrics::describe_counter!("tracker.reports.captured", "Reports accepted into the queue");
    metrics::describe_counter!("tracker.reports.sent", "Reports acknowledged by the ingestion endpoint");
    metrics::describe_counter!("tracker.send.failures", "Failed or timed out send attempts");
    metrics::describe_gauge!("tracker.queue.depth", "Undelivered reports");
    metrics::describe_gauge!("tracker.breaker.open", "1 while the circuit breaker is open");
    metrics::describe_gauge!("health.degraded", "1 while the last health check was degraded");

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Session supplied by the host environment, if any
fn session_from_env() -> Arc<SharedSession> {
    let session = Arc::new(SharedSession::new());
    match std::env::var("RESILIENCE_SESSION_TOKEN") {
        Ok(token) if !token.is_empty() => session.sign_in(Session {
            token,
            user_id: std::env::var("RESILIENCE_USER_ID").ok(),
        }),
        _ => warn!("No session token configured, reports stay queued until sign-in"),
    }
    session
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = ResilienceConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    init_logging(Some(config.logging.clone()))?;
    if let Some(addr) = &config.metrics_listen_addr {
        install_metrics(addr)?;
    }

    let endpoints = &config.endpoints;
    let network = NetworkStatus::new(true);
    let http = Arc::new(TrackedHttpClient::new(build_client(endpoints)?).with_network(network.clone()));
    let session_provider: Arc<dyn SessionProvider> = session_from_env();
    let store = FileStore::open(&config.storage.data_dir)
        .with_context(|| format!("Failed to open data dir {}", config.storage.data_dir))?;

    let deps = ManagerDeps {
        ingestion: Arc::new(HttpIngestionClient::new(http.clone(), &endpoints.ingestion_url)),
        alerts: Arc::new(HttpAlertSink::new(
            http.clone(),
            &endpoints.alerts_url,
            session_provider.clone(),
        )),
        session: session_provider.clone(),
        store: Arc::new(store),
        probe: Arc::new(HttpDataStoreProbe::new(
            http.clone(),
            &endpoints.data_store_probe_url,
            session_provider.clone(),
        )),
        replayer: Arc::new(HttpOperationReplayer::new(
            http.clone(),
            &endpoints.replay_base_url,
            session_provider.clone(),
        )),
        health_records: Arc::new(HttpHealthRecordSink::new(
            http.clone(),
            &endpoints.health_records_url,
            session_provider,
        )),
        network,
        clock: Arc::new(SystemClock),
    };

    let manager = SelfHealingManager::new(&config, deps)?;
    let tracker = manager.tracker();
    tracker.install_source(http.as_ref())?;
    tracker.install_source(&PanicHook)?;
    manager.start()?;

    info!(
        ingestion = %config.endpoints.ingestion_url,
        data_dir = %config.storage.data_dir,
        "Resilience agent running"
    );

    shutdown_signal().await;
    manager.shutdown().await;

    info!("Resilience agent stopped");
    Ok(())
}
