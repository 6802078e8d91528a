//! # HTTP Collaborators
//!
//! `reqwest`-backed implementations of the remote interfaces, plus the
//! outbound-call interceptor that feeds network failures to the tracker.
//!
//! Every collaborator sends through one shared [`TrackedHttpClient`], so
//! all outbound traffic is observed and drives the [`NetworkStatus`] flag.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, Request, RequestBuilder, Response};
use serde::Serialize;
use tracing::{debug, warn};

use crate::capture::{CaptureEvent, CaptureKind, CaptureSink, CaptureSource};
use crate::health::{HealthRecord, HealthRecordSink, NetworkStatus};
use crate::recovery::{OperationReplayer, PendingOperation};
use crate::remote::{Alert, AlertSink, DataStoreProbe, IngestionClient, SessionProvider};
use crate::report::ErrorReport;
use crate::settings::EndpointsConfig;
use crate::types::{Error, ErrorKind, Result};

/// Shared client with the pipeline's user agent, project key and timeout
pub fn build_client(endpoints: &EndpointsConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!("resilience-rs/", env!("CARGO_PKG_VERSION"))),
    );

    if let Some(api_key) = &endpoints.api_key {
        let value = HeaderValue::from_str(api_key).map_err(|e| {
            Error::new(ErrorKind::Configuration, format!("Invalid API key header: {}", e))
        })?;
        headers.insert("apikey", value);
    }

    Client::builder()
        .default_headers(headers)
        .timeout(endpoints.request_timeout)
        .build()
        .map_err(|e| {
            Error::new(ErrorKind::Configuration, format!("Failed to build HTTP client: {}", e))
        })
}

/// Maps a non-success response to an error; 5xx and 429 are transient
async fn check_response(service: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("Failed to read error response: {}", e));
    let kind = match status.as_u16() {
        401 | 403 => ErrorKind::Authentication,
        503 => ErrorKind::Unavailable,
        _ => ErrorKind::Communication,
    };

    let mut error = Error::new(kind, format!("{} returned {}", service, status))
        .context("status", status.as_u16())
        .context("body", body.chars().take(512).collect::<String>());
    if status.is_server_error() || status.as_u16() == 429 {
        error = error.transient();
    }
    Err(error)
}

async fn post_json<T: Serialize + ?Sized>(
    http: &TrackedHttpClient,
    service: &str,
    url: &str,
    credential: Option<&str>,
    body: &T,
) -> Result<()> {
    let mut request = http.request(Method::POST, url).json(body);
    if let Some(credential) = credential {
        request = request.bearer_auth(credential);
    }
    check_response(service, http.send(request).await?).await?;
    Ok(())
}

/// POSTs one report per call to the ingestion endpoint
#[derive(Debug, Clone)]
pub struct HttpIngestionClient {
    http: Arc<TrackedHttpClient>,
    url: String,
}

impl HttpIngestionClient {
    pub fn new(http: Arc<TrackedHttpClient>, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    async fn send(&self, report: &ErrorReport, credential: &str) -> Result<()> {
        post_json(&self.http, "ingestion", &self.url, Some(credential), report).await?;
        debug!(report_id = %report.id, "Error report delivered");
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Creates operator alert records, under the session credential when there is one
#[derive(Clone)]
pub struct HttpAlertSink {
    http: Arc<TrackedHttpClient>,
    url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpAlertSink {
    pub fn new(http: Arc<TrackedHttpClient>, url: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        Self { http, url: url.into(), session }
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn raise(&self, alert: Alert) -> Result<()> {
        let session = self.session.current_session().await;
        let credential = session.as_ref().map(|s| s.token.as_str());
        post_json(&self.http, "alerts", &self.url, credential, &alert).await
    }
}

#[derive(Clone)]
pub struct HttpHealthRecordSink {
    http: Arc<TrackedHttpClient>,
    url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpHealthRecordSink {
    pub fn new(http: Arc<TrackedHttpClient>, url: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        Self { http, url: url.into(), session }
    }
}

#[async_trait]
impl HealthRecordSink for HttpHealthRecordSink {
    async fn record(&self, record: &HealthRecord) -> Result<()> {
        let session = self.session.current_session().await;
        let credential = session.as_ref().map(|s| s.token.as_str());
        post_json(&self.http, "health records", &self.url, credential, record).await
    }
}

/// Cheap GET against the data store; any 2xx counts as reachable
#[derive(Clone)]
pub struct HttpDataStoreProbe {
    http: Arc<TrackedHttpClient>,
    url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpDataStoreProbe {
    pub fn new(http: Arc<TrackedHttpClient>, url: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        Self { http, url: url.into(), session }
    }
}

#[async_trait]
impl DataStoreProbe for HttpDataStoreProbe {
    async fn probe(&self) -> Result<()> {
        let mut request = self.http.request(Method::GET, &self.url);
        if let Some(session) = self.session.current_session().await {
            request = request.bearer_auth(session.token);
        }
        check_response("data store", self.http.send(request).await?).await?;
        Ok(())
    }
}

/// Replays a pending operation by POSTing its payload to `{base_url}/{operation}`
#[derive(Clone)]
pub struct HttpOperationReplayer {
    http: Arc<TrackedHttpClient>,
    base_url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpOperationReplayer {
    pub fn new(http: Arc<TrackedHttpClient>, base_url: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        Self { http, base_url: base_url.into(), session }
    }

    fn url_for(&self, operation: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), operation)
    }
}

#[async_trait]
impl OperationReplayer for HttpOperationReplayer {
    async fn replay(&self, pending: &PendingOperation) -> Result<()> {
        let session = self.session.current_session().await.ok_or_else(|| {
            Error::new(ErrorKind::Authentication, "No session to replay pending operations under")
        })?;
        let url = self.url_for(&pending.operation);
        post_json(&self.http, "replay", &url, Some(&session.token), &pending.payload).await?;
        debug!(id = %pending.id, operation = %pending.operation, "Pending operation replayed");
        Ok(())
    }
}

/// Outbound HTTP client that reports server errors and transport failures
///
/// Responses are returned to the caller untouched; reporting happens on the
/// side. The tracker drops events aimed at its own ingestion endpoint.
///
/// With a [`NetworkStatus`] attached, any response marks the network online
/// and a connect or timeout failure marks it offline.
#[derive(Debug, Default)]
pub struct TrackedHttpClient {
    client: Client,
    sink: OnceCell<CaptureSink>,
    network: Option<NetworkStatus>,
}

impl TrackedHttpClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            sink: OnceCell::new(),
            network: None,
        }
    }

    pub fn with_network(mut self, network: NetworkStatus) -> Self {
        self.network = Some(network);
        self
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Builds and executes `builder`
    pub async fn send(&self, builder: RequestBuilder) -> reqwest::Result<Response> {
        self.execute(builder.build()?).await
    }

    pub async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        let method = request.method().to_string();
        let url = request.url().to_string();

        let result = self.client.execute(request).await;

        if let Some(network) = &self.network {
            match &result {
                Ok(_) => network.set_online(true),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if network.is_online() {
                        warn!(%url, error = %e, "Network unreachable");
                    }
                    network.set_online(false);
                }
                Err(_) => {}
            }
        }

        let event = match &result {
            Ok(response) if response.status().is_server_error() => Some(CaptureEvent::Network {
                status: Some(response.status().as_u16()),
                message: format!("{} {} returned {}", method, url, response.status()),
                method,
                url,
            }),
            Ok(_) => None,
            Err(e) => Some(CaptureEvent::Network {
                status: e.status().map(|s| s.as_u16()),
                message: format!("{} {} failed: {}", method, url, e),
                method,
                url,
            }),
        };

        if let (Some(event), Some(sink)) = (event, self.sink.get()) {
            sink.emit(event);
        }
        result
    }
}

impl CaptureSource for TrackedHttpClient {
    fn kind(&self) -> CaptureKind {
        CaptureKind::NetworkInterceptor
    }

    fn install(&self, sink: CaptureSink) -> Result<()> {
        self.sink.set(sink).map_err(|_| {
            Error::new(ErrorKind::Initialization, "HTTP interceptor is already installed")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Severity;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every request with `status` and an empty body
    async fn serve(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        request.extend_from_slice(&buf[..n]);
                        if request_complete(&request) {
                            break;
                        }
                    }
                    let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}", addr)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    fn client() -> Client {
        build_client(&EndpointsConfig::default()).unwrap()
    }

    fn http() -> Arc<TrackedHttpClient> {
        Arc::new(TrackedHttpClient::new(client()))
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_ingestion_success() {
        let base = serve("204 No Content").await;
        let ingestion = HttpIngestionClient::new(http(), format!("{}/error-reports", base));

        let report = ErrorReport::manual("disk full", Severity::High);
        ingestion.send(&report, "jwt").await.unwrap();
        assert!(ingestion.endpoint().ends_with("/error-reports"));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let base = serve("503 Service Unavailable").await;
        let ingestion = HttpIngestionClient::new(http(), base);

        let err = ingestion
            .send(&ErrorReport::manual("x", Severity::Low), "jwt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(err.context["status"], 503);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rejected_credential() {
        let base = serve("401 Unauthorized").await;
        let ingestion = HttpIngestionClient::new(http(), base);

        let err = ingestion
            .send(&ErrorReport::manual("x", Severity::Low), "expired")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_replayer_requires_session() {
        let base = serve("200 OK").await;
        let signed_out = Arc::new(crate::remote::SharedSession::new());
        let replayer = HttpOperationReplayer::new(http(), format!("{}/rpc/", base), signed_out.clone());
        assert_eq!(replayer.url_for("create_receipt"), format!("{}/rpc/create_receipt", base));

        let pending = PendingOperation::new("create_receipt", serde_json::json!({"amount": 3}));
        let err = replayer.replay(&pending).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);

        signed_out.sign_in(crate::remote::Session {
            token: "jwt".to_string(),
            user_id: None,
        });
        replayer.replay(&pending).await.unwrap();
    }

    #[tokio::test]
    async fn test_tracked_client_reports_server_errors() {
        let failing = serve("502 Bad Gateway").await;
        let healthy = serve("200 OK").await;

        let (sink, mut events) = CaptureSink::channel();
        let tracked = TrackedHttpClient::new(client());
        tracked.install(sink).unwrap();

        let ok = tracked.send(tracked.request(Method::GET, &healthy)).await.unwrap();
        assert!(ok.status().is_success());
        assert!(events.try_recv().is_err());

        let bad = tracked
            .send(tracked.request(Method::GET, &format!("{}/ledgers", failing)))
            .await
            .unwrap();
        assert_eq!(bad.status().as_u16(), 502);

        match events.recv().await.unwrap() {
            CaptureEvent::Network { status, method, url, .. } => {
                assert_eq!(status, Some(502));
                assert_eq!(method, "GET");
                assert!(url.ends_with("/ledgers"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tracked_client_reports_transport_failures() {
        let closed = closed_port().await;

        let (sink, mut events) = CaptureSink::channel();
        let tracked = TrackedHttpClient::new(client());
        tracked.install(sink).unwrap();

        let result = tracked
            .send(tracked.request(Method::GET, &format!("{}/rest", closed)))
            .await;
        assert!(result.is_err());

        match events.recv().await.unwrap() {
            CaptureEvent::Network { status, .. } => assert_eq!(status, None),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_failures_drive_network_status() {
        let closed = closed_port().await;
        let reachable = serve("200 OK").await;
        let network = NetworkStatus::new(true);
        let session: Arc<dyn SessionProvider> = Arc::new(crate::remote::SharedSession::new());

        let (sink, mut events) = CaptureSink::channel();
        let tracked = Arc::new(TrackedHttpClient::new(client()).with_network(network.clone()));
        tracked.install(sink).unwrap();

        let down = HttpDataStoreProbe::new(tracked.clone(), format!("{}/rest/v1/settings", closed), session.clone());
        let err = down.probe().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.is_transient());
        assert!(!network.is_online());
        match events.recv().await.unwrap() {
            CaptureEvent::Network { url, .. } => assert!(url.contains("/rest/v1/settings")),
            other => panic!("unexpected event: {:?}", other),
        }

        let up = HttpDataStoreProbe::new(tracked, reachable, session);
        up.probe().await.unwrap();
        assert!(network.is_online());
    }

    #[tokio::test]
    async fn test_server_error_keeps_network_online() {
        let failing = serve("503 Service Unavailable").await;
        let network = NetworkStatus::new(true);
        let tracked = Arc::new(TrackedHttpClient::new(client()).with_network(network.clone()));

        let alerts = HttpAlertSink::new(tracked, failing, Arc::new(crate::remote::SharedSession::new()));
        let alert = Alert {
            severity: Severity::High,
            title: "queue stuck".to_string(),
            description: "no deliveries for an hour".to_string(),
            metadata: Default::default(),
        };
        assert!(alerts.raise(alert).await.is_err());
        assert!(network.is_online());
    }
}
