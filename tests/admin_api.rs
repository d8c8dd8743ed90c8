//! Admin API integration tests
//!
//! Tests for /healthz, /readyz, /livez, /stats, /metrics endpoints
//!
//! Run with: cargo test --test admin_api -- --test-threads=1

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;

use xmpp_smsd::address::AddressMapper;
use xmpp_smsd::admin::{AdminServer, AdminState};
use xmpp_smsd::bootstrap::ShutdownManager;
use xmpp_smsd::config::{AdminConfig, SupervisorConfig};
use xmpp_smsd::gateway::{self, ReceiptTracker, RouterContext};
use xmpp_smsd::telemetry::Metrics;
use xmpp_smsd::xmpp::{OutboundBatch, TransportEvent, TransportHandle, TransportStatus};

/// Port allocator for tests
static PORT: AtomicU16 = AtomicU16::new(19100);

fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

/// Health response
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Stats response
#[derive(Debug, Deserialize)]
struct StatsResponse {
    uptime_seconds: u64,
    xmpp: XmppStats,
    receipts: ReceiptStats,
    router: Option<RouterStats>,
}

#[derive(Debug, Deserialize)]
struct XmppStats {
    connected: bool,
    connects: u64,
    stanzas_in: u64,
    stanzas_out: u64,
}

#[derive(Debug, Deserialize)]
struct ReceiptStats {
    pending: usize,
    capacity: usize,
}

#[derive(Debug, Deserialize)]
struct RouterStats {
    contacts: usize,
    pending_receipts: usize,
    rosters: usize,
    in_flight_sends: usize,
}

/// Test fixture that starts the admin server and a router on a unique port
struct TestServer {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown: Arc<ShutdownManager>,
    base_url: String,
    _events: mpsc::Sender<TransportEvent>,
    _outbound: mpsc::Receiver<OutboundBatch>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(true, false).await
    }

    async fn start_with(health: bool, metrics: bool) -> Self {
        let port = next_port();
        let config = AdminConfig {
            address: format!("127.0.0.1:{}", port).parse().unwrap(),
            metrics,
            health,
        };

        let shutdown = ShutdownManager::new(Duration::from_secs(5));

        // Nothing reads the outbound queue; the tests never send stanzas.
        let (transport, outbound) = TransportHandle::channel(4, Duration::from_secs(1));

        let receipts = Arc::new(ReceiptTracker::new(10));
        let (events_tx, events_rx) = mpsc::channel(4);
        let (gateway, router) = gateway::start(
            RouterContext {
                mapper: Arc::new(AddressMapper::new("gateway.example")),
                providers: HashMap::new(),
                receipts: receipts.clone(),
                transport,
                roster_users: Vec::new(),
            },
            events_rx,
            shutdown.subscribe(),
            4,
            SupervisorConfig::default(),
        );

        let metrics = if metrics {
            Some(Arc::new(Metrics::new().unwrap()))
        } else {
            None
        };

        let state = Arc::new(AdminState::new(
            Arc::new(TransportStatus::default()),
            receipts,
            gateway,
            shutdown.clone(),
            metrics,
        ));
        let server = AdminServer::new(&config, state, shutdown.clone());

        let admin = tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            handles: vec![admin, router],
            shutdown,
            base_url: format!("http://127.0.0.1:{}", port),
            _events: events_tx,
            _outbound: outbound,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.terminate();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[tokio::test]
async fn test_healthz_returns_healthy() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/healthz"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);

    let body: HealthResponse = resp.json().await.expect("invalid json");
    assert_eq!(body.status, "healthy");
    assert!(!body.version.is_empty());
}

#[tokio::test]
async fn test_livez_returns_ok() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/livez"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_waits_for_xmpp() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/readyz"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stats_returns_valid_stats() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/stats"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);

    let body: StatsResponse = resp.json().await.expect("invalid json");
    assert!(body.uptime_seconds < 60); // Should be very small since just started
    assert!(!body.xmpp.connected);
    assert_eq!(body.xmpp.connects, 0);
    assert_eq!(body.xmpp.stanzas_in, 0);
    assert_eq!(body.xmpp.stanzas_out, 0);
    assert_eq!(body.receipts.pending, 0);
    assert_eq!(body.receipts.capacity, 10);

    let router = body.router.expect("router should answer");
    assert_eq!(router.contacts, 0);
    assert_eq!(router.pending_receipts, 0);
    assert_eq!(router.rosters, 0);
    assert_eq!(router.in_flight_sends, 0);
}

#[tokio::test]
async fn test_metrics_returns_prometheus_format() {
    let server = TestServer::start_with(true, true).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/metrics"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let body = resp.text().await.expect("body");
    // Should contain prometheus metrics or be empty at startup
    assert!(body.contains("smsd_") || body.is_empty() || body.contains("# HELP") || body.contains("# TYPE"));
}

#[tokio::test]
async fn test_disabled_endpoints_are_not_found() {
    let server = TestServer::start_with(false, false).await;
    let client = reqwest::Client::new();

    for path in ["/healthz", "/readyz", "/metrics"] {
        let resp = client
            .get(server.url(path))
            .send()
            .await
            .expect("request failed");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", path);
    }

    let resp = client
        .get(server.url("/stats"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_draining_reports_unhealthy() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    // Hold the drain open so the admin server keeps serving.
    let _guard = server.shutdown.track("test");
    server.shutdown.start_drain();

    let resp = client
        .get(server.url("/healthz"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: HealthResponse = resp.json().await.expect("invalid json");
    assert_eq!(body.status, "draining");

    // The router stops once the drain begins.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resp = client
        .get(server.url("/stats"))
        .send()
        .await
        .expect("request failed");
    let body: StatsResponse = resp.json().await.expect("invalid json");
    assert!(body.router.is_none());
}
