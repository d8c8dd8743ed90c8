//! Admin HTTP server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::bootstrap::{ShutdownManager, ShutdownState};
use crate::config::AdminConfig;
use crate::gateway::{GatewayHandle, ReceiptTracker, RouterStats};
use crate::telemetry::Metrics;
use crate::xmpp::TransportStatus;

use super::handlers::{health_handler, live_handler, metrics_handler, ready_handler, stats_handler};

/// Admin server state.
pub struct AdminState {
    /// Server start time
    start_time: Instant,
    transport: Arc<TransportStatus>,
    receipts: Arc<ReceiptTracker>,
    gateway: GatewayHandle,
    shutdown: Arc<ShutdownManager>,
    metrics: Option<Arc<Metrics>>,
}

impl AdminState {
    pub fn new(
        transport: Arc<TransportStatus>,
        receipts: Arc<ReceiptTracker>,
        gateway: GatewayHandle,
        shutdown: Arc<ShutdownManager>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            transport,
            receipts,
            gateway,
            shutdown,
            metrics,
        }
    }

    /// Get uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Healthy until shutdown begins.
    pub fn is_healthy(&self) -> bool {
        self.shutdown.is_accepting()
    }

    /// Ready once the component stream is up.
    pub fn is_ready(&self) -> bool {
        self.is_healthy() && self.transport.is_connected()
    }

    pub fn transport(&self) -> &TransportStatus {
        &self.transport
    }

    pub fn receipts(&self) -> &ReceiptTracker {
        &self.receipts
    }

    /// Router snapshot, or `None` if the router is not answering.
    pub async fn router_stats(&self) -> Option<RouterStats> {
        self.gateway.stats().await.ok()
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }
}

/// Admin HTTP server.
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
    shutdown: Arc<ShutdownManager>,
}

impl AdminServer {
    /// Create a new admin server.
    pub fn new(config: &AdminConfig, state: Arc<AdminState>, shutdown: Arc<ShutdownManager>) -> Self {
        Self {
            config: config.clone(),
            state,
            shutdown,
        }
    }

    /// Build the router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new().route("/stats", get(stats_handler));

        if self.config.health {
            // Kubernetes-style health endpoints
            router = router
                .route("/healthz", get(health_handler))
                .route("/livez", get(live_handler))
                .route("/readyz", get(ready_handler));
        }
        if self.config.metrics {
            router = router.route("/metrics", get(metrics_handler));
        }

        router.with_state(self.state.clone())
    }

    /// Run the admin server.
    ///
    /// Stays up while draining so probes can watch the shutdown.
    pub async fn run(self) -> std::io::Result<()> {
        let router = self.build_router();
        let addr = self.config.address;

        info!(address = %addr, "starting admin server");

        let listener = TcpListener::bind(addr).await?;
        let mut shutdown_rx = self.shutdown.subscribe();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx
                    .wait_for(|state| *state == ShutdownState::Terminated)
                    .await;
                info!("admin server shutting down");
            })
            .await?;

        Ok(())
    }
}
