//! Admin API handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::gateway::RouterStats;

use super::AdminState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check handler.
pub async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: if state.is_healthy() { "healthy" } else { "draining" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if state.is_healthy() {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Stats response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub xmpp: XmppStats,
    pub receipts: ReceiptStats,
    /// Absent while the router is restarting.
    pub router: Option<RouterStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct XmppStats {
    pub connected: bool,
    pub connects: u64,
    pub stanzas_in: u64,
    pub stanzas_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptStats {
    pub pending: usize,
    pub capacity: usize,
}

/// Stats handler.
pub async fn stats_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let transport = state.transport();
    let response = StatsResponse {
        uptime_seconds: state.uptime().as_secs(),
        xmpp: XmppStats {
            connected: transport.is_connected(),
            connects: transport.connects(),
            stanzas_in: transport.stanzas_in(),
            stanzas_out: transport.stanzas_out(),
        },
        receipts: ReceiptStats {
            pending: state.receipts().len(),
            capacity: state.receipts().capacity(),
        },
        router: state.router_stats().await,
    };

    Json(response)
}

/// Metrics handler (Prometheus format).
pub async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let content_type = [("content-type", "text/plain; version=0.0.4; charset=utf-8")];

    let Some(metrics) = state.metrics() else {
        return (
            StatusCode::NOT_FOUND,
            content_type,
            "metrics are disabled\n".to_string(),
        );
    };

    match metrics.render() {
        Ok(output) => (StatusCode::OK, content_type, output),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            content_type,
            format!("Error encoding metrics: {}", e),
        ),
    }
}

/// Ready handler (for Kubernetes).
pub async fn ready_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Live handler (for Kubernetes).
pub async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}
