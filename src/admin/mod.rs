//! Admin HTTP API using Axum.
//!
//! Provides endpoints for:
//! - Health checks (/healthz, /livez, /readyz)
//! - Metrics (/metrics)
//! - Runtime stats (/stats)

mod handlers;
mod server;

pub use handlers::{HealthResponse, StatsResponse};
pub use server::{AdminServer, AdminState};
