//! Carrier webhooks: the HTTP side of the gateway.
//!
//! Each provider contributes an axum sub-router mounted under `/<name>`.
//! Handlers parse the carrier's payload, turn it into an [`SmsEvent`] and
//! wait for the router's verdict before answering, so a failure to deliver
//! reaches the carrier as a 500 and can be retried on their side.

mod server;

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::address::PhoneNumber;
use crate::gateway::{GatewayError, GatewayHandle, SmsEvent, SmsOutcome};
use crate::telemetry::counters;

pub use server::{router, WebhookServer, GREETING, UNKNOWN_PROVIDER};

#[derive(Debug, Error)]
pub enum WebhookError {
    /// The carrier sent something we cannot use.
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                format!("400 Bad Request: {}\n", reason),
            )
                .into_response(),
            Self::Gateway(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "500 Internal Server Error: failed to receive message\n",
            )
                .into_response(),
        }
    }
}

/// Per-provider state handed to webhook handlers.
#[derive(Debug, Clone)]
pub struct WebhookContext {
    provider: Arc<str>,
    gateway: GatewayHandle,
    default_prefix: Option<Arc<str>>,
}

impl WebhookContext {
    pub fn new(provider: &str, gateway: GatewayHandle, default_prefix: Option<&str>) -> Self {
        Self {
            provider: provider.into(),
            gateway,
            default_prefix: default_prefix.map(Into::into),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Pass an event to the router and wait for the outcome.
    pub async fn submit(&self, event: SmsEvent) -> Result<SmsOutcome, WebhookError> {
        let kind = event.kind();
        match self.gateway.submit(&self.provider, event).await {
            Ok(outcome) => {
                debug!(provider = %self.provider, kind, outcome = outcome.as_str(), "webhook handled");
                counters::webhook(&self.provider, outcome.as_str());
                Ok(outcome)
            }
            Err(e) => {
                error!(provider = %self.provider, kind, error = %e, "failed to receive message");
                counters::webhook(&self.provider, "error");
                Err(e.into())
            }
        }
    }

    /// Reject a request the carrier got wrong.
    pub fn malformed(&self, reason: impl Into<String>) -> WebhookError {
        let reason = reason.into();
        warn!(provider = %self.provider, reason = %reason, "malformed webhook request");
        counters::webhook(&self.provider, "malformed");
        WebhookError::BadRequest(reason)
    }

    /// Parse a phone number from a payload field.
    pub fn phone(&self, field: &str, raw: &str) -> Result<PhoneNumber, WebhookError> {
        PhoneNumber::parse_with_prefix(raw, self.default_prefix.as_deref())
            .map_err(|e| self.malformed(format!("invalid {}: {}", field, e)))
    }

    /// Parse a JSON body.
    pub fn json<T: DeserializeOwned>(&self, body: &Bytes) -> Result<T, WebhookError> {
        serde_json::from_slice(body).map_err(|e| self.malformed(format!("malformed JSON: {}", e)))
    }
}
