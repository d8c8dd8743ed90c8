//! Mock carrier for tests and local development.
//!
//! Sends are recorded instead of leaving the process. The JSON webhooks
//! accept canonical messages and status reports so the inbound path can be
//! exercised with plain `curl`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::Json;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::gateway::{DeliveryStatus, Sms, SmsEvent};
use crate::webhook::{WebhookContext, WebhookError};

use super::registry::{ProviderContext, RegistryError};
use super::{Capabilities, ProviderError, SmsProvider};

/// How the mock answers sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Accept and return a generated id.
    Success,
    /// Accept without reporting an id.
    NoId,
    /// Refuse with this reason.
    Error(String),
}

#[derive(Debug)]
pub struct MockProvider {
    name: String,
    response: MockResponse,
    latency: Duration,
    message_counter: AtomicU64,
    request_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    sent: Mutex<Vec<Sms>>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    from: String,
    to: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    media_urls: Vec<String>,
    #[serde(default)]
    sender_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundStatus {
    id: String,
    status: String,
}

impl MockProvider {
    fn with_response(name: impl Into<String>, response: MockResponse) -> Self {
        Self {
            name: name.into(),
            response,
            latency: Duration::ZERO,
            message_counter: AtomicU64::new(1),
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A mock that accepts every message.
    pub fn success(name: impl Into<String>) -> Self {
        Self::with_response(name, MockResponse::Success)
    }

    /// A mock that refuses every message with `reason`.
    pub fn error(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_response(name, MockResponse::Error(reason.into()))
    }

    pub fn no_id(name: impl Into<String>) -> Self {
        Self::with_response(name, MockResponse::NoId)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Params: `response` (`success`, `no_id` or `error`), `error`
    /// (the refusal reason) and `latency` (a humantime duration).
    pub fn build(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SmsProvider>, RegistryError> {
        let response = match ctx.optional("response").unwrap_or("success") {
            "success" => MockResponse::Success,
            "no_id" => MockResponse::NoId,
            "error" => MockResponse::Error(
                ctx.optional("error").unwrap_or("mock failure").to_string(),
            ),
            other => return Err(ctx.invalid("response", format!("unknown response '{}'", other))),
        };

        let latency = match ctx.optional("latency") {
            Some(value) => humantime::parse_duration(value)
                .map_err(|e| ctx.invalid("latency", e.to_string()))?,
            None => Duration::ZERO,
        };

        Ok(Arc::new(
            Self::with_response(ctx.name, response).with_latency(latency),
        ))
    }

    /// Messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<Sms> {
        self.sent.lock().clone()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Id the next successful send will return.
    pub fn peek_message_id(&self) -> String {
        format_id(self.message_counter.load(Ordering::Relaxed))
    }

    fn next_message_id(&self) -> String {
        format_id(self.message_counter.fetch_add(1, Ordering::Relaxed))
    }
}

fn format_id(n: u64) -> String {
    format!("MOCK{:016X}", n)
}

#[async_trait]
impl SmsProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delivery_status: true,
            max_media: usize::MAX,
        }
    }

    async fn send(&self, sms: &Sms) -> Result<Option<String>, ProviderError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if !self.latency.is_zero() {
            trace!(latency_ms = self.latency.as_millis() as u64, "simulating latency");
            sleep(self.latency).await;
        }

        match &self.response {
            MockResponse::Error(reason) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                debug!(reason = %reason, "mock error");
                Err(ProviderError::Rejected(reason.clone()))
            }
            response => {
                self.sent.lock().push(sms.clone());
                self.success_count.fetch_add(1, Ordering::Relaxed);
                if *response == MockResponse::NoId {
                    return Ok(None);
                }
                let id = self.next_message_id();
                debug!(id = %id, to = %sms.to, "mock success");
                Ok(Some(id))
            }
        }
    }

    fn routes(&self) -> axum::Router<WebhookContext> {
        axum::Router::new()
            .route("/message", post(message))
            .route("/status", post(status))
    }
}

async fn message(
    State(ctx): State<WebhookContext>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, WebhookError> {
    let inbound: InboundMessage = ctx.json(&body)?;
    let mut sms = Sms::new(
        ctx.phone("from", &inbound.from)?,
        ctx.phone("to", &inbound.to)?,
        inbound.body,
    )
    .with_media(inbound.media_urls);
    sms.sender_name = inbound.sender_name;

    let outcome = ctx.submit(SmsEvent::Message(sms)).await?;
    Ok(Json(json!({ "outcome": outcome.as_str() })))
}

async fn status(
    State(ctx): State<WebhookContext>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, WebhookError> {
    let inbound: InboundStatus = ctx.json(&body)?;
    let outcome = ctx
        .submit(SmsEvent::Status {
            provider_id: inbound.id,
            status: DeliveryStatus::parse(&inbound.status),
        })
        .await?;
    Ok(Json(json!({ "outcome": outcome.as_str() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhoneNumber;

    fn sms() -> Sms {
        Sms::new(
            PhoneNumber::parse("+15559998888").unwrap(),
            PhoneNumber::parse("+15551230000").unwrap(),
            "hello",
        )
    }

    #[tokio::test]
    async fn test_mock_success() {
        let mock = MockProvider::success("mock");
        assert_eq!(mock.peek_message_id(), "MOCK0000000000000001");

        let id = mock.send(&sms()).await.unwrap();
        assert_eq!(id.as_deref(), Some("MOCK0000000000000001"));
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.success_count(), 1);
        assert_eq!(mock.sent(), vec![sms()]);
    }

    #[tokio::test]
    async fn test_mock_error() {
        let mock = MockProvider::error("mock", "carrier down");
        let err = mock.send(&sms()).await.unwrap_err();
        assert_eq!(err.to_string(), "carrier down");
        assert_eq!(mock.error_count(), 1);
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_mock_no_id() {
        let mock = MockProvider::no_id("mock");
        assert_eq!(mock.send(&sms()).await.unwrap(), None);
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_latency() {
        let mock = MockProvider::success("mock").with_latency(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        mock.send(&sms()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
