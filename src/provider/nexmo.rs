//! Nexmo (Vonage) SMS API.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use serde::Deserialize;
use tracing::debug;

use crate::gateway::{DeliveryStatus, Sms, SmsEvent};
use crate::webhook::{WebhookContext, WebhookError};

use super::registry::{ProviderContext, RegistryError};
use super::{Capabilities, ProviderError, SmsProvider};

const NEXMO_API: &str = "https://rest.nexmo.com";

#[derive(Debug)]
pub struct Nexmo {
    name: String,
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<MessageResult>,
}

#[derive(Debug, Deserialize)]
struct MessageResult {
    status: String,
    #[serde(rename = "message-id")]
    message_id: Option<String>,
    #[serde(rename = "error-text")]
    error_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundSms {
    msisdn: String,
    to: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct DeliveryReceipt {
    #[serde(rename = "messageId")]
    message_id: String,
    status: String,
}

impl Nexmo {
    /// Params: `api_key`, `api_secret`; `api_base` overrides the endpoint.
    pub fn build(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SmsProvider>, RegistryError> {
        Ok(Arc::new(Self {
            name: ctx.name.to_string(),
            client: ctx.client.clone(),
            api_base: ctx
                .optional("api_base")
                .unwrap_or(NEXMO_API)
                .trim_end_matches('/')
                .to_string(),
            api_key: ctx.param("api_key")?.to_string(),
            api_secret: ctx.param("api_secret")?.to_string(),
        }))
    }
}

/// Human readable name for a per-message status code.
pub(crate) fn status_name(code: &str) -> Option<&'static str> {
    Some(match code {
        "0" => "Success",
        "1" => "Throttled",
        "2" => "Missing Parameters",
        "3" => "Invalid Parameters",
        "4" => "Invalid Credentials",
        "5" => "Internal Error",
        "6" => "Invalid Message",
        "7" => "Number Barred",
        "8" => "Partner Account Barred",
        "9" => "Partner Quota Violation",
        "10" => "Too Many Existing Binds",
        "11" => "Account Not Enabled For HTTP",
        "12" => "Message Too Long",
        "14" => "Invalid Signature",
        "15" => "Invalid Sender Address",
        "22" => "Invalid Network Code",
        "23" => "Invalid Callback URL",
        "29" => "Non-Whitelisted Destination",
        "32" => "Signature And API Secret Disallowed",
        "33" => "Number De-activated",
        _ => return None,
    })
}

#[async_trait]
impl SmsProvider for Nexmo {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "nexmo"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delivery_status: true,
            max_media: 0,
        }
    }

    async fn send(&self, sms: &Sms) -> Result<Option<String>, ProviderError> {
        if !sms.media_urls.is_empty() {
            return Err(ProviderError::Unsupported(
                "Nexmo doesn't support media".to_string(),
            ));
        }

        let mut form = vec![
            ("api_key", self.api_key.as_str()),
            ("api_secret", self.api_secret.as_str()),
            ("from", sms.from.digits()),
            ("to", sms.to.digits()),
            ("text", sms.body.as_str()),
        ];
        if !sms.body.is_ascii() {
            form.push(("type", "unicode"));
        }

        let response = self
            .client
            .post(format!("{}/sms/json", self.api_base))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!(
                "nexmo returned {}: {}",
                status,
                body.trim()
            )));
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Response(e.to_string()))?;
        let result = parsed
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Response("no messages in response".to_string()))?;

        if result.status != "0" {
            let name = status_name(&result.status)
                .map(str::to_string)
                .or(result.error_text)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(ProviderError::Rejected(format!(
                "Error sending SMS ({}): {}",
                result.status, name
            )));
        }

        debug!(provider = %self.name, id = ?result.message_id, "message accepted");
        Ok(result.message_id)
    }

    fn routes(&self) -> axum::Router<WebhookContext> {
        axum::Router::new()
            .route("/inbound-sms", post(inbound_sms))
            .route("/delivery-receipt", post(delivery_receipt))
    }
}

async fn inbound_sms(
    State(ctx): State<WebhookContext>,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let inbound: InboundSms = ctx.json(&body)?;
    let from = ctx.phone("msisdn", &format!("+{}", inbound.msisdn))?;
    let to = ctx.phone("to", &format!("+{}", inbound.to))?;

    ctx.submit(SmsEvent::Message(Sms::new(from, to, inbound.text)))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delivery_receipt(
    State(ctx): State<WebhookContext>,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let receipt: DeliveryReceipt = ctx.json(&body)?;

    ctx.submit(SmsEvent::Status {
        provider_id: receipt.message_id,
        status: DeliveryStatus::parse(&receipt.status),
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(status_name("0"), Some("Success"));
        assert_eq!(status_name("29"), Some("Non-Whitelisted Destination"));
        assert_eq!(status_name("13"), None);
    }

    #[test]
    fn test_response_shape() {
        let parsed: SendResponse = serde_json::from_str(
            r#"{"message-count":"1","messages":[{"to":"15551230000","message-id":"0A00","status":"0"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.messages[0].message_id.as_deref(), Some("0A00"));
    }
}
