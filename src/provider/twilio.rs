//! Twilio and SignalWire (which exposes a Twilio-compatible API).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Form;
use serde::Deserialize;
use tracing::debug;

use crate::gateway::{DeliveryStatus, Sms, SmsEvent};
use crate::webhook::{WebhookContext, WebhookError};

use super::registry::{ProviderContext, RegistryError};
use super::{Capabilities, ProviderError, SmsProvider};

const TWILIO_API: &str = "https://api.twilio.com";
const MAX_MEDIA: usize = 10;
const EMPTY_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response></Response>";

#[derive(Debug)]
pub struct Twilio {
    name: String,
    kind: &'static str,
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    key_sid: String,
    key_secret: String,
    status_callback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    #[serde(default)]
    sid: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl Twilio {
    /// Params: `account_sid`, `key_sid`, `key_secret`; `api_base` overrides
    /// the API endpoint.
    pub fn twilio(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SmsProvider>, RegistryError> {
        let api_base = ctx.optional("api_base").unwrap_or(TWILIO_API);
        Ok(Arc::new(Self {
            name: ctx.name.to_string(),
            kind: "twilio",
            client: ctx.client.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            account_sid: ctx.param("account_sid")?.to_string(),
            key_sid: ctx.param("key_sid")?.to_string(),
            key_secret: ctx.param("key_secret")?.to_string(),
            status_callback: ctx.webhook_url("status"),
        }))
    }

    /// Params: `domain` (the space, e.g. `example.signalwire.com`),
    /// `project_id`, `auth_token`.
    pub fn signalwire(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SmsProvider>, RegistryError> {
        let domain = ctx.param("domain")?;
        if domain.contains('/') {
            return Err(ctx.invalid("domain", "expected a host name"));
        }
        let project_id = ctx.param("project_id")?.to_string();
        let api_base = match ctx.optional("api_base") {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}/api/laml", domain),
        };

        Ok(Arc::new(Self {
            name: ctx.name.to_string(),
            kind: "signalwire",
            client: ctx.client.clone(),
            api_base,
            account_sid: project_id.clone(),
            key_sid: project_id,
            key_secret: ctx.param("auth_token")?.to_string(),
            status_callback: ctx.webhook_url("status"),
        }))
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }
}

#[async_trait]
impl SmsProvider for Twilio {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delivery_status: self.status_callback.is_some(),
            max_media: MAX_MEDIA,
        }
    }

    async fn send(&self, sms: &Sms) -> Result<Option<String>, ProviderError> {
        if sms.media_urls.len() > MAX_MEDIA {
            return Err(ProviderError::Unsupported("Too many media URLs".to_string()));
        }

        let mut form = vec![
            ("To", sms.to.to_string()),
            ("From", sms.from.to_string()),
            ("Body", sms.body.clone()),
        ];
        form.extend(sms.media_urls.iter().map(|url| ("MediaUrl", url.clone())));
        if let Some(callback) = &self.status_callback {
            form.push(("StatusCallback", callback.clone()));
        }

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.key_sid, Some(&self.key_secret))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Rejected(format!(
                "{} returned {}: {}",
                self.kind,
                status,
                body.trim()
            )));
        }

        let resource: MessageResource =
            serde_json::from_str(&body).map_err(|e| ProviderError::Response(e.to_string()))?;
        if resource.status != "queued" {
            return Err(ProviderError::Rejected(format!(
                "unexpected message status '{}': {}",
                resource.status,
                resource.message.unwrap_or_default()
            )));
        }

        debug!(provider = %self.name, sid = %resource.sid, "message queued");
        Ok(Some(resource.sid).filter(|sid| !sid.is_empty()))
    }

    fn routes(&self) -> axum::Router<WebhookContext> {
        axum::Router::new()
            .route("/message", post(message))
            .route("/status", post(status))
    }
}

/// Incoming message, or a status callback when `MessageStatus` is present.
async fn message(
    State(ctx): State<WebhookContext>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<impl IntoResponse, WebhookError> {
    let event = match status_event(&form) {
        Some(event) => event,
        None => SmsEvent::Message(parse_message(&ctx, &form)?),
    };

    ctx.submit(event).await?;
    Ok(twiml())
}

async fn status(
    State(ctx): State<WebhookContext>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<impl IntoResponse, WebhookError> {
    let event = status_event(&form)
        .ok_or_else(|| ctx.malformed("status callback without MessageSid and MessageStatus"))?;

    ctx.submit(event).await?;
    Ok(twiml())
}

fn status_event(form: &HashMap<String, String>) -> Option<SmsEvent> {
    let sid = form.get("MessageSid")?;
    let status = form.get("MessageStatus")?;
    Some(SmsEvent::Status {
        provider_id: sid.clone(),
        status: DeliveryStatus::parse(status),
    })
}

fn parse_message(ctx: &WebhookContext, form: &HashMap<String, String>) -> Result<Sms, WebhookError> {
    let field = |key: &str| {
        form.get(key)
            .ok_or_else(|| ctx.malformed(format!("missing {}", key)))
    };

    let from = ctx.phone("From", field("From")?)?;
    let to = ctx.phone("To", field("To")?)?;
    let body = form.get("Body").cloned().unwrap_or_default();

    let count = match form.get("NumMedia") {
        Some(n) => n
            .parse::<usize>()
            .map_err(|_| ctx.malformed(format!("invalid NumMedia '{}'", n)))?,
        None => 0,
    };
    let media = (0..count)
        .map(|i| field(&format!("MediaUrl{}", i)).cloned())
        .collect::<Result<Vec<_>, _>>()?;

    let mut sms = Sms::new(from, to, body).with_media(media);
    sms.sender_name = form.get("CallerName").filter(|n| !n.is_empty()).cloned();
    Ok(sms)
}

fn twiml() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayHandle;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn webhook() -> WebhookContext {
        let (gateway, _) = GatewayHandle::channel(1);
        WebhookContext::new("twilio", gateway, Some("+1"))
    }

    #[test]
    fn test_signalwire_build() {
        let params = params(&[
            ("domain", "example.signalwire.com"),
            ("project_id", "p-1"),
            ("auth_token", "t"),
        ]);
        let ctx = ProviderContext {
            name: "sw",
            params: &params,
            public_url: Some("https://sms.example.com"),
            client: reqwest::Client::new(),
        };
        let provider = Twilio::signalwire(&ctx).unwrap();
        assert_eq!(provider.kind(), "signalwire");
        assert!(provider.capabilities().delivery_status);
    }

    #[test]
    fn test_signalwire_rejects_url_domain() {
        let params = params(&[
            ("domain", "https://example.signalwire.com/"),
            ("project_id", "p-1"),
            ("auth_token", "t"),
        ]);
        let ctx = ProviderContext {
            name: "sw",
            params: &params,
            public_url: None,
            client: reqwest::Client::new(),
        };
        assert!(Twilio::signalwire(&ctx).is_err());
    }

    #[test]
    fn test_no_status_callback_without_public_url() {
        let params = params(&[
            ("account_sid", "AC1"),
            ("key_sid", "SK1"),
            ("key_secret", "s"),
        ]);
        let ctx = ProviderContext {
            name: "twilio",
            params: &params,
            public_url: None,
            client: reqwest::Client::new(),
        };
        let provider = Twilio::twilio(&ctx).unwrap();
        assert!(!provider.capabilities().delivery_status);
        assert_eq!(provider.capabilities().max_media, MAX_MEDIA);
    }

    #[test]
    fn test_status_event() {
        let event = status_event(&params(&[("MessageSid", "SM1"), ("MessageStatus", "delivered")]));
        assert_eq!(
            event,
            Some(SmsEvent::Status {
                provider_id: "SM1".to_string(),
                status: DeliveryStatus::Delivered,
            })
        );

        assert!(status_event(&params(&[("MessageSid", "SM1")])).is_none());
    }

    #[test]
    fn test_parse_message_with_media() {
        let sms = parse_message(
            &webhook(),
            &params(&[
                ("From", "5551230000"),
                ("To", "+15559998888"),
                ("Body", "look"),
                ("NumMedia", "2"),
                ("MediaUrl0", "https://media.example/0"),
                ("MediaUrl1", "https://media.example/1"),
                ("CallerName", "Bob"),
            ]),
        )
        .unwrap();

        assert_eq!(sms.from.as_str(), "+15551230000");
        assert_eq!(sms.body, "look");
        assert_eq!(sms.media_urls.len(), 2);
        assert_eq!(sms.sender_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_parse_message_missing_fields() {
        let ctx = webhook();
        assert!(matches!(
            parse_message(&ctx, &params(&[("From", "+15551230000")])),
            Err(WebhookError::BadRequest(_))
        ));
        assert!(matches!(
            parse_message(
                &ctx,
                &params(&[("From", "+15551230000"), ("To", "+15559998888"), ("NumMedia", "1")])
            ),
            Err(WebhookError::BadRequest(_))
        ));
    }
}
