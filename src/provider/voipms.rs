//! voip.ms REST API. North American (`+1`) numbers only.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::address::PhoneNumber;
use crate::gateway::{Sms, SmsEvent};
use crate::webhook::{WebhookContext, WebhookError};

use super::registry::{ProviderContext, RegistryError};
use super::{Capabilities, ProviderError, SmsProvider};

const VOIPMS_API: &str = "https://voip.ms/api/v1/rest.php";
const SMS_MAX_BYTES: usize = 160;
const MMS_MAX_BYTES: usize = 2048;
const MAX_MEDIA: usize = 3;

#[derive(Debug)]
pub struct VoipMs {
    name: String,
    client: reqwest::Client,
    api_url: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    sms: Option<Value>,
    #[serde(default)]
    mms: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Webhook {
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct Payload {
    from: Endpoint,
    #[serde(default)]
    to: Vec<Endpoint>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    phone_number: String,
}

#[derive(Debug, Deserialize)]
struct Media {
    url: String,
}

impl VoipMs {
    /// Params: `api_username`, `api_password`; `api_url` overrides the endpoint.
    pub fn build(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SmsProvider>, RegistryError> {
        Ok(Arc::new(Self {
            name: ctx.name.to_string(),
            client: ctx.client.clone(),
            api_url: ctx.optional("api_url").unwrap_or(VOIPMS_API).to_string(),
            username: ctx.param("api_username")?.to_string(),
            password: ctx.param("api_password")?.to_string(),
        }))
    }
}

/// The ten-digit form voip.ms expects.
fn north_american(number: &PhoneNumber) -> Result<&str, ProviderError> {
    number.as_str().strip_prefix("+1").ok_or_else(|| {
        ProviderError::Unsupported(format!(
            "voip.ms only supports +1 numbers, not {}",
            number
        ))
    })
}

/// Pick `sendSMS` or `sendMMS` for a message, or refuse it.
fn method_for(sms: &Sms) -> Result<&'static str, ProviderError> {
    let bytes = sms.body.len();
    let media = sms.media_urls.len();

    if bytes <= SMS_MAX_BYTES && media == 0 {
        Ok("sendSMS")
    } else if bytes <= MMS_MAX_BYTES && media <= MAX_MEDIA {
        Ok("sendMMS")
    } else if media > MAX_MEDIA {
        Err(ProviderError::Unsupported(format!(
            "voip.ms accepts at most {} media files",
            MAX_MEDIA
        )))
    } else {
        Err(ProviderError::Unsupported(format!(
            "message too long for voip.ms ({} bytes)",
            bytes
        )))
    }
}

fn id_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SmsProvider for VoipMs {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "voipms"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delivery_status: false,
            max_media: MAX_MEDIA,
        }
    }

    async fn send(&self, sms: &Sms) -> Result<Option<String>, ProviderError> {
        let did = north_american(&sms.from)?;
        let dst = north_american(&sms.to)?;
        let method = method_for(sms)?;

        let mut form = vec![
            ("api_username", self.username.clone()),
            ("api_password", self.password.clone()),
            ("method", method.to_string()),
            ("content_type", "json".to_string()),
            ("did", did.to_string()),
            ("dst", dst.to_string()),
            ("message", sms.body.clone()),
        ];
        let media_keys = ["media1", "media2", "media3"];
        form.extend(
            media_keys
                .iter()
                .zip(&sms.media_urls)
                .map(|(key, url)| (*key, url.clone())),
        );

        let response = self.client.post(&self.api_url).form(&form).send().await?;

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if !is_json {
            return Err(ProviderError::Response(format!(
                "voip.ms returned {} without a JSON body",
                response.status()
            )));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Response(e.to_string()))?;
        if parsed.status != "success" {
            return Err(ProviderError::Rejected(format!(
                "voip.ms error: {}",
                parsed.status
            )));
        }

        let id = parsed.sms.or(parsed.mms).and_then(id_string);
        debug!(provider = %self.name, method, id = ?id, "message sent");
        Ok(id)
    }

    fn routes(&self) -> axum::Router<WebhookContext> {
        axum::Router::new().route("/sms", post(inbound_sms))
    }
}

async fn inbound_sms(
    State(ctx): State<WebhookContext>,
    body: Bytes,
) -> Result<impl IntoResponse, WebhookError> {
    let webhook: Webhook = ctx.json(&body)?;
    let payload = webhook.data.payload;

    let [to] = payload.to.as_slice() else {
        return Err(ctx.malformed(format!(
            "expected exactly one recipient, got {}",
            payload.to.len()
        )));
    };

    let from = ctx.phone("from", &with_country_code(&payload.from.phone_number))?;
    let to = ctx.phone("to", &with_country_code(&to.phone_number))?;
    let sms = Sms::new(from, to, payload.text)
        .with_media(payload.media.into_iter().map(|m| m.url));

    ctx.submit(SmsEvent::Message(sms)).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], "ok\n"))
}

fn with_country_code(number: &str) -> String {
    if number.starts_with('+') {
        number.to_string()
    } else {
        format!("+1{}", number)
    }
}
