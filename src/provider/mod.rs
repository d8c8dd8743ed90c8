//! SMS carriers.
//!
//! Each carrier implements [`SmsProvider`]: an outbound `send` over its REST
//! API and the axum routes that turn its webhooks into [`SmsEvent`]s. The
//! [`ProviderRegistry`] builds providers from `{type, params}` config entries.
//!
//! [`SmsEvent`]: crate::gateway::SmsEvent

mod auth;
mod mock;
mod nexmo;
mod registry;
mod twilio;
mod voipms;

pub use auth::{require_basic_auth, BasicAuth};
pub use mock::{MockProvider, MockResponse};
pub use nexmo::Nexmo;
pub use registry::{ProviderContext, ProviderEntry, ProviderRegistry, RegistryError};
pub use twilio::Twilio;
pub use voipms::VoipMs;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::gateway::Sms;
use crate::webhook::WebhookContext;

/// What a carrier can do beyond plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Reports delivery status through a webhook.
    pub delivery_status: bool,
    /// Maximum media attachments per message; zero means text only.
    pub max_media: usize,
}

impl Capabilities {
    pub fn supports_media(&self) -> bool {
        self.max_media > 0
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The carrier refused the message.
    #[error("{0}")]
    Rejected(String),
    /// The message cannot be expressed with this carrier.
    #[error("{0}")]
    Unsupported(String),
    #[error("unexpected response: {0}")]
    Response(String),
}

/// An SMS carrier.
#[async_trait]
pub trait SmsProvider: Send + Sync + fmt::Debug {
    /// Config name, also the webhook path prefix.
    fn name(&self) -> &str;

    /// Provider type as written in config.
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Submit a message. Returns the carrier's message id when it reports one.
    async fn send(&self, sms: &Sms) -> Result<Option<String>, ProviderError>;

    /// Webhook routes, mounted under `/<name>`.
    fn routes(&self) -> axum::Router<WebhookContext>;
}
