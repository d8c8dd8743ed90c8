use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::address::{Jid, UnmappedPolicy};

/// Root configuration for xmpp-smsd
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Component connection to the XMPP server
    pub xmpp: XmppConfig,

    /// Webhook listener
    #[serde(default)]
    pub http: HttpConfig,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Routing behaviour
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// XMPP users allowed to send SMS, with their own numbers
    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Explicit phone number → address mappings
    #[serde(default)]
    pub phones: Vec<PhoneConfig>,

    /// SMS carriers
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Users whose rosters the component manages
    #[serde(default)]
    pub rosters: Vec<Jid>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

/// XEP-0114 component connection
#[derive(Debug, Clone, Deserialize)]
pub struct XmppConfig {
    /// `host:port` of the server's component listener
    pub server: String,

    /// Component domain, e.g. `sms.example.com`
    pub domain: String,

    /// Shared handshake secret
    pub secret: String,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Pause between reconnect attempts
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// How long a sender waits for its stanzas to be written
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Outbound queue depth
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_channel_size() -> usize {
    256
}

/// Webhook listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_address")]
    pub address: SocketAddr,

    /// Externally reachable base URL, used for carrier status callbacks
    pub public_url: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_http_address(),
            public_url: None,
        }
    }
}

fn default_http_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9677)
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// HTTP API address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,

    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable health endpoint
    #[serde(default = "default_true")]
    pub health: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
            metrics: true,
            health: true,
        }
    }
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9090)
}

fn default_true() -> bool {
    true
}

/// Routing behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Prefix applied to numbers written without a country code, e.g. `+1`
    pub default_prefix: Option<String>,

    /// What to do with unmapped addresses and numbers
    #[serde(default)]
    pub unmapped: UnmappedPolicy,

    /// Maximum pending delivery receipts
    #[serde(default = "default_receipt_capacity")]
    pub receipt_capacity: usize,

    /// Router queue depth for webhook commands
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_prefix: None,
            unmapped: UnmappedPolicy::default(),
            receipt_capacity: default_receipt_capacity(),
            channel_size: default_channel_size(),
        }
    }
}

fn default_receipt_capacity() -> usize {
    crate::gateway::DEFAULT_RECEIPT_CAPACITY
}

/// A user of the gateway
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    pub jid: Jid,

    /// The user's own SMS number
    pub phone: String,

    /// Provider name; may be omitted when exactly one provider is configured
    pub provider: Option<String>,
}

/// Explicit mapping from a phone number to an address
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PhoneConfig {
    pub phone: String,
    pub jid: Jid,
}

/// SMS carrier entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Name used in webhook paths and user entries
    pub name: String,

    /// Provider type (`twilio`, `signalwire`, `nexmo`, `voipms`, `mock`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Logging and tracing
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Global settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight work may take to finish
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Max time for the entire shutdown
    #[serde(default = "default_parent_shutdown_timeout", with = "humantime_serde")]
    pub parent_shutdown_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            parent_shutdown_timeout: default_parent_shutdown_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_parent_shutdown_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Restart policy for supervised tasks
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
