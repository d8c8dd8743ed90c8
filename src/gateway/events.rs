//! Events flowing into the gateway router.

use tokio::sync::oneshot;

use crate::address::{Jid, PhoneNumber};
use crate::roster::Roster;

use super::router::RouteError;

/// A text or multimedia message on the carrier side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sms {
    pub from: PhoneNumber,
    pub to: PhoneNumber,
    pub body: String,
    pub media_urls: Vec<String>,
    /// Caller-ID name supplied by the carrier, if any.
    pub sender_name: Option<String>,
}

impl Sms {
    pub fn new(from: PhoneNumber, to: PhoneNumber, body: impl Into<String>) -> Self {
        Self {
            from,
            to,
            body: body.into(),
            media_urls: Vec::new(),
            sender_name: None,
        }
    }

    pub fn with_media(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.media_urls.extend(urls);
        self
    }
}

/// Carrier-reported delivery state of a message we sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted by the carrier, not yet sent.
    Accepted,
    /// In flight toward the handset.
    Enroute,
    /// Delivered to the handset.
    Delivered,
    /// Carrier gave up after the validity period.
    Expired,
    /// Handset unreachable.
    Undeliverable,
    /// Rejected by the carrier or a downstream network.
    Rejected,
    /// Sending failed for another reason.
    Failed,
    Unknown,
}

impl DeliveryStatus {
    /// Check if this is a final status.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Expired | Self::Undeliverable | Self::Rejected | Self::Failed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Enroute => "enroute",
            Self::Delivered => "delivered",
            Self::Expired => "expired",
            Self::Undeliverable => "undeliverable",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// Map the status vocabulary shared by Twilio, SignalWire and Nexmo.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "accepted" | "queued" | "scheduled" | "buffered" => Self::Accepted,
            "sending" | "sent" | "enroute" => Self::Enroute,
            "delivered" | "read" => Self::Delivered,
            "expired" => Self::Expired,
            "undelivered" | "undeliverable" => Self::Undeliverable,
            "rejected" | "canceled" => Self::Rejected,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Canonical event produced by a provider webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsEvent {
    /// A new inbound message.
    Message(Sms),
    /// Delivery report for a message we sent earlier.
    Status {
        provider_id: String,
        status: DeliveryStatus,
    },
}

impl SmsEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Status { .. } => "status",
        }
    }
}

/// How the router disposed of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsOutcome {
    /// Stanzas were written to the XMPP stream.
    Delivered,
    /// A pending receipt was found and sent.
    ReceiptSent,
    /// Nothing to do (unmapped party, untracked id, non-final status).
    Ignored,
}

impl SmsOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::ReceiptSent => "receipt_sent",
            Self::Ignored => "ignored",
        }
    }
}

/// Commands accepted by the router loop.
#[derive(Debug)]
pub enum Command {
    /// Inbound carrier event; the webhook waits on `reply` before answering.
    Sms {
        provider: String,
        event: SmsEvent,
        reply: oneshot::Sender<Result<SmsOutcome, RouteError>>,
    },
    /// Replace a user's roster with a fresh copy from their address book.
    ReplaceRoster {
        user: Jid,
        roster: Roster,
        reply: oneshot::Sender<Result<usize, RouteError>>,
    },
    /// Snapshot of router state for the admin API.
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
}

/// Router state summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RouterStats {
    pub contacts: usize,
    pub pending_receipts: usize,
    pub rosters: usize,
    pub in_flight_sends: usize,
}
