//! Routing between the XMPP stream and SMS carriers.

mod events;
mod receipts;
mod router;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::address::Jid;
use crate::bootstrap::{supervise, ShutdownState};
use crate::config::SupervisorConfig;
use crate::roster::Roster;
use crate::xmpp::TransportEvent;

pub use events::{Command, DeliveryStatus, RouterStats, Sms, SmsEvent, SmsOutcome};
pub use receipts::{ReceiptTracker, DEFAULT_RECEIPT_CAPACITY};
pub use router::{Inbox, ProviderMap, RouteError, Router, RouterContext};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway router is not running")]
    Unavailable,
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Sending side of the router's command queue.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    /// A handle and the queue it feeds.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| GatewayError::Unavailable)?;
        rx.await.map_err(|_| GatewayError::Unavailable)
    }

    /// Hand a carrier event to the router and wait for its outcome.
    pub async fn submit(&self, provider: &str, event: SmsEvent) -> Result<SmsOutcome, GatewayError> {
        let provider = provider.to_string();
        Ok(self
            .request(|reply| Command::Sms {
                provider,
                event,
                reply,
            })
            .await??)
    }

    /// Replace `user`'s roster; returns the number of pushes sent.
    pub async fn replace_roster(&self, user: Jid, roster: Roster) -> Result<usize, GatewayError> {
        Ok(self
            .request(|reply| Command::ReplaceRoster {
                user,
                roster,
                reply,
            })
            .await??)
    }

    pub async fn stats(&self) -> Result<RouterStats, GatewayError> {
        self.request(|reply| Command::Stats { reply }).await
    }
}

/// Start the supervised router task.
///
/// The queues outlive any single router, so a router restarted after a panic
/// keeps consuming where the previous one stopped.
pub fn start(
    ctx: RouterContext,
    events: mpsc::Receiver<TransportEvent>,
    shutdown_rx: watch::Receiver<ShutdownState>,
    channel_size: usize,
    supervisor: SupervisorConfig,
) -> (GatewayHandle, JoinHandle<()>) {
    let (handle, commands) = GatewayHandle::channel(channel_size);
    let inbox = Arc::new(Mutex::new(Inbox { commands, events }));

    let factory = {
        let shutdown_rx = shutdown_rx.clone();
        move || {
            let router = Router::new(ctx.clone());
            let inbox = inbox.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                let mut inbox = inbox.lock().await;
                router.run(&mut inbox, shutdown_rx).await;
                Ok::<(), anyhow::Error>(())
            }
            .instrument(info_span!("router"))
        }
    };

    let task = tokio::spawn(supervise("router", supervisor, shutdown_rx, factory));
    (handle, task)
}
