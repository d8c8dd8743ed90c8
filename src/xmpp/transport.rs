//! Component connection task and its serialized send handle.
//!
//! One task owns the socket. Outbound batches arrive over an mpsc channel and
//! are written one at a time, so stanzas never interleave on the wire. Each
//! batch is acknowledged through a oneshot; callers give up after
//! `send_timeout` and the writer skips batches nobody is waiting for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bootstrap::ShutdownState;
use crate::config::XmppConfig;
use crate::telemetry::counters;

use super::component::ComponentStream;
use super::stanza::Stanza;
use super::xml::XmlError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream closed by server")]
    Closed,
    #[error("xmpp connection unavailable")]
    Unavailable,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("inbound buffer exceeded {0} bytes")]
    Overflow(usize),
}

/// Stanzas to be written back to back, plus the caller's acknowledgement.
#[derive(Debug)]
pub struct OutboundBatch {
    stanzas: Vec<Stanza>,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

impl OutboundBatch {
    pub fn stanzas(&self) -> &[Stanza] {
        &self.stanzas
    }

    /// The caller timed out or went away.
    pub fn is_abandoned(&self) -> bool {
        self.ack.is_closed()
    }

    pub fn complete(self, result: Result<(), TransportError>) {
        let _ = self.ack.send(result);
    }

    pub fn into_parts(self) -> (Vec<Stanza>, oneshot::Sender<Result<(), TransportError>>) {
        (self.stanzas, self.ack)
    }
}

/// Handle for sending stanzas through the connection task.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    tx: mpsc::Sender<OutboundBatch>,
    send_timeout: Duration,
}

impl TransportHandle {
    /// Create a handle and the receiving end a writer drains.
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<OutboundBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, send_timeout }, rx)
    }

    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<(), TransportError> {
        self.send_batch(vec![stanza.into()]).await
    }

    /// Send stanzas atomically: all are written together, in order.
    pub async fn send_batch(&self, stanzas: Vec<Stanza>) -> Result<(), TransportError> {
        if stanzas.is_empty() {
            return Ok(());
        }

        let (ack, done) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(OutboundBatch { stanzas, ack })
                .await
                .map_err(|_| TransportError::Unavailable)?;
            done.await.map_err(|_| TransportError::Unavailable)?
        };

        tokio::time::timeout(self.send_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))?
    }
}

/// What the connection task reports to the router.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Stanza(Stanza),
}

/// Connection status shared with the admin server.
#[derive(Debug, Default)]
pub struct TransportStatus {
    connected: AtomicBool,
    connects: AtomicU64,
    stanzas_in: AtomicU64,
    stanzas_out: AtomicU64,
}

impl TransportStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn stanzas_in(&self) -> u64 {
        self.stanzas_in.load(Ordering::Relaxed)
    }

    pub fn stanzas_out(&self) -> u64 {
        self.stanzas_out.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        if connected {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
        counters::xmpp_connected(connected);
    }
}

/// Component connection task with automatic reconnect.
pub struct Transport {
    config: XmppConfig,
    outbound: mpsc::Receiver<OutboundBatch>,
    events: mpsc::Sender<TransportEvent>,
    status: Arc<TransportStatus>,
    shutdown_rx: watch::Receiver<ShutdownState>,
}

enum SessionEnd {
    Shutdown,
    Lost(TransportError),
}

impl Transport {
    pub fn new(
        config: XmppConfig,
        outbound: mpsc::Receiver<OutboundBatch>,
        events: mpsc::Sender<TransportEvent>,
        status: Arc<TransportStatus>,
        shutdown_rx: watch::Receiver<ShutdownState>,
    ) -> Self {
        Self {
            config,
            outbound,
            events,
            status,
            shutdown_rx,
        }
    }

    /// Run until shutdown, reconnecting after `reconnect_delay` on failure.
    pub async fn run(mut self) {
        info!(server = %self.config.server, domain = %self.config.domain, "xmpp transport started");

        loop {
            if self.shutting_down() {
                break;
            }

            let connect = ComponentStream::connect(
                &self.config.server,
                &self.config.domain,
                &self.config.secret,
                self.config.connect_timeout,
            );

            let stream = tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                result = connect => result,
            };

            match stream {
                Ok(stream) => {
                    self.status.set_connected(true);
                    if self.events.send(TransportEvent::Connected).await.is_err() {
                        break;
                    }

                    let end = self.session(stream).await;

                    self.status.set_connected(false);
                    let _ = self.events.send(TransportEvent::Disconnected).await;

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(e) => warn!(error = %e, "xmpp connection lost"),
                    }
                }
                Err(e) => {
                    warn!(server = %self.config.server, error = %e, "xmpp connection failed");
                }
            }

            counters::xmpp_reconnect();
            debug!(delay = ?self.config.reconnect_delay, "waiting before reconnect");

            tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!("xmpp transport stopped");
    }

    async fn session(&mut self, mut stream: ComponentStream) -> SessionEnd {
        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || self.shutting_down() {
                        if let Err(e) = stream.close().await {
                            debug!(error = %e, "error closing stream");
                        }
                        return SessionEnd::Shutdown;
                    }
                }

                batch = self.outbound.recv() => {
                    let Some(batch) = batch else {
                        info!("outbound channel closed");
                        return SessionEnd::Shutdown;
                    };

                    if batch.is_abandoned() {
                        debug!(stanzas = batch.stanzas().len(), "skipping abandoned batch");
                        continue;
                    }

                    match stream.send(batch.stanzas()).await {
                        Ok(()) => {
                            for stanza in batch.stanzas() {
                                counters::xmpp_stanza_sent(stanza.kind());
                            }
                            self.status
                                .stanzas_out
                                .fetch_add(batch.stanzas().len() as u64, Ordering::Relaxed);
                            batch.complete(Ok(()));
                        }
                        Err(e) => {
                            batch.complete(Err(TransportError::Unavailable));
                            return SessionEnd::Lost(e);
                        }
                    }
                }

                element = stream.next_element() => {
                    let element = match element {
                        Ok(element) => element,
                        Err(e) => return SessionEnd::Lost(e),
                    };

                    let stanza = match Stanza::from_element(&element) {
                        Ok(stanza) => stanza,
                        Err(e) => {
                            warn!(error = %e, element = %element.name(), "dropping malformed stanza");
                            continue;
                        }
                    };

                    counters::xmpp_stanza_received(stanza.kind());
                    self.status.stanzas_in.fetch_add(1, Ordering::Relaxed);

                    if self.events.send(TransportEvent::Stanza(stanza)).await.is_err() {
                        info!("router gone, closing xmpp session");
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow() != ShutdownState::Running
    }
}

/// Start the transport task.
///
/// Returns the send handle, the status shared with the admin server and the
/// task handle.
pub fn start(
    config: XmppConfig,
    events: mpsc::Sender<TransportEvent>,
    shutdown_rx: watch::Receiver<ShutdownState>,
) -> (TransportHandle, Arc<TransportStatus>, JoinHandle<()>) {
    let (handle, outbound) = TransportHandle::channel(config.channel_size, config.send_timeout);
    let status = Arc::new(TransportStatus::default());

    let transport = Transport::new(config, outbound, events, status.clone(), shutdown_rx);
    let task = tokio::spawn(transport.run().instrument(info_span!("xmpp")));

    (handle, status, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::address::Jid;
    use crate::xmpp::{Message, Presence, PresenceType};

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_send_batch_acknowledged() {
        let (handle, mut rx) = TransportHandle::channel(4, Duration::from_secs(1));

        let writer = tokio::spawn(async move {
            let batch = rx.recv().await.unwrap();
            let count = batch.stanzas().len();
            batch.complete(Ok(()));
            count
        });

        handle
            .send_batch(vec![
                Presence::new(PresenceType::Subscribe, jid("a@b"), jid("c@d")).into(),
                Message::chat(jid("a@b"), jid("c@d"), "hi").into(),
            ])
            .await
            .unwrap();

        assert_eq!(writer.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (handle, _rx) = TransportHandle::channel(1, Duration::from_millis(10));
        handle.send_batch(Vec::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_without_writer_ack() {
        let (handle, mut rx) = TransportHandle::channel(4, Duration::from_secs(5));

        let result = handle.send(Message::chat(jid("a@b"), jid("c@d"), "hi")).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));

        let batch = rx.recv().await.unwrap();
        assert!(batch.is_abandoned());
    }

    #[tokio::test]
    async fn test_send_fails_when_transport_gone() {
        let (handle, rx) = TransportHandle::channel(4, Duration::from_secs(1));
        drop(rx);

        let result = handle.send(Message::chat(jid("a@b"), jid("c@d"), "hi")).await;
        assert!(matches!(result, Err(TransportError::Unavailable)));
    }
}
