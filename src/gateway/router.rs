//! The gateway's single consumer loop.
//!
//! The router owns contact and roster state outright and sees every event in
//! arrival order: stanzas from the component stream, carrier events from the
//! webhooks and commands from handles. Carrier sends run in spawned tasks so a
//! slow API never stalls the loop.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::address::{AddressMapper, Jid, MappingError, Resolved};
use crate::bootstrap::ShutdownState;
use crate::contact::ContactTable;
use crate::provider::SmsProvider;
use crate::roster::{Roster, RosterBook, RosterError};
use crate::telemetry::counters;
use crate::xmpp::{
    Element, ErrorCondition, Iq, IqType, Message, MessageType, Presence, PresenceType, Stanza,
    TransportError, TransportEvent, TransportHandle, NS_DISCO_INFO, NS_RECEIPTS, NS_ROSTER,
    NS_VCARD,
};

use super::events::{Command, DeliveryStatus, RouterStats, Sms, SmsEvent, SmsOutcome};
use super::receipts::ReceiptTracker;

const IDENTITY_NAME: &str = "SMS over XMPP";

/// Carrier used by each configured user, keyed by bare address.
pub type ProviderMap = HashMap<Jid, Arc<dyn SmsProvider>>;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("no SMS provider configured for {0}")]
    NoProvider(Jid),
    #[error("xmpp delivery failed: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Roster(#[from] RosterError),
}

/// Everything needed to build a router; cloned for each restart.
#[derive(Debug, Clone)]
pub struct RouterContext {
    pub mapper: Arc<AddressMapper>,
    pub providers: ProviderMap,
    pub receipts: Arc<ReceiptTracker>,
    pub transport: TransportHandle,
    /// Users whose rosters are requested after every connect.
    pub roster_users: Vec<Jid>,
}

/// Receiving ends of the router's queues. Outlives individual routers so a
/// restarted router picks up where the last one stopped.
#[derive(Debug)]
pub struct Inbox {
    pub commands: mpsc::Receiver<Command>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub struct Router {
    component: Jid,
    mapper: Arc<AddressMapper>,
    providers: ProviderMap,
    contacts: ContactTable,
    receipts: Arc<ReceiptTracker>,
    rosters: RosterBook,
    roster_users: Vec<Jid>,
    transport: TransportHandle,
    sends: JoinSet<()>,
}

impl Router {
    pub fn new(ctx: RouterContext) -> Self {
        Self {
            component: Jid::domain_only(ctx.mapper.domain()),
            mapper: ctx.mapper,
            providers: ctx.providers,
            contacts: ContactTable::new(),
            receipts: ctx.receipts,
            rosters: RosterBook::new(),
            roster_users: ctx.roster_users.iter().map(Jid::bare).collect(),
            transport: ctx.transport,
            sends: JoinSet::new(),
        }
    }

    pub fn contacts(&self) -> &ContactTable {
        &self.contacts
    }

    pub fn rosters(&self) -> &RosterBook {
        &self.rosters
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            contacts: self.contacts.len(),
            pending_receipts: self.receipts.len(),
            rosters: self.rosters.len(),
            in_flight_sends: self.sends.len(),
        }
    }

    /// Process events until shutdown, then wait for in-flight sends.
    pub async fn run(mut self, inbox: &mut Inbox, mut shutdown_rx: watch::Receiver<ShutdownState>) {
        info!(domain = %self.component, "router started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() != ShutdownState::Running {
                        info!("router received shutdown signal");
                        break;
                    }
                }

                Some(event) = inbox.events.recv() => {
                    self.on_transport_event(event).await;
                }

                Some(command) = inbox.commands.recv() => {
                    self.on_command(command).await;
                }

                Some(joined) = self.sends.join_next(), if !self.sends.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "send task failed");
                    }
                }
            }
        }

        self.drain().await;
        info!("router stopped");
    }

    /// Wait for every spawned send to finish.
    pub async fn drain(&mut self) {
        if !self.sends.is_empty() {
            debug!(in_flight = self.sends.len(), "waiting for in-flight sends");
        }
        while let Some(joined) = self.sends.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "send task failed");
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Disconnected => debug!("xmpp disconnected"),
            TransportEvent::Stanza(stanza) => self.handle_xmpp(stanza).await,
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Sms {
                provider,
                event,
                reply,
            } => {
                let kind = event.kind();
                let result = self.handle_sms(event).await;
                if let Err(e) = &result {
                    warn!(provider = %provider, kind, error = %e, "sms event failed");
                }
                let _ = reply.send(result);
            }
            Command::ReplaceRoster {
                user,
                roster,
                reply,
            } => {
                let _ = reply.send(self.replace_roster(&user, roster).await);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// A fresh stream: contact state starts over and rosters are re-requested.
    pub async fn on_connected(&mut self) {
        self.contacts.clear();
        self.rosters.clear();

        let requests: Vec<Stanza> = self
            .roster_users
            .iter()
            .map(|user| RosterBook::request(&self.component, user).into())
            .collect();
        if !requests.is_empty() {
            debug!(users = requests.len(), "requesting rosters");
            self.emit(requests).await;
        }
    }

    /// Handle one stanza from the component stream. Failures are reported
    /// to the sender or logged; they never stop the loop.
    pub async fn handle_xmpp(&mut self, stanza: Stanza) {
        match stanza {
            Stanza::Message(message) => self.handle_message(message).await,
            Stanza::Presence(presence) => self.handle_presence(presence).await,
            Stanza::Iq(iq) => self.handle_iq(iq).await,
            Stanza::Other(el) => debug!(element = %el.name(), "ignoring unknown stanza"),
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message.kind {
            MessageType::Chat | MessageType::Normal => {}
            MessageType::Error => {
                info!(from = ?message.from, error = ?message.error, "error message received");
                return;
            }
            other => {
                debug!(kind = other.as_str(), "ignoring message type");
                return;
            }
        }

        if !message.has_payload() {
            debug!(from = ?message.from, "ignoring message without payload");
            return;
        }

        let (Some(from), Some(to)) = (message.from.clone(), message.to.clone()) else {
            debug!("ignoring message without addresses");
            return;
        };

        let to_phone = match self.mapper.address_to_phone(&to) {
            Ok(Resolved::Mapped(phone)) => phone,
            Ok(Resolved::Ignored) => {
                info!(to = %to, "no phone number for recipient, dropping message");
                counters::route_ignored("xmpp");
                return;
            }
            Err(e) => {
                self.reply_error(&to, &from, e.to_string()).await;
                return;
            }
        };

        if !self.mapper.is_user(&from) {
            let reason = MappingError::UnknownUser(from.bare()).to_string();
            self.reply_error(&to, &from, reason).await;
            return;
        }

        let from_phone = match self.mapper.address_to_phone(&from) {
            Ok(Resolved::Mapped(phone)) => phone,
            Ok(Resolved::Ignored) => {
                counters::route_ignored("xmpp");
                return;
            }
            Err(e) => {
                self.reply_error(&to, &from, e.to_string()).await;
                return;
            }
        };

        let Some(provider) = self.providers.get(&from.bare()).cloned() else {
            let reason = RouteError::NoProvider(from.bare()).to_string();
            self.reply_error(&to, &from, reason).await;
            return;
        };

        let intro = self.contacts.on_inbound_chat(&to, &from);
        self.emit(intro).await;

        let body = match (&message.body, &message.oob_url) {
            // Clients repeat the link in the body for non-OOB readers.
            (Some(body), Some(url)) if body.trim() == url => String::new(),
            (Some(body), _) => body.clone(),
            (None, _) => String::new(),
        };
        let sms = Sms {
            from: from_phone,
            to: to_phone,
            body,
            media_urls: message.oob_url.iter().cloned().collect(),
            sender_name: None,
        };

        let receipt = match (message.receipt_request, &message.id) {
            (true, Some(id)) => Some(Message::receipt(to.clone(), from.clone(), id.clone())),
            _ => None,
        };

        let transport = self.transport.clone();
        let receipts = self.receipts.clone();
        let span = info_span!("sms_send", provider = %provider.name(), to = %sms.to);

        self.sends.spawn(
            async move {
                match provider.send(&sms).await {
                    Ok(id) => {
                        counters::sms_sent(provider.name());
                        info!(id = ?id, "sms sent");
                        if let (Some(id), Some(receipt)) = (id, receipt) {
                            receipts.register(id, receipt.into());
                        }
                    }
                    Err(e) => {
                        counters::sms_failed(provider.name());
                        warn!(error = %e, "sms send failed");
                        let reply = Message::error(to, from, format!("Sending SMS failed: {}", e));
                        if let Err(e) = transport.send(reply).await {
                            warn!(error = %e, "could not report send failure");
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn handle_presence(&mut self, presence: Presence) {
        let (Some(from), Some(to)) = (presence.from, presence.to) else {
            debug!("ignoring presence without addresses");
            return;
        };

        if !self.mapper.is_user(&from) {
            warn!(from = %from, kind = ?presence.kind, "rejecting presence from unknown user");
            return;
        }

        let out = match presence.kind {
            PresenceType::Subscribe => {
                let out = self.contacts.on_subscribe(&to, &from);
                if self.emit(out).await {
                    self.contacts.confirm_subscribed(&to, &from);
                }
                return;
            }
            PresenceType::Unsubscribe => self.contacts.on_unsubscribe(&to, &from),
            PresenceType::Subscribed => self.contacts.on_subscribed(&to, &from),
            PresenceType::Unsubscribed => self.contacts.on_unsubscribed(&to, &from),
            PresenceType::Probe => {
                let problem = self.probe_problem(&to);
                self.contacts.on_probe(&to, &from, problem.as_deref())
            }
            PresenceType::Available | PresenceType::Unavailable | PresenceType::Error => {
                debug!(from = %from, kind = ?presence.kind, "ignoring presence");
                return;
            }
        };

        self.emit(out).await;
    }

    /// Why a probed address cannot be online, if it cannot.
    fn probe_problem(&self, to: &Jid) -> Option<String> {
        if to.local().is_none() {
            return None;
        }
        match self.mapper.address_to_phone(to) {
            Ok(Resolved::Mapped(_)) => None,
            Ok(Resolved::Ignored) => Some(format!("{} is not a phone number", to.bare())),
            Err(e) => Some(e.to_string()),
        }
    }

    async fn handle_iq(&mut self, iq: Iq) {
        let reply = match (iq.kind, iq.payload_ns()) {
            (IqType::Get, Some(NS_DISCO_INFO)) => iq.result(Some(disco_info())),
            (IqType::Get, Some(NS_VCARD)) => {
                let vcard = self.vcard(&iq);
                iq.result(Some(vcard))
            }
            (IqType::Result, Some(NS_ROSTER)) => {
                self.ingest_roster(&iq, false);
                return;
            }
            (IqType::Set, Some(NS_ROSTER)) => {
                self.ingest_roster(&iq, true);
                iq.result(None)
            }
            (IqType::Get, _) | (IqType::Set, _) => {
                debug!(ns = ?iq.payload_ns(), from = ?iq.from, "unsupported iq");
                iq.error_reply(ErrorCondition::cancel("service-unavailable"))
            }
            (IqType::Error, _) => {
                warn!(id = %iq.id, from = ?iq.from, error = ?iq.error, "iq error received");
                return;
            }
            (IqType::Result, _) => {
                debug!(id = %iq.id, "ignoring iq result");
                return;
            }
        };

        self.emit(vec![reply.into()]).await;
    }

    fn vcard(&self, iq: &Iq) -> Element {
        let name = match (&iq.to, &iq.from) {
            (Some(local), Some(remote)) => self
                .contacts
                .get(local, remote)
                .and_then(|c| c.local_name.clone())
                .or_else(|| {
                    self.rosters
                        .get(remote)
                        .and_then(|r| r.get(local))
                        .and_then(|item| item.name.clone())
                })
                .unwrap_or_else(|| local.local().unwrap_or(local.domain()).to_string()),
            (Some(local), None) => local.to_string(),
            _ => IDENTITY_NAME.to_string(),
        };

        Element::ns("vCard", NS_VCARD)
            .with_child(Element::new("FN").with_text(name.clone()))
            .with_child(Element::new("NICKNAME").with_text(name))
    }

    fn ingest_roster(&mut self, iq: &Iq, push: bool) {
        let (Some(user), Some(query)) = (iq.from.as_ref(), iq.payload.as_ref()) else {
            return;
        };
        if !self.roster_users.contains(&user.bare()) {
            warn!(from = %user, "ignoring roster from unmanaged user");
            return;
        }

        let roster = if push {
            match self.rosters.ingest_push(user, query) {
                Ok(roster) => roster,
                Err(e) => {
                    warn!(error = %e, "dropping roster push");
                    return;
                }
            }
        } else {
            self.rosters.ingest_result(user, query)
        };

        for (contact, item) in roster.iter() {
            if let Some(name) = &item.name {
                self.contacts.set_local_name(contact, user, name.clone());
            }
        }
    }

    /// Apply one carrier event.
    pub async fn handle_sms(&mut self, event: SmsEvent) -> Result<SmsOutcome, RouteError> {
        match event {
            SmsEvent::Message(sms) => self.deliver_sms(sms).await,
            SmsEvent::Status {
                provider_id,
                status,
            } => self.delivery_status(&provider_id, status).await,
        }
    }

    async fn deliver_sms(&mut self, sms: Sms) -> Result<SmsOutcome, RouteError> {
        let Resolved::Mapped(from) = self.mapper.phone_to_address(&sms.from)? else {
            info!(from = %sms.from, "no address for sender, dropping sms");
            counters::route_ignored("sms");
            return Ok(SmsOutcome::Ignored);
        };
        let Resolved::Mapped(to) = self.mapper.phone_to_user(&sms.to)? else {
            info!(to = %sms.to, "recipient is not a user, dropping sms");
            counters::route_ignored("sms");
            return Ok(SmsOutcome::Ignored);
        };

        let nick = sms
            .sender_name
            .clone()
            .or_else(|| self.contacts.get(&from, &to).and_then(|c| c.local_name.clone()))
            .unwrap_or_else(|| sms.from.to_string());

        let mut batch = self.contacts.on_outbound_chat(&from, &to, Some(nick.as_str()));
        if !sms.body.is_empty() || sms.media_urls.is_empty() {
            batch.push(Message::chat(from.clone(), to.clone(), sms.body).into());
        }
        for url in sms.media_urls {
            batch.push(Message::media(from.clone(), to.clone(), url).into());
        }

        debug!(from = %from, to = %to, stanzas = batch.len(), "delivering sms");
        self.transport.send_batch(batch).await?;
        Ok(SmsOutcome::Delivered)
    }

    async fn delivery_status(
        &mut self,
        provider_id: &str,
        status: DeliveryStatus,
    ) -> Result<SmsOutcome, RouteError> {
        if !status.is_success() {
            debug!(id = %provider_id, status = status.as_str(), "delivery status");
            return Ok(SmsOutcome::Ignored);
        }

        let Some(receipt) = self.receipts.resolve(provider_id) else {
            debug!(id = %provider_id, "no pending receipt");
            return Ok(SmsOutcome::Ignored);
        };

        self.transport.send(receipt).await?;
        Ok(SmsOutcome::ReceiptSent)
    }

    /// Replace a user's roster and push the changes to their server.
    pub async fn replace_roster(&mut self, user: &Jid, roster: Roster) -> Result<usize, RouteError> {
        let pushes = self.rosters.replace(&self.component, user, roster)?;
        let count = pushes.len();
        self.transport
            .send_batch(pushes.into_iter().map(Stanza::from).collect())
            .await?;
        Ok(count)
    }

    async fn reply_error(&self, from: &Jid, to: &Jid, reason: String) {
        info!(to = %to, reason = %reason, "rejecting message");
        self.emit(vec![Message::error(from.clone(), to.clone(), reason).into()])
            .await;
    }

    /// Send stanzas, logging failure. Returns whether they were written.
    async fn emit(&self, stanzas: Vec<Stanza>) -> bool {
        if stanzas.is_empty() {
            return true;
        }
        match self.transport.send_batch(stanzas).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to send stanzas");
                false
            }
        }
    }
}

fn disco_info() -> Element {
    let mut query = Element::ns("query", NS_DISCO_INFO).with_child(
        Element::new("identity")
            .with_attr("category", "gateway")
            .with_attr("type", "sms")
            .with_attr("name", IDENTITY_NAME),
    );
    for feature in [NS_DISCO_INFO, NS_RECEIPTS, NS_VCARD] {
        query.push_child(Element::new("feature").with_attr("var", feature));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::address::PhoneNumber;
    use crate::provider::MockProvider;
    use crate::xmpp::OutboundBatch;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn router() -> (Router, mpsc::Receiver<OutboundBatch>) {
        let (transport, rx) = TransportHandle::channel(16, Duration::from_secs(1));
        let mapper = AddressMapper::new("gateway.example").with_user(
            jid("alice@gateway.example"),
            PhoneNumber::parse("+15559998888").unwrap(),
        );
        let mut providers: ProviderMap = HashMap::new();
        providers.insert(
            jid("alice@gateway.example"),
            Arc::new(MockProvider::success("mock")),
        );

        let router = Router::new(RouterContext {
            mapper: Arc::new(mapper),
            providers,
            receipts: Arc::new(ReceiptTracker::default()),
            transport,
            roster_users: vec![jid("alice@gateway.example")],
        });
        (router, rx)
    }

    /// Acknowledge the next batch and return its stanzas.
    async fn next_batch(rx: &mut mpsc::Receiver<OutboundBatch>) -> Vec<Stanza> {
        let batch = rx.recv().await.unwrap();
        let (stanzas, ack) = batch.into_parts();
        let _ = ack.send(Ok(()));
        stanzas
    }

    fn iq(xml: &str) -> Stanza {
        Stanza::from_element(&Element::parse(xml).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_disco_info() {
        let (mut router, mut rx) = router();
        let handle = tokio::spawn(async move {
            router
                .handle_xmpp(iq(
                    "<iq from='alice@gateway.example/x' to='gateway.example' id='d1' type='get'>\
                     <query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
                ))
                .await;
        });

        let out = next_batch(&mut rx).await;
        handle.await.unwrap();

        let Stanza::Iq(reply) = &out[0] else { panic!("expected iq") };
        assert_eq!(reply.kind, IqType::Result);
        let query = reply.payload.as_ref().unwrap();
        let identity = query.child("identity").unwrap();
        assert_eq!(identity.attr("category"), Some("gateway"));
        assert_eq!(identity.attr("type"), Some("sms"));
        let features: Vec<_> = query
            .children()
            .filter_map(|c| c.attr("var"))
            .collect();
        assert_eq!(features, vec![NS_DISCO_INFO, NS_RECEIPTS, NS_VCARD]);
    }

    #[tokio::test]
    async fn test_unknown_iq_get_is_service_unavailable() {
        let (mut router, mut rx) = router();
        let handle = tokio::spawn(async move {
            router
                .handle_xmpp(iq(
                    "<iq from='alice@gateway.example/x' to='gateway.example' id='v1' type='get'>\
                     <query xmlns='jabber:iq:version'/></iq>",
                ))
                .await;
        });

        let out = next_batch(&mut rx).await;
        handle.await.unwrap();

        let Stanza::Iq(reply) = &out[0] else { panic!("expected iq") };
        assert_eq!(reply.kind, IqType::Error);
        assert_eq!(reply.error.as_ref().unwrap().condition, "service-unavailable");
    }

    #[tokio::test]
    async fn test_roster_result_seeds_vcard_name() {
        let (mut router, mut rx) = router();
        let handle = tokio::spawn(async move {
            router
                .handle_xmpp(iq(
                    "<iq from='alice@gateway.example' to='gateway.example' id='r1' type='result'>\
                     <query xmlns='jabber:iq:roster'>\
                     <item jid='+15551230000@gateway.example' name='Bob'/></query></iq>",
                ))
                .await;
            router
                .handle_xmpp(iq(
                    "<iq from='alice@gateway.example/x' to='+15551230000@gateway.example' \
                     id='v2' type='get'><vCard xmlns='vcard-temp'/></iq>",
                ))
                .await;
            router
        });

        let out = next_batch(&mut rx).await;
        let router = handle.await.unwrap();
        assert_eq!(router.rosters().len(), 1);

        let Stanza::Iq(reply) = &out[0] else { panic!("expected iq") };
        let vcard = reply.payload.as_ref().unwrap();
        assert_eq!(vcard.child("FN").unwrap().text(), "Bob");
        assert_eq!(vcard.child("NICKNAME").unwrap().text(), "Bob");
    }

    #[tokio::test]
    async fn test_connect_requests_rosters() {
        let (mut router, mut rx) = router();
        let handle = tokio::spawn(async move {
            router.on_connected().await;
        });

        let out = next_batch(&mut rx).await;
        handle.await.unwrap();

        let Stanza::Iq(request) = &out[0] else { panic!("expected iq") };
        assert_eq!(request.kind, IqType::Get);
        assert_eq!(request.to, Some(jid("alice@gateway.example")));
        assert_eq!(request.payload_ns(), Some(NS_ROSTER));
    }

    #[tokio::test]
    async fn test_replace_roster_before_result_fails() {
        let (mut router, _rx) = router();
        let err = router
            .replace_roster(&jid("alice@gateway.example"), Roster::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Roster(RosterError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_presence_from_stranger_is_rejected() {
        let (mut router, mut rx) = router();
        router
            .handle_xmpp(
                Presence::new(
                    PresenceType::Subscribe,
                    jid("mallory@evil.example"),
                    jid("+15551230000@gateway.example"),
                )
                .into(),
            )
            .await;

        assert!(rx.try_recv().is_err());
        assert!(router.contacts().is_empty());
    }

    #[tokio::test]
    async fn test_status_other_than_delivered_is_ignored() {
        let (mut router, _rx) = router();
        let outcome = router
            .handle_sms(SmsEvent::Status {
                provider_id: "MOCK1".to_string(),
                status: DeliveryStatus::Enroute,
            })
            .await
            .unwrap();
        assert_eq!(outcome, SmsOutcome::Ignored);
    }
}
