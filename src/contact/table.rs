use std::collections::HashMap;

use tracing::debug;

use crate::address::Jid;
use crate::xmpp::{Presence, PresenceType, Stanza};

use super::state::{Contact, Subscription};

/// Subscription state between phone addresses (local) and users (remote).
///
/// Owned by the router loop and rebuilt for every XMPP connection. Each
/// transition updates the contact and returns the stanzas to send, in order.
#[derive(Debug, Default)]
pub struct ContactTable {
    contacts: HashMap<(Jid, Jid), Contact>,
}

impl ContactTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the contact for `local` as seen by `remote`.
    pub fn contact(&mut self, local: &Jid, remote: &Jid) -> &mut Contact {
        self.contacts
            .entry((local.bare(), remote.bare()))
            .or_default()
    }

    pub fn get(&self, local: &Jid, remote: &Jid) -> Option<&Contact> {
        self.contacts.get(&(local.bare(), remote.bare()))
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
    }

    pub fn set_local_name(&mut self, local: &Jid, remote: &Jid, name: impl Into<String>) {
        self.contact(local, remote).local_name = Some(name.into());
    }

    /// Remote asked to see our presence.
    pub fn on_subscribe(&mut self, local: &Jid, remote: &Jid) -> Vec<Stanza> {
        let contact = self.contact(local, remote);
        if contact.sub_from == Subscription::No {
            contact.sub_from = Subscription::Pending;
        }

        let mut out = vec![
            presence(PresenceType::Subscribed, local, remote),
            presence(PresenceType::Available, local, remote),
        ];

        if contact.sub_to == Subscription::No {
            contact.sub_to = Subscription::Pending;
            out.push(presence(PresenceType::Subscribe, local, remote));
        }

        debug!(local = %local, remote = %remote, sub_from = %contact.sub_from, sub_to = %contact.sub_to, "subscribe");
        out
    }

    /// Our approval of a pending request was delivered.
    pub fn confirm_subscribed(&mut self, local: &Jid, remote: &Jid) {
        let contact = self.contact(local, remote);
        if contact.sub_from == Subscription::Pending {
            contact.sub_from = Subscription::Yes;
        }
    }

    /// Remote no longer wants our presence.
    pub fn on_unsubscribe(&mut self, local: &Jid, remote: &Jid) -> Vec<Stanza> {
        let contact = self.contact(local, remote);
        let was_subscribed = contact.sub_from == Subscription::Yes;
        contact.sub_from = Subscription::No;

        if !was_subscribed {
            return Vec::new();
        }

        vec![
            presence(PresenceType::Unavailable, local, remote),
            presence(PresenceType::Unsubscribed, local, remote),
        ]
    }

    /// Remote approved our request. Always answers with our availability,
    /// even for duplicates.
    pub fn on_subscribed(&mut self, local: &Jid, remote: &Jid) -> Vec<Stanza> {
        let contact = self.contact(local, remote);
        if contact.sub_to == Subscription::Pending {
            contact.sub_to = Subscription::Yes;
        }

        vec![presence(PresenceType::Available, local, remote)]
    }

    /// Remote denied or revoked our subscription.
    pub fn on_unsubscribed(&mut self, local: &Jid, remote: &Jid) -> Vec<Stanza> {
        self.contact(local, remote).sub_to = Subscription::No;
        Vec::new()
    }

    /// Remote probed our presence. `invalid` carries a reason when the
    /// probed address is not a usable phone number.
    pub fn on_probe(&mut self, local: &Jid, remote: &Jid, invalid: Option<&str>) -> Vec<Stanza> {
        self.contact(local, remote);

        let reply = match invalid {
            None => presence(PresenceType::Available, local, remote),
            Some(reason) => Presence::new(PresenceType::Error, local.clone(), remote.clone())
                .with_status(reason)
                .into(),
        };
        vec![reply]
    }

    /// The user sent us a message. Ask for their presence if we never have.
    pub fn on_inbound_chat(&mut self, local: &Jid, remote: &Jid) -> Vec<Stanza> {
        let contact = self.contact(local, remote);
        contact.introduced = true;

        if contact.sub_to != Subscription::No {
            return Vec::new();
        }

        contact.sub_to = Subscription::Pending;
        vec![presence(PresenceType::Subscribe, local, remote)]
    }

    /// We are about to deliver an SMS to the user. Returns the stanzas that
    /// must precede the message; the nickname is only offered to strangers.
    pub fn on_outbound_chat(&mut self, local: &Jid, remote: &Jid, nick: Option<&str>) -> Vec<Stanza> {
        let contact = self.contact(local, remote);
        let stranger = contact.is_stranger();
        contact.introduced = true;

        if contact.sub_to != Subscription::No {
            return Vec::new();
        }

        contact.sub_to = Subscription::Pending;
        let mut subscribe = Presence::new(PresenceType::Subscribe, local.clone(), remote.bare());
        if let (true, Some(nick)) = (stranger, nick) {
            subscribe = subscribe.with_nick(nick);
        }
        vec![subscribe.into()]
    }
}

/// Subscription requests and answers go to the bare JID; availability goes
/// to whichever address we were given.
fn presence(kind: PresenceType, from: &Jid, to: &Jid) -> Stanza {
    let to = match kind {
        PresenceType::Subscribe | PresenceType::Subscribed | PresenceType::Unsubscribed => {
            to.bare()
        }
        _ => to.clone(),
    };
    Presence::new(kind, from.clone(), to).into()
}
