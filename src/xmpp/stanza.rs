//! Typed views of the three XMPP stanza kinds.

use thiserror::Error;

use crate::address::{Jid, JidError};

use super::xml::Element;

pub const NS_COMPONENT: &str = "jabber:component:accept";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const NS_RECEIPTS: &str = "urn:xmpp:receipts";
pub const NS_NICK: &str = "http://jabber.org/protocol/nick";
pub const NS_OOB: &str = "jabber:x:oob";
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_VCARD: &str = "vcard-temp";
pub const NS_ROSTER: &str = "jabber:iq:roster";

/// Fresh stanza id: 128 random bits, lowercase hex.
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[derive(Debug, Error)]
pub enum StanzaError {
    #[error("invalid '{attr}' address: {source}")]
    Address {
        attr: &'static str,
        #[source]
        source: JidError,
    },
    #[error("unknown {kind} type: {value}")]
    UnknownType { kind: &'static str, value: String },
    #[error("iq stanza without id")]
    MissingId,
}

/// An `<error/>` child as carried by error-type stanzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCondition {
    /// `cancel`, `modify`, `auth`, `wait` or `continue`.
    pub kind: String,
    pub condition: String,
    pub text: Option<String>,
}

impl ErrorCondition {
    pub fn cancel(condition: impl Into<String>) -> Self {
        Self {
            kind: "cancel".to_string(),
            condition: condition.into(),
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn from_element(el: &Element) -> Self {
        let condition = el
            .children()
            .find(|c| c.namespace() == Some(NS_STANZAS) && c.local_name() != "text")
            .map(|c| c.local_name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = el.child_ns("text", NS_STANZAS).map(Element::text);

        Self {
            kind: el.attr("type").unwrap_or("cancel").to_string(),
            condition,
            text,
        }
    }

    fn to_element(&self) -> Element {
        let mut el = Element::new("error")
            .with_attr("type", self.kind.clone())
            .with_child(Element::ns(self.condition.clone(), NS_STANZAS));
        if let Some(text) = &self.text {
            el.push_child(Element::ns("text", NS_STANZAS).with_text(text.clone()));
        }
        el
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageType {
    #[default]
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("chat") => Self::Chat,
            Some("groupchat") => Self::Groupchat,
            Some("headline") => Self::Headline,
            Some("error") => Self::Error,
            // Unknown values are treated as normal (RFC 6121 5.2.2).
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Headline => "headline",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: MessageType,
    pub body: Option<String>,
    /// XEP-0172 nickname.
    pub nick: Option<String>,
    /// XEP-0066 out-of-band URL.
    pub oob_url: Option<String>,
    /// XEP-0184 `<request/>`.
    pub receipt_request: bool,
    /// XEP-0184 `<received id=.../>`.
    pub receipt_for: Option<String>,
    pub error: Option<ErrorCondition>,
}

impl Message {
    pub fn chat(from: Jid, to: Jid, body: impl Into<String>) -> Self {
        Self {
            id: Some(new_id()),
            from: Some(from),
            to: Some(to),
            kind: MessageType::Chat,
            body: Some(body.into()),
            ..Default::default()
        }
    }

    /// A chat message whose only payload is an out-of-band media link.
    pub fn media(from: Jid, to: Jid, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            oob_url: Some(url.clone()),
            ..Self::chat(from, to, url)
        }
    }

    /// Delivery receipt acknowledging `original_id`.
    pub fn receipt(from: Jid, to: Jid, original_id: impl Into<String>) -> Self {
        Self {
            id: Some(new_id()),
            from: Some(from),
            to: Some(to),
            receipt_for: Some(original_id.into()),
            ..Default::default()
        }
    }

    /// Error-type message carrying a human readable reason.
    pub fn error(from: Jid, to: Jid, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            id: Some(new_id()),
            from: Some(from),
            to: Some(to),
            kind: MessageType::Error,
            error: Some(ErrorCondition::cancel("undefined-condition").with_text(reason.clone())),
            body: Some(reason),
            ..Default::default()
        }
    }

    /// Whether there is anything to deliver: a non-empty body or a media link.
    /// Whitespace is content.
    pub fn has_payload(&self) -> bool {
        self.body.as_deref().is_some_and(|b| !b.is_empty()) || self.oob_url.is_some()
    }

    fn from_element(el: &Element) -> Result<Self, StanzaError> {
        let (from, to) = addresses(el)?;
        Ok(Self {
            id: el.attr("id").map(str::to_string),
            from,
            to,
            kind: MessageType::parse(el.attr("type")),
            body: el.child("body").map(Element::text),
            nick: el.child_ns("nick", NS_NICK).map(Element::text),
            oob_url: el
                .child_ns("x", NS_OOB)
                .and_then(|x| x.child("url"))
                .map(Element::text),
            receipt_request: el.child_ns("request", NS_RECEIPTS).is_some(),
            receipt_for: el
                .child_ns("received", NS_RECEIPTS)
                .and_then(|r| r.attr("id"))
                .map(str::to_string),
            error: el.child("error").map(ErrorCondition::from_element),
        })
    }

    fn to_element(&self) -> Element {
        let mut el = header("message", &self.id, &self.from, &self.to);
        if self.kind != MessageType::Normal {
            el.set_attr("type", self.kind.as_str());
        }
        if let Some(body) = &self.body {
            el.push_child(Element::new("body").with_text(body.clone()));
        }
        if let Some(nick) = &self.nick {
            el.push_child(Element::ns("nick", NS_NICK).with_text(nick.clone()));
        }
        if let Some(url) = &self.oob_url {
            el.push_child(
                Element::ns("x", NS_OOB).with_child(Element::new("url").with_text(url.clone())),
            );
        }
        if self.receipt_request {
            el.push_child(Element::ns("request", NS_RECEIPTS));
        }
        if let Some(id) = &self.receipt_for {
            el.push_child(Element::ns("received", NS_RECEIPTS).with_attr("id", id.clone()));
        }
        if let Some(error) = &self.error {
            el.push_child(error.to_element());
        }
        el
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresenceType {
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn parse(value: Option<&str>) -> Result<Self, StanzaError> {
        Ok(match value {
            None => Self::Available,
            Some("unavailable") => Self::Unavailable,
            Some("subscribe") => Self::Subscribe,
            Some("subscribed") => Self::Subscribed,
            Some("unsubscribe") => Self::Unsubscribe,
            Some("unsubscribed") => Self::Unsubscribed,
            Some("probe") => Self::Probe,
            Some("error") => Self::Error,
            Some(other) => {
                return Err(StanzaError::UnknownType {
                    kind: "presence",
                    value: other.to_string(),
                })
            }
        })
    }

    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::Unavailable => Some("unavailable"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
            Self::Probe => Some("probe"),
            Self::Error => Some("error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: PresenceType,
    pub status: Option<String>,
    pub nick: Option<String>,
}

impl Presence {
    pub fn new(kind: PresenceType, from: Jid, to: Jid) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            kind,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }

    fn from_element(el: &Element) -> Result<Self, StanzaError> {
        let (from, to) = addresses(el)?;
        Ok(Self {
            id: el.attr("id").map(str::to_string),
            from,
            to,
            kind: PresenceType::parse(el.attr("type"))?,
            status: el.child("status").map(Element::text),
            nick: el.child_ns("nick", NS_NICK).map(Element::text),
        })
    }

    fn to_element(&self) -> Element {
        let mut el = header("presence", &self.id, &self.from, &self.to);
        if let Some(kind) = self.kind.as_str() {
            el.set_attr("type", kind);
        }
        if let Some(status) = &self.status {
            el.push_child(Element::new("status").with_text(status.clone()));
        }
        if let Some(nick) = &self.nick {
            el.push_child(Element::ns("nick", NS_NICK).with_text(nick.clone()));
        }
        el
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    fn parse(value: Option<&str>) -> Result<Self, StanzaError> {
        match value {
            Some("get") => Ok(Self::Get),
            Some("set") => Ok(Self::Set),
            Some("result") => Ok(Self::Result),
            Some("error") => Ok(Self::Error),
            other => Err(StanzaError::UnknownType {
                kind: "iq",
                value: other.unwrap_or_default().to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: IqType,
    pub payload: Option<Element>,
    pub error: Option<ErrorCondition>,
}

impl Iq {
    pub fn new(kind: IqType, from: Jid, to: Jid, payload: Option<Element>) -> Self {
        Self {
            id: new_id(),
            from: Some(from),
            to: Some(to),
            kind,
            payload,
            error: None,
        }
    }

    /// Result reply to this request, addressed back to its sender.
    pub fn result(&self, payload: Option<Element>) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind: IqType::Result,
            payload,
            error: None,
        }
    }

    /// Error reply to this request.
    pub fn error_reply(&self, condition: ErrorCondition) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind: IqType::Error,
            payload: self.payload.clone(),
            error: Some(condition),
        }
    }

    /// Namespace of the payload element, if any.
    pub fn payload_ns(&self) -> Option<&str> {
        self.payload.as_ref().and_then(Element::namespace)
    }

    fn from_element(el: &Element) -> Result<Self, StanzaError> {
        let (from, to) = addresses(el)?;
        Ok(Self {
            id: el.attr("id").ok_or(StanzaError::MissingId)?.to_string(),
            from,
            to,
            kind: IqType::parse(el.attr("type"))?,
            payload: el.children().find(|c| c.local_name() != "error").cloned(),
            error: el.child("error").map(ErrorCondition::from_element),
        })
    }

    fn to_element(&self) -> Element {
        let mut el = header("iq", &Some(self.id.clone()), &self.from, &self.to);
        el.set_attr("type", self.kind.as_str());
        if let Some(payload) = &self.payload {
            el.push_child(payload.clone());
        }
        if let Some(error) = &self.error {
            el.push_child(error.to_element());
        }
        el
    }
}

/// A top-level element received on or sent to the component stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
    /// Anything else; logged and ignored by the router.
    Other(Element),
}

impl Stanza {
    pub fn from_element(el: &Element) -> Result<Self, StanzaError> {
        match el.local_name() {
            "message" => Message::from_element(el).map(Self::Message),
            "presence" => Presence::from_element(el).map(Self::Presence),
            "iq" => Iq::from_element(el).map(Self::Iq),
            _ => Ok(Self::Other(el.clone())),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Self::Message(m) => m.to_element(),
            Self::Presence(p) => p.to_element(),
            Self::Iq(iq) => iq.to_element(),
            Self::Other(el) => el.clone(),
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Presence(_) => "presence",
            Self::Iq(_) => "iq",
            Self::Other(_) => "other",
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Self::Message(m) => m.to.as_ref(),
            Self::Presence(p) => p.to.as_ref(),
            Self::Iq(iq) => iq.to.as_ref(),
            Self::Other(_) => None,
        }
    }
}

impl From<Message> for Stanza {
    fn from(m: Message) -> Self {
        Self::Message(m)
    }
}

impl From<Presence> for Stanza {
    fn from(p: Presence) -> Self {
        Self::Presence(p)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Self::Iq(iq)
    }
}

fn addresses(el: &Element) -> Result<(Option<Jid>, Option<Jid>), StanzaError> {
    let parse = |attr: &'static str| {
        el.attr(attr)
            .map(|value| Jid::parse(value).map_err(|source| StanzaError::Address { attr, source }))
            .transpose()
    };
    Ok((parse("from")?, parse("to")?))
}

fn header(name: &str, id: &Option<String>, from: &Option<Jid>, to: &Option<Jid>) -> Element {
    let mut el = Element::new(name);
    if let Some(from) = from {
        el.set_attr("from", from.to_string());
    }
    if let Some(to) = to {
        el.set_attr("to", to.to_string());
    }
    if let Some(id) = id {
        el.set_attr("id", id.clone());
    }
    el
}
