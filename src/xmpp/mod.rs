//! XMPP side of the gateway: XEP-0114 component stream and stanza types.

mod component;
mod framer;
mod stanza;
mod transport;
mod xml;

pub use component::{handshake_digest, ComponentStream};
pub use framer::{Frame, Framer};
pub use stanza::{
    new_id, ErrorCondition, Iq, IqType, Message, MessageType, Presence, PresenceType, Stanza,
    StanzaError, NS_COMPONENT, NS_DISCO_INFO, NS_NICK, NS_OOB, NS_RECEIPTS, NS_ROSTER, NS_STANZAS,
    NS_VCARD,
};
pub use transport::{
    start, OutboundBatch, Transport, TransportError, TransportEvent, TransportHandle,
    TransportStatus,
};
pub use xml::{Element, XmlError};
