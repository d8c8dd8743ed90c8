//! Addressing: XMPP addresses, E.164 numbers and the mapping between them.

mod jid;
mod mapper;
mod phone;

pub use jid::{Jid, JidError};
pub use mapper::{AddressMapper, MappingError, Resolved, UnmappedPolicy};
pub use phone::{normalize, PhoneError, PhoneNumber};
