use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::jid::Jid;
use super::phone::{PhoneError, PhoneNumber};

/// What to do with addresses and numbers that have no mapping.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedPolicy {
    /// Drop the event silently (info log only).
    #[default]
    Ignore,
    /// Surface a [`MappingError`] to the caller.
    Reject,
}

/// Outcome of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    Mapped(T),
    /// The input is unmapped and policy says to drop it.
    Ignored,
}

impl<T> Resolved<T> {
    pub fn mapped(self) -> Option<T> {
        match self {
            Self::Mapped(value) => Some(value),
            Self::Ignored => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("{0} has no local part to use as a phone number")]
    NoLocalPart(Jid),
    #[error("{address} does not name a phone number: {source}")]
    InvalidPhone {
        address: String,
        #[source]
        source: PhoneError,
    },
    #[error("{0} is not a known user")]
    UnknownUser(Jid),
    #[error("{0} does not belong to a configured user")]
    UnknownNumber(PhoneNumber),
}

/// Static mapping between XMPP addresses and phone numbers.
///
/// Lookups are pure: the tables are fixed at construction. Users are kept in
/// a sorted map so the inverse scan picks the same user for a number on every
/// run, even when two users share it.
#[derive(Debug, Clone)]
pub struct AddressMapper {
    domain: String,
    default_prefix: Option<String>,
    policy: UnmappedPolicy,
    users: BTreeMap<Jid, PhoneNumber>,
    phones: BTreeMap<PhoneNumber, Jid>,
}

impl AddressMapper {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into().to_ascii_lowercase(),
            default_prefix: None,
            policy: UnmappedPolicy::default(),
            users: BTreeMap::new(),
            phones: BTreeMap::new(),
        }
    }

    pub fn with_default_prefix(mut self, prefix: Option<String>) -> Self {
        self.default_prefix = prefix;
        self
    }

    pub fn with_policy(mut self, policy: UnmappedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add a local user and the number it sends from.
    pub fn with_user(mut self, user: Jid, phone: PhoneNumber) -> Self {
        self.users.insert(user.bare(), phone);
        self
    }

    /// Add an explicit number to address mapping.
    pub fn with_phone(mut self, phone: PhoneNumber, address: Jid) -> Self {
        self.phones.insert(phone, address.bare());
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn default_prefix(&self) -> Option<&str> {
        self.default_prefix.as_deref()
    }

    pub fn policy(&self) -> UnmappedPolicy {
        self.policy
    }

    /// Whether the bare form of `address` is a configured user.
    pub fn is_user(&self, address: &Jid) -> bool {
        self.users.contains_key(&address.bare())
    }

    /// Configured users in sorted order.
    pub fn users(&self) -> impl Iterator<Item = (&Jid, &PhoneNumber)> {
        self.users.iter()
    }

    /// Resolve an XMPP address to the phone number it stands for.
    pub fn address_to_phone(&self, address: &Jid) -> Result<Resolved<PhoneNumber>, MappingError> {
        let bare = address.bare();
        if let Some(phone) = self.users.get(&bare) {
            return Ok(Resolved::Mapped(phone.clone()));
        }

        let Some(local) = bare.local() else {
            return self.unmapped(MappingError::NoLocalPart(bare));
        };

        match PhoneNumber::parse_with_prefix(local, self.default_prefix()) {
            Ok(phone) => Ok(Resolved::Mapped(phone)),
            Err(source) => self.unmapped(MappingError::InvalidPhone {
                address: bare.to_string(),
                source,
            }),
        }
    }

    /// Resolve a phone number to the XMPP address that represents it.
    ///
    /// Falls back to `<number>@<component domain>` so any number is reachable.
    pub fn phone_to_address(&self, phone: &PhoneNumber) -> Result<Resolved<Jid>, MappingError> {
        if let Some(address) = self.lookup_number(phone) {
            return Ok(Resolved::Mapped(address));
        }

        let local = phone.without_prefix(self.default_prefix());
        Ok(Resolved::Mapped(Jid::new(local, self.domain.clone())))
    }

    /// Resolve a phone number to the configured user that owns it.
    pub fn phone_to_user(&self, phone: &PhoneNumber) -> Result<Resolved<Jid>, MappingError> {
        match self.lookup_number(phone) {
            Some(address) => Ok(Resolved::Mapped(address)),
            None => self.unmapped(MappingError::UnknownNumber(phone.clone())),
        }
    }

    /// Parse a raw number received from a carrier, honoring the policy.
    pub fn parse_phone(&self, raw: &str) -> Result<Resolved<PhoneNumber>, MappingError> {
        match PhoneNumber::parse_with_prefix(raw, self.default_prefix()) {
            Ok(phone) => Ok(Resolved::Mapped(phone)),
            Err(source) => self.unmapped(MappingError::InvalidPhone {
                address: raw.to_string(),
                source,
            }),
        }
    }

    fn lookup_number(&self, phone: &PhoneNumber) -> Option<Jid> {
        if let Some(address) = self.phones.get(phone) {
            return Some(address.clone());
        }

        self.users
            .iter()
            .find(|(_, number)| *number == phone)
            .map(|(user, _)| user.clone())
    }

    fn unmapped<T>(&self, err: MappingError) -> Result<Resolved<T>, MappingError> {
        match self.policy {
            UnmappedPolicy::Ignore => {
                debug!(reason = %err, "unmapped address ignored");
                Ok(Resolved::Ignored)
            }
            UnmappedPolicy::Reject => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn phone(s: &str) -> PhoneNumber {
        PhoneNumber::parse(s).unwrap()
    }

    fn mapper() -> AddressMapper {
        AddressMapper::new("gateway.example")
            .with_user(jid("alice@gateway.example"), phone("+15559998888"))
            .with_user(jid("bob@example.com"), phone("+15557776666"))
            .with_phone(phone("+15550001111"), jid("carol@example.com"))
    }

    #[test]
    fn test_user_table_first() {
        let m = mapper();
        assert_eq!(
            m.address_to_phone(&jid("alice@gateway.example/laptop")).unwrap(),
            Resolved::Mapped(phone("+15559998888"))
        );
    }

    #[test]
    fn test_local_part_fallback() {
        let m = mapper();
        assert_eq!(
            m.address_to_phone(&jid("+15551230000@gateway.example")).unwrap(),
            Resolved::Mapped(phone("+15551230000"))
        );
    }

    #[test]
    fn test_local_part_with_default_prefix() {
        let m = mapper().with_default_prefix(Some("+1".to_string()));
        assert_eq!(
            m.address_to_phone(&jid("5551230000@gateway.example")).unwrap(),
            Resolved::Mapped(phone("+15551230000"))
        );
        assert_eq!(
            m.phone_to_address(&phone("+15551230000")).unwrap(),
            Resolved::Mapped(jid("5551230000@gateway.example"))
        );
    }

    #[test]
    fn test_unmapped_policy() {
        let ignore = mapper();
        assert_eq!(
            ignore.address_to_phone(&jid("dave@gateway.example")).unwrap(),
            Resolved::Ignored
        );

        let reject = mapper().with_policy(UnmappedPolicy::Reject);
        assert!(matches!(
            reject.address_to_phone(&jid("dave@gateway.example")),
            Err(MappingError::InvalidPhone { .. })
        ));
        assert!(matches!(
            reject.address_to_phone(&jid("gateway.example")),
            Err(MappingError::NoLocalPart(_))
        ));
    }

    #[test]
    fn test_phone_to_address_order() {
        let m = mapper();
        // Explicit table.
        assert_eq!(
            m.phone_to_address(&phone("+15550001111")).unwrap(),
            Resolved::Mapped(jid("carol@example.com"))
        );
        // Inverse of users.
        assert_eq!(
            m.phone_to_address(&phone("+15557776666")).unwrap(),
            Resolved::Mapped(jid("bob@example.com"))
        );
        // Synthesized.
        assert_eq!(
            m.phone_to_address(&phone("+15551230000")).unwrap(),
            Resolved::Mapped(jid("+15551230000@gateway.example"))
        );
    }

    #[test]
    fn test_phone_to_user() {
        let m = mapper();
        assert_eq!(
            m.phone_to_user(&phone("+15559998888")).unwrap(),
            Resolved::Mapped(jid("alice@gateway.example"))
        );
        assert_eq!(m.phone_to_user(&phone("+15551230000")).unwrap(), Resolved::Ignored);

        let reject = mapper().with_policy(UnmappedPolicy::Reject);
        assert!(matches!(
            reject.phone_to_user(&phone("+15551230000")),
            Err(MappingError::UnknownNumber(_))
        ));
    }

    #[test]
    fn test_round_trip_configured() {
        let m = mapper();
        for (user, number) in m.users() {
            let back = m.phone_to_address(number).unwrap().mapped().unwrap();
            assert_eq!(&back, user);
            let forward = m.address_to_phone(&back).unwrap().mapped().unwrap();
            assert_eq!(&forward, number);
        }
    }

    #[test]
    fn test_round_trip_synthesized() {
        let m = mapper();
        let n = phone("+442079460000");
        let address = m.phone_to_address(&n).unwrap().mapped().unwrap();
        assert_eq!(m.address_to_phone(&address).unwrap(), Resolved::Mapped(n));
    }

    #[test]
    fn test_duplicate_numbers_resolve_deterministically() {
        let m = AddressMapper::new("gateway.example")
            .with_user(jid("zed@example.com"), phone("+15550000000"))
            .with_user(jid("amy@example.com"), phone("+15550000000"));

        for _ in 0..10 {
            assert_eq!(
                m.phone_to_user(&phone("+15550000000")).unwrap(),
                Resolved::Mapped(jid("amy@example.com"))
            );
        }
    }
}
