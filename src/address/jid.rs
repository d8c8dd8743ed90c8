use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors produced while parsing an XMPP address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JidError {
    #[error("empty address")]
    Empty,
    #[error("address has an empty domain: {0}")]
    EmptyDomain(String),
    #[error("address has an empty local part: {0}")]
    EmptyLocal(String),
    #[error("address has an empty resource: {0}")]
    EmptyResource(String),
}

/// An XMPP address, `local@domain/resource`.
///
/// Component-facing addresses may omit the local part (the component's own
/// domain) and client addresses usually carry a resource. Contact identity is
/// always the bare form, see [`Jid::bare`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse an address string.
    pub fn parse(s: &str) -> Result<Self, JidError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        let (bare, resource) = match s.split_once('/') {
            Some((_, "")) => return Err(JidError::EmptyResource(s.to_string())),
            Some((bare, resource)) => (bare, Some(resource.to_string())),
            None => (s, None),
        };

        let (local, domain) = match bare.split_once('@') {
            Some(("", _)) => return Err(JidError::EmptyLocal(s.to_string())),
            Some((local, domain)) => (Some(local.to_string()), domain),
            None => (None, bare),
        };

        if domain.is_empty() {
            return Err(JidError::EmptyDomain(s.to_string()));
        }

        Ok(Self {
            local,
            domain: domain.to_ascii_lowercase(),
            resource,
        })
    }

    /// Build a bare address from parts.
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: Some(local.into()),
            domain: domain.into().to_ascii_lowercase(),
            resource: None,
        }
    }

    /// Build a domain-only address.
    pub fn domain_only(domain: impl Into<String>) -> Self {
        Self {
            local: None,
            domain: domain.into().to_ascii_lowercase(),
            resource: None,
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address with its resource stripped.
    pub fn bare(&self) -> Jid {
        Self {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Jid::parse(&s).map_err(serde::de::Error::custom)
    }
}
