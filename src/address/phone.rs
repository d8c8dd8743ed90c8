use std::fmt;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Shortest and longest digit counts accepted for an E.164 number.
pub const MIN_DIGITS: usize = 2;
pub const MAX_DIGITS: usize = 15;

/// International dialing prefix used by North American address books.
const INTERNATIONAL_PREFIX: &str = "011";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("phone number has no digits: {0:?}")]
    NoDigits(String),
    #[error("phone number too short: {0}")]
    TooShort(String),
    #[error("phone number too long: {0}")]
    TooLong(String),
}

/// Normalize a free-form phone number to `+<digits>`.
///
/// A leading `011` is removed, every non-digit is dropped and a single `+` is
/// prepended. The result is stable under repeated application.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim_start();
    let trimmed = trimmed.strip_prefix(INTERNATIONAL_PREFIX).unwrap_or(trimmed);

    let mut out = String::with_capacity(trimmed.len() + 1);
    out.push('+');
    out.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    out
}

/// A validated E.164 phone number, always `+` followed by 2 to 15 digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize and validate.
    pub fn parse(raw: &str) -> Result<Self, PhoneError> {
        let normalized = normalize(raw);
        let digits = normalized.len() - 1;

        if digits == 0 {
            return Err(PhoneError::NoDigits(raw.to_string()));
        }
        if digits < MIN_DIGITS {
            return Err(PhoneError::TooShort(normalized));
        }
        if digits > MAX_DIGITS {
            return Err(PhoneError::TooLong(normalized));
        }

        Ok(Self(normalized))
    }

    /// Parse a number that may be written without its country code.
    ///
    /// When `raw` has no leading `+`, `default_prefix` (such as `+1`) is
    /// prepended before normalizing.
    pub fn parse_with_prefix(raw: &str, default_prefix: Option<&str>) -> Result<Self, PhoneError> {
        match default_prefix {
            Some(prefix) if !raw.trim_start().starts_with('+') => {
                Self::parse(&format!("{}{}", prefix, raw.trim_start()))
            }
            _ => Self::parse(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits without the leading `+`.
    pub fn digits(&self) -> &str {
        &self.0[1..]
    }

    /// The number with `default_prefix` removed, for use as a friendly local
    /// part. Numbers outside the default country keep their full form.
    pub fn without_prefix(&self, default_prefix: Option<&str>) -> &str {
        default_prefix
            .and_then(|prefix| self.0.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(&self.0)
    }

    /// Whether the number uses the given country calling code, e.g. `"1"`.
    pub fn has_country_code(&self, code: &str) -> bool {
        self.digits().starts_with(code)
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PhoneNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PhoneNumber::parse(&s).map_err(serde::de::Error::custom)
    }
}
