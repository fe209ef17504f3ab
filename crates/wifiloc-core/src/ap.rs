//! Access point identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of octets in a hardware address.
const OCTETS: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid access point identifier: {0:?}")]
pub struct InvalidApId(pub String);

/// Normalized hardware address of a WiFi access point.
///
/// Always lowercase, zero-padded and colon-separated (`00:1a:2b:03:04:05`).
/// Ordering is lexical on the normalized form, which every deterministic
/// tie-break in the crate relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApId(String);

impl ApId {
    /// Parse and normalize a hardware address.
    ///
    /// Accepts `:` or `-` separators and one or two hex digits per octet,
    /// since some resolvers report addresses without leading zeros.
    pub fn parse(raw: &str) -> Result<Self, InvalidApId> {
        let trimmed = raw.trim();
        let parts: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();
        if parts.len() != OCTETS {
            return Err(InvalidApId(raw.to_string()));
        }

        let mut normalized = String::with_capacity(OCTETS * 3 - 1);
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(InvalidApId(raw.to_string()));
            }
            if i > 0 {
                normalized.push(':');
            }
            if part.len() == 1 {
                normalized.push('0');
            }
            normalized.push_str(&part.to_ascii_lowercase());
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ApId {
    type Err = InvalidApId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ApId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ApId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
