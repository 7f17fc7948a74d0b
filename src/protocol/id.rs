//! Message identifiers
//!
//! An identifier is two ASCII uppercase letters (676 values), chosen freshly
//! per outbound message. Scope is "currently in flight or retained" on one
//! link, not globally unique; the transmit queue is responsible for not
//! reusing an identifier while the previous message is still retained.

use std::fmt;

use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Error, Result};

/// Two-letter message identifier correlating parcels and receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 2]);

impl MessageId {
    /// Construct from raw bytes, validating the uppercase-ASCII alphabet.
    pub fn from_bytes(bytes: [u8; 2]) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_uppercase) {
            Ok(Self(bytes))
        } else {
            Err(Error::InvalidIdentifier { found: bytes })
        }
    }

    /// Parse from a two-character string such as `"AK"`.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            let mut found = [0u8; 2];
            for (slot, byte) in found.iter_mut().zip(bytes) {
                *slot = *byte;
            }
            return Err(Error::InvalidIdentifier { found });
        }
        Self::from_bytes([bytes[0], bytes[1]])
    }

    /// Draw a uniformly random identifier.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let a = rng.gen_range(0..26u8);
        let b = rng.gen_range(0..26u8);
        Self([b'A' + a, b'A' + b])
    }

    /// Raw wire bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("alphabet validated on construction")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct MessageIdVisitor;

impl Visitor<'_> for MessageIdVisitor {
    type Value = MessageId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a two-letter uppercase message identifier")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
        MessageId::parse(value).map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_str(MessageIdVisitor)
    }
}
