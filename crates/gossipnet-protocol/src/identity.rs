//! Peer identity -- 20 opaque bytes, generated once per running node.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;

/// Fixed-length identifier of a network participant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PeerId::LENGTH]);

impl PeerId {
    pub const LENGTH: usize = 20;

    /// The all-zero id. Never valid as a local identity.
    pub const EMPTY: PeerId = PeerId([0u8; PeerId::LENGTH]);

    pub const fn from_bytes(bytes: [u8; PeerId::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a new random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes != [0u8; Self::LENGTH] {
                return Self(bytes);
            }
        }
    }

    /// Read an id from the front of `buf`. Returns `None` if `buf` is too short.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::LENGTH] = buf.get(..Self::LENGTH)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| ProtocolError::InvalidPeerId(e.to_string()))?;
        let bytes: [u8; Self::LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            ProtocolError::InvalidPeerId(format!(
                "expected {} bytes, got {}",
                Self::LENGTH,
                b.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
