//! Peer identifiers and packet addressing.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of bytes in a peer identifier.
pub const PID_LEN: usize = 16;

/// Opaque per-connection identifier. Generated randomly at accept time and
/// carried as raw bytes on the wire; rendered as base64 for humans.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PID_LEN]);

impl PeerId {
    /// The all-zero sentinel addressing every connected peer. Never issued
    /// to a connection.
    pub const BROADCAST: PeerId = PeerId([0; PID_LEN]);

    /// Returns a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; PID_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PID_LEN] {
        &self.0
    }

    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        let mut i = 0;
        while i < PID_LEN {
            if self.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    /// Parses an identifier from a wire-form byte slice.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, InvalidPeerId> {
        let bytes: [u8; PID_LEN] = bytes
            .try_into()
            .map_err(|_| InvalidPeerId { len: bytes.len() })?;
        Ok(Self(bytes))
    }
}

/// Error returned when a byte slice is not a valid identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer id must be {PID_LEN} bytes, got {len}")]
pub struct InvalidPeerId {
    pub len: usize,
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("EVERYONE")
        } else {
            f.write_str(&BASE64.encode(self.0))
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

// Identifiers travel as raw bytes (msgpack bin), not as integer sequences,
// so Serialize/Deserialize are written out by hand. Decoding stays lenient
// and accepts the integer-sequence form some encoders produce.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct PeerIdVisitor;

impl<'de> Visitor<'de> for PeerIdVisitor {
    type Value = PeerId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PID_LEN} raw bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<PeerId, E> {
        PeerId::try_from_slice(v).map_err(E::custom)
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<PeerId, E> {
        self.visit_bytes(&v)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<PeerId, A::Error> {
        let mut bytes = Vec::with_capacity(PID_LEN);
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        PeerId::try_from_slice(&bytes).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(PeerIdVisitor)
    }
}

/// Destination of a packet envelope.
///
/// `Local` is absent on the wire and names the sender's own counterpart (its
/// client transport when queued by an endpoint, its endpoint when sent by a
/// client); the router never delivers it. Broadcast is a destination equal
/// to [`PeerId::BROADCAST`], directly or inside a list.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Recipients {
    #[default]
    Local,
    One(PeerId),
    Many(Vec<PeerId>),
}

impl Recipients {
    /// True when any resolved destination is the broadcast sentinel.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        match self {
            Recipients::Local => false,
            Recipients::One(pid) => pid.is_broadcast(),
            Recipients::Many(pids) => pids.iter().any(PeerId::is_broadcast),
        }
    }
}

impl From<PeerId> for Recipients {
    fn from(pid: PeerId) -> Self {
        Recipients::One(pid)
    }
}

impl From<Vec<PeerId>> for Recipients {
    fn from(pids: Vec<PeerId>) -> Self {
        Recipients::Many(pids)
    }
}
