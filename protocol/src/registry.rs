//! Explicit packet-kind registry.
//!
//! The registry is a plain value built at startup and frozen behind an `Arc`
//! once the server begins accepting connections. Kind ids are assigned
//! densely at insertion so decode and per-state dispatch are vector lookups.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::CodecError;
use crate::packet::{Disconnect, PacketBody, PacketKind};

/// Small integer identity of a registered packet kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KindId(u16);

impl KindId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

type DecodeBodyFn = fn(rmpv::Value) -> Result<Arc<dyn PacketBody>, CodecError>;

struct KindEntry {
    name: String,
    decode: DecodeBodyFn,
}

fn decode_body<T: PacketKind>(payload: rmpv::Value) -> Result<Arc<dyn PacketBody>, CodecError> {
    let body: T = rmpv::ext::from_value(payload)
        .map_err(|e| CodecError::Malformed(format!("{} payload does not match schema: {e}", T::KIND)))?;
    Ok(Arc::new(body))
}

/// Name-to-constructor map for every packet kind the process understands.
///
/// Registration is idempotent by name; registering the same name again
/// replaces the constructor but keeps the kind id stable.
pub struct PacketRegistry {
    ids: HashMap<String, KindId>,
    entries: Vec<KindEntry>,
}

impl PacketRegistry {
    /// Creates a registry holding the framework-defined kinds.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            ids: HashMap::new(),
            entries: Vec::new(),
        };
        registry.register::<Disconnect>();
        registry
    }

    /// Registers `T` under its kind tag and returns its id.
    pub fn register<T: PacketKind>(&mut self) -> KindId {
        if let Some(&id) = self.ids.get(T::KIND) {
            self.entries[id.index()].decode = decode_body::<T>;
            return id;
        }
        let id = KindId(self.entries.len() as u16);
        self.entries.push(KindEntry {
            name: T::KIND.to_string(),
            decode: decode_body::<T>,
        });
        self.ids.insert(T::KIND.to_string(), id);
        id
    }

    /// Resolves a wire tag to its kind id.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<KindId> {
        self.ids.get(name).copied()
    }

    /// Resolves a registered type to its kind id.
    #[must_use]
    pub fn kind_id_of<T: PacketKind>(&self) -> Option<KindId> {
        self.lookup(T::KIND)
    }

    /// Returns the wire tag for a kind id.
    #[must_use]
    pub fn name(&self, kind: KindId) -> &str {
        self.entries
            .get(kind.index())
            .map_or("<unregistered>", |entry| entry.name.as_str())
    }

    /// All registered kind tags, in insertion order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn decode_body(
        &self,
        kind: KindId,
        payload: rmpv::Value,
    ) -> Result<Arc<dyn PacketBody>, CodecError> {
        let entry = self
            .entries
            .get(kind.index())
            .ok_or_else(|| CodecError::Unknown(format!("kind id {}", kind.0)))?;
        (entry.decode)(payload)
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
