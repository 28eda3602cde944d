//! The packet envelope and the typed-body plumbing behind it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::CodecError;
use crate::pid::{PeerId, Recipients};
use crate::registry::{KindId, PacketRegistry};

/// A user-defined packet body. Implementors are plain serde structs carrying
/// the kind-specific fields; the envelope fields live on [`Packet`].
///
/// `KIND` is the wire tag: the title-case kind name with no suffix, e.g.
/// `"Chat"` or `"Move"`.
pub trait PacketKind:
    Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    const KIND: &'static str;
}

/// Object-safe view of a packet body: `Any` downcast plus generic encoding.
/// Provided for every [`PacketKind`] by a blanket impl; not meant to be
/// implemented by hand.
pub trait PacketBody: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn to_value(&self) -> Result<rmpv::Value, CodecError>;
}

impl<T: PacketKind> PacketBody for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_value(&self) -> Result<rmpv::Value, CodecError> {
        rmpv::ext::to_value(self)
            .map_err(|e| CodecError::Malformed(format!("{}: {e}", T::KIND)))
    }
}

/// One routable packet: addressing envelope plus a typed body.
///
/// The body sits behind an `Arc` so broadcast fan-out clones are cheap and
/// every recipient observes the same record.
#[derive(Clone)]
pub struct Packet {
    kind: KindId,
    pub from_pid: PeerId,
    pub to_pid: Recipients,
    pub exclude_sender: bool,
    body: Arc<dyn PacketBody>,
}

impl Packet {
    /// Builds a packet addressed to the sender's local counterpart.
    pub fn to_local<T: PacketKind>(
        registry: &PacketRegistry,
        from_pid: PeerId,
        body: T,
    ) -> Result<Self, CodecError> {
        Self::new(registry, from_pid, Recipients::Local, false, body)
    }

    /// Builds a packet addressed to one specific peer.
    pub fn to_peer<T: PacketKind>(
        registry: &PacketRegistry,
        from_pid: PeerId,
        to_pid: PeerId,
        body: T,
    ) -> Result<Self, CodecError> {
        Self::new(registry, from_pid, Recipients::One(to_pid), false, body)
    }

    /// Builds a broadcast packet, optionally excluding the sender itself.
    pub fn broadcast<T: PacketKind>(
        registry: &PacketRegistry,
        from_pid: PeerId,
        exclude_sender: bool,
        body: T,
    ) -> Result<Self, CodecError> {
        Self::new(
            registry,
            from_pid,
            Recipients::One(PeerId::BROADCAST),
            exclude_sender,
            body,
        )
    }

    /// Builds a packet with explicit addressing. Fails with
    /// [`CodecError::Unknown`] when the kind was never registered.
    pub fn new<T: PacketKind>(
        registry: &PacketRegistry,
        from_pid: PeerId,
        to_pid: Recipients,
        exclude_sender: bool,
        body: T,
    ) -> Result<Self, CodecError> {
        let kind = registry
            .kind_id_of::<T>()
            .ok_or_else(|| CodecError::Unknown(T::KIND.to_string()))?;
        Ok(Self {
            kind,
            from_pid,
            to_pid,
            exclude_sender,
            body: Arc::new(body),
        })
    }

    /// Used by the decoder, which already resolved the kind id.
    pub(crate) fn from_parts(
        kind: KindId,
        from_pid: PeerId,
        to_pid: Recipients,
        exclude_sender: bool,
        body: Arc<dyn PacketBody>,
    ) -> Self {
        Self {
            kind,
            from_pid,
            to_pid,
            exclude_sender,
            body,
        }
    }

    #[must_use]
    pub fn kind(&self) -> KindId {
        self.kind
    }

    /// Downcasts the body to a concrete kind.
    #[must_use]
    pub fn body<T: PacketKind>(&self) -> Option<&T> {
        self.body.as_any().downcast_ref()
    }

    pub(crate) fn body_value(&self) -> Result<rmpv::Value, CodecError> {
        self.body.to_value()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("from_pid", &self.from_pid)
            .field("to_pid", &self.to_pid)
            .field("exclude_sender", &self.exclude_sender)
            .field("body", &self.body)
            .finish()
    }
}

/// Broadcast by the server when an endpoint departs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Disconnect {
    pub reason: String,
}

impl PacketKind for Disconnect {
    const KIND: &'static str = "Disconnect";
}
