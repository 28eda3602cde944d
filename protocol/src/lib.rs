//! Wire-facing types shared by the engine and by client implementations:
//! peer identifiers, the packet envelope, the kind registry and the codec.

pub mod codec;
pub mod packet;
pub mod pid;
pub mod registry;

pub use codec::{CodecError, CodecLimits, FrameError, decode, encode};
pub use packet::{Disconnect, Packet, PacketBody, PacketKind};
pub use pid::{PeerId, Recipients};
pub use registry::{KindId, PacketRegistry};

/// Returns the protocol crate version string.
pub fn protocol_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
