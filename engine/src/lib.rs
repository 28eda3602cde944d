//! Server framework for real-time multiplayer sessions over persistent
//! bidirectional message channels.
//!
//! Connections exchange typed packets and are each driven by a user-defined
//! state machine. A fixed-rate tick loop serializes outbound traffic and
//! routes packets between connections; a separate game-frame loop updates a
//! shared set of world objects. See [`server::ServerApp`] for the entry
//! point.

pub mod config;
pub mod endpoint;
pub mod gateway;
pub mod router;
pub mod schedule;
pub mod server;
pub mod state;
pub mod store;
pub mod world;

pub use protocol;

pub use config::EngineConfig;
pub use endpoint::ClientLink;
pub use schedule::{Schedule, schedule};
pub use server::{PlayerConn, ServerApp, ServerError};
pub use state::{Dispatch, State, StateContext, StateFactory, StateView, TransitionError};
pub use store::{MemoryStoreSink, StoreError, StoreHandle, StoreSink};
pub use world::{WorldHandle, WorldObject};
