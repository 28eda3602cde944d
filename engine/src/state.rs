//! Per-connection state machine.
//!
//! A connection is always in exactly one user-defined state. States receive
//! inbound packets through a dispatch table keyed by registered kind id,
//! enqueue outbound packets through plain handles, and hand a typed view of
//! themselves to their successor when they transition.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use protocol::{CodecError, KindId, Packet, PacketKind, PacketRegistry, PeerId, Recipients};
use tokio::sync::mpsc::UnboundedSender;

use crate::store::StoreHandle;
use crate::world::WorldHandle;

/// Snapshot of a state's public fields, tagged by the state that built it.
/// The record travels type-erased; the receiving state downcasts it and
/// fails its transition when the tag does not match what it expects.
#[derive(Clone)]
pub struct StateView {
    tag: &'static str,
    record: Arc<dyn Any + Send + Sync>,
}

impl StateView {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(tag: &'static str, record: T) -> Self {
        Self {
            tag,
            record: Arc::new(record),
        }
    }

    /// View of a state with no public fields.
    #[must_use]
    pub fn empty(tag: &'static str) -> Self {
        Self::new(tag, ())
    }

    #[must_use]
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    #[must_use]
    pub fn record<T: Any>(&self) -> Option<&T> {
        self.record.downcast_ref()
    }

    /// Resolves the record a transitioning state requires, failing the
    /// transition when the previous view is absent or of the wrong shape.
    pub fn require<'a, T: Any>(
        view: Option<&'a StateView>,
        state: &'static str,
    ) -> Result<&'a T, TransitionError> {
        let view = view.ok_or(TransitionError::ViewMismatch {
            state,
            got: "<none>",
        })?;
        view.record::<T>().ok_or(TransitionError::ViewMismatch {
            state,
            got: view.tag,
        })
    }
}

impl fmt::Debug for StateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateView").field("tag", &self.tag).finish()
    }
}

/// A state that cannot initialize is fatal to its endpoint; the server
/// answers with a disconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("state '{state}' cannot start from previous view '{got}'")]
    ViewMismatch {
        state: &'static str,
        got: &'static str,
    },

    #[error("transition into '{state}' failed: {reason}")]
    Failed { state: &'static str, reason: String },
}

type BuildState = Box<dyn FnOnce(StateContext) -> Box<dyn State> + Send + Sync>;

/// A state swap requested by a running handler, applied by the endpoint
/// once the handler returns. The view is snapshotted at request time so
/// later mutations in the handler body do not leak into the hand-off.
pub struct PendingTransition {
    pub(crate) view: StateView,
    pub(crate) build: BuildState,
}

/// Handles a state receives from its endpoint: identity, queue producers,
/// the world set, the store and the packet registry. Plain non-owning
/// handles only; the endpoint owns the state, never the reverse.
pub struct StateContext {
    pid: PeerId,
    registry: Arc<PacketRegistry>,
    peers: UnboundedSender<Packet>,
    client: UnboundedSender<Packet>,
    world: WorldHandle,
    store: StoreHandle,
    pending: Option<PendingTransition>,
}

impl StateContext {
    pub(crate) fn new(
        pid: PeerId,
        registry: Arc<PacketRegistry>,
        peers: UnboundedSender<Packet>,
        client: UnboundedSender<Packet>,
        world: WorldHandle,
        store: StoreHandle,
    ) -> Self {
        Self {
            pid,
            registry,
            peers,
            client,
            world,
            store,
            pending: None,
        }
    }

    #[must_use]
    pub fn pid(&self) -> PeerId {
        self.pid
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn world(&self) -> &WorldHandle {
        &self.world
    }

    #[must_use]
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Queues a packet for other endpoints via the next tick's routing pass.
    pub fn send_to_peers<T: PacketKind>(
        &self,
        to_pid: impl Into<Recipients>,
        exclude_sender: bool,
        body: T,
    ) -> Result<(), CodecError> {
        let packet = Packet::new(&self.registry, self.pid, to_pid.into(), exclude_sender, body)?;
        self.enqueue_peers(packet);
        Ok(())
    }

    /// Queues a packet for every endpoint, optionally excluding this one.
    pub fn broadcast_to_peers<T: PacketKind>(
        &self,
        exclude_sender: bool,
        body: T,
    ) -> Result<(), CodecError> {
        self.send_to_peers(PeerId::BROADCAST, exclude_sender, body)
    }

    /// Queues a packet for this endpoint's own client. `from_pid` is
    /// explicit because forwarded packets keep their original sender.
    pub fn send_to_client<T: PacketKind>(
        &self,
        from_pid: PeerId,
        body: T,
    ) -> Result<(), CodecError> {
        let packet = Packet::to_local(&self.registry, from_pid, body)?;
        self.enqueue_client(packet);
        Ok(())
    }

    /// Queues an already-built packet on the peer-bound queue.
    pub fn enqueue_peers(&self, packet: Packet) {
        if self.peers.send(packet).is_err() {
            log::debug!("[{}] peer send queue is gone; packet dropped", self.pid);
        }
    }

    /// Queues an already-built packet on the client-bound queue.
    pub fn enqueue_client(&self, packet: Packet) {
        if self.client.send(packet).is_err() {
            log::debug!("[{}] client send queue is gone; packet dropped", self.pid);
        }
    }

    /// Requests a state change. `view` is the current state's snapshot; the
    /// endpoint builds the successor from a fresh copy of these handles and
    /// runs its `on_transition` before the next packet is dispatched.
    pub fn change_states<F>(&mut self, view: StateView, build: F)
    where
        F: FnOnce(StateContext) -> Box<dyn State> + Send + Sync + 'static,
    {
        if self.pending.is_some() {
            log::warn!("[{}] replacing an already pending state transition", self.pid);
        }
        self.pending = Some(PendingTransition {
            view,
            build: Box::new(build),
        });
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingTransition> {
        self.pending.take()
    }

    pub(crate) fn fork(&self) -> Self {
        Self {
            pid: self.pid,
            registry: self.registry.clone(),
            peers: self.peers.clone(),
            client: self.client.clone(),
            world: self.world.clone(),
            store: self.store.clone(),
            pending: None,
        }
    }

    /// Default sink for packets the current state declares no handler for.
    pub fn drop_unhandled(&self, state: &str, packet: &Packet) {
        log::warn!(
            "[{}] state '{state}' has no handler for '{}' packets",
            self.pid,
            self.registry.name(packet.kind()),
        );
    }
}

/// Packet handler entry: a plain fn pointer so tables are `Copy`-cheap.
pub type Handler<S> = for<'a> fn(&'a mut S, Packet) -> BoxFuture<'a, ()>;

/// Per-state dispatch table from kind id to handler, built at state
/// construction. Kind ids are dense, so lookup is a vector index.
pub struct Dispatch<S> {
    table: Vec<Option<Handler<S>>>,
}

impl<S> Dispatch<S> {
    #[must_use]
    pub fn new() -> Self {
        Self { table: Vec::new() }
    }

    /// Routes packets of kind `T` to `handler`. A kind missing from the
    /// registry can never arrive, so its handler is ignored with a warning.
    #[must_use]
    pub fn on<T: PacketKind>(mut self, registry: &PacketRegistry, handler: Handler<S>) -> Self {
        match registry.kind_id_of::<T>() {
            Some(kind) => {
                let index = kind.index();
                if self.table.len() <= index {
                    self.table.resize(index + 1, None);
                }
                self.table[index] = Some(handler);
            }
            None => {
                log::warn!("packet kind '{}' is not registered; handler ignored", T::KIND);
            }
        }
        self
    }

    #[must_use]
    pub fn get(&self, kind: KindId) -> Option<Handler<S>> {
        self.table.get(kind.index()).copied().flatten()
    }
}

impl<S> Default for Dispatch<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// One state of a connection's machine.
///
/// Implementations own their [`StateContext`] and typically a
/// [`Dispatch<Self>`] table; `handle_packet` resolves the table and falls
/// back to [`StateContext::drop_unhandled`].
#[async_trait]
pub trait State: Send + 'static {
    fn label(&self) -> &'static str;

    fn context(&self) -> &StateContext;

    fn context_mut(&mut self) -> &mut StateContext;

    /// Snapshot of this state's public fields for the next state.
    fn view(&self) -> StateView {
        StateView::empty(self.label())
    }

    /// Runs when the endpoint enters this state. `previous` is `None` for
    /// the initial transition. Errors are fatal to the endpoint.
    async fn on_transition(&mut self, previous: Option<StateView>) -> Result<(), TransitionError> {
        let _ = previous;
        Ok(())
    }

    /// Dispatches one inbound packet.
    async fn handle_packet(&mut self, packet: Packet);

    /// Runs while the endpoint is being torn down.
    async fn on_disconnect(&mut self) {}
}

/// Factory for the state every new connection starts in.
pub type StateFactory = Arc<dyn Fn(StateContext) -> Box<dyn State> + Send + Sync>;
