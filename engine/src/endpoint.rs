//! Per-connection endpoints.
//!
//! An endpoint owns the three queues of one connection, its current state
//! and, for player connections, the link to the transport writer. NPC
//! endpoints are the same thing with no link.

use std::sync::Arc;

use protocol::{Packet, PacketRegistry, PeerId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::state::{State, StateContext, StateView, TransitionError};
use crate::store::StoreHandle;
use crate::world::WorldHandle;

/// Returned when the transport writer behind a link has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client link closed")]
pub struct LinkClosed;

/// Sender half of a player connection: encoded frames pushed here are
/// drained by the connection's transport writer task.
pub struct ClientLink {
    frames: UnboundedSender<Vec<u8>>,
}

impl ClientLink {
    #[must_use]
    pub fn new(frames: UnboundedSender<Vec<u8>>) -> Self {
        Self { frames }
    }

    pub fn send(&self, frame: Vec<u8>) -> Result<(), LinkClosed> {
        self.frames.send(frame).map_err(|_| LinkClosed)
    }
}

pub(crate) struct Endpoint {
    pid: PeerId,
    inbound_tx: UnboundedSender<Packet>,
    inbound: UnboundedReceiver<Packet>,
    peers: UnboundedReceiver<Packet>,
    client: UnboundedReceiver<Packet>,
    state: Option<Box<dyn State>>,
    link: Option<ClientLink>,
    context: StateContext,
}

impl Endpoint {
    pub(crate) fn new(
        pid: PeerId,
        link: Option<ClientLink>,
        registry: Arc<PacketRegistry>,
        world: WorldHandle,
        store: StoreHandle,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let (client_tx, client) = mpsc::unbounded_channel();
        let context = StateContext::new(pid, registry, peers_tx, client_tx, world, store);
        Self {
            pid,
            inbound_tx,
            inbound,
            peers,
            client,
            state: None,
            link,
            context,
        }
    }

    pub(crate) fn pid(&self) -> PeerId {
        self.pid
    }

    pub(crate) fn is_player(&self) -> bool {
        self.link.is_some()
    }

    /// Producer handle for this endpoint's inbound queue.
    pub(crate) fn inbound_sender(&self) -> UnboundedSender<Packet> {
        self.inbound_tx.clone()
    }

    /// Appends a routed packet to the inbound queue.
    pub(crate) fn push_inbound(&self, packet: Packet) {
        if self.inbound_tx.send(packet).is_err() {
            log::debug!("[{}] inbound queue is gone; packet dropped", self.pid);
        }
    }

    /// Transitions into the initial state built by `build`.
    pub(crate) async fn start<F>(&mut self, build: F) -> Result<(), TransitionError>
    where
        F: FnOnce(StateContext) -> Box<dyn State>,
    {
        let state = build(self.context.fork());
        self.change_state(state, None).await
    }

    /// Swaps in `next` and runs its transition with the previous view.
    pub(crate) async fn change_state(
        &mut self,
        next: Box<dyn State>,
        previous: Option<StateView>,
    ) -> Result<(), TransitionError> {
        log::debug!("[{}] entering state '{}'", self.pid, next.label());
        self.state = Some(next);
        if let Some(state) = self.state.as_mut() {
            state.on_transition(previous).await?;
        }
        self.apply_pending().await
    }

    /// Drains the inbound queue through the current state. Each handler may
    /// request a state change, applied before the next packet is dispatched.
    pub(crate) async fn process_inbound(&mut self) -> Result<(), TransitionError> {
        while let Ok(packet) = self.inbound.try_recv() {
            match self.state.as_mut() {
                Some(state) => state.handle_packet(packet).await,
                None => {
                    log::warn!("[{}] packet arrived before the first state; dropped", self.pid);
                }
            }
            self.apply_pending().await?;
        }
        Ok(())
    }

    async fn apply_pending(&mut self) -> Result<(), TransitionError> {
        while let Some(pending) = self
            .state
            .as_mut()
            .and_then(|state| state.context_mut().take_pending())
        {
            let next = (pending.build)(self.context.fork());
            log::debug!("[{}] entering state '{}'", self.pid, next.label());
            self.state = Some(next);
            if let Some(state) = self.state.as_mut() {
                state.on_transition(Some(pending.view)).await?;
            }
        }
        Ok(())
    }

    pub(crate) fn pop_peer_head(&mut self) -> Option<Packet> {
        self.peers.try_recv().ok()
    }

    pub(crate) fn pop_client_head(&mut self) -> Option<Packet> {
        self.client.try_recv().ok()
    }

    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> Result<(), LinkClosed> {
        match &self.link {
            Some(link) => link.send(frame),
            None => Err(LinkClosed),
        }
    }

    pub(crate) async fn run_disconnect_hook(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.on_disconnect().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_inbound(&mut self) -> Vec<Packet> {
        let mut drained = Vec::new();
        while let Ok(packet) = self.inbound.try_recv() {
            drained.push(packet);
        }
        drained
    }
}
