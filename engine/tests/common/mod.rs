//! Shared fixtures: a login→relay state pair and a fake client that talks
//! to the server through the real codec.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use engine::protocol::{
    CodecLimits, Disconnect, Packet, PacketKind, PacketRegistry, PeerId, Recipients, codec,
};
use engine::{
    ClientLink, Dispatch, EngineConfig, MemoryStoreSink, ServerApp, State, StateContext,
    StateFactory, StateView, TransitionError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub const USERS_MODEL: &str = "users";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Accept {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deny {
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chat {
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhichUsernames {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MyUsername {
    pub username: String,
}

impl PacketKind for Login {
    const KIND: &'static str = "Login";
}

impl PacketKind for Accept {
    const KIND: &'static str = "Accept";
}

impl PacketKind for Deny {
    const KIND: &'static str = "Deny";
}

impl PacketKind for Chat {
    const KIND: &'static str = "Chat";
}

impl PacketKind for Hello {
    const KIND: &'static str = "Hello";
}

impl PacketKind for WhichUsernames {
    const KIND: &'static str = "WhichUsernames";
}

impl PacketKind for MyUsername {
    const KIND: &'static str = "MyUsername";
}

pub fn install_packets(registry: &mut PacketRegistry) {
    registry.register::<Login>();
    registry.register::<Accept>();
    registry.register::<Deny>();
    registry.register::<Chat>();
    registry.register::<Hello>();
    registry.register::<WhichUsernames>();
    registry.register::<MyUsername>();
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub secret: String,
}

pub struct EntryView {
    pub username: Option<String>,
}

/// Initial state: asks peers who is already logged in, validates a `Login`
/// against the `users` model and the live-username set, then transitions
/// into [`RelayState`] carrying the username in its view.
pub struct EntryState {
    ctx: StateContext,
    dispatch: Dispatch<Self>,
    username: Option<String>,
    usernames_in_use: HashSet<String>,
}

impl EntryState {
    pub fn new(ctx: StateContext) -> Self {
        let dispatch = Dispatch::<Self>::new()
            .on::<Login>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_login(packet))
            })
            .on::<MyUsername>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_my_username(packet))
            });
        Self {
            ctx,
            dispatch,
            username: None,
            usernames_in_use: HashSet::new(),
        }
    }

    async fn handle_my_username(&mut self, packet: Packet) {
        if let Some(answer) = packet.body::<MyUsername>() {
            self.usernames_in_use.insert(answer.username.clone());
        }
    }

    async fn handle_login(&mut self, packet: Packet) {
        let Some(login) = packet.body::<Login>().cloned() else {
            return;
        };

        if self.usernames_in_use.contains(&login.username) {
            let _ = self.ctx.send_to_client(
                self.ctx.pid(),
                Deny {
                    reason: "This user is already logged in".to_string(),
                },
            );
            return;
        }

        let stored: Option<UserRecord> = self
            .ctx
            .store()
            .load(USERS_MODEL, &login.username)
            .await
            .ok()
            .flatten()
            .and_then(|bytes| rmp_serde::from_slice(&bytes).ok());

        match stored {
            Some(user) if user.secret == login.password => {
                self.username = Some(login.username);
                let _ = self.ctx.send_to_client(self.ctx.pid(), Accept {});
                let view = self.view();
                self.ctx
                    .change_states(view, |ctx| Box::new(RelayState::new(ctx)) as Box<dyn State>);
            }
            _ => {
                let _ = self.ctx.send_to_client(
                    self.ctx.pid(),
                    Deny {
                        reason: "Invalid username or password".to_string(),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl State for EntryState {
    fn label(&self) -> &'static str {
        "Entry"
    }

    fn context(&self) -> &StateContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut StateContext {
        &mut self.ctx
    }

    fn view(&self) -> StateView {
        StateView::new(
            self.label(),
            EntryView {
                username: self.username.clone(),
            },
        )
    }

    async fn on_transition(&mut self, _previous: Option<StateView>) -> Result<(), TransitionError> {
        self.ctx
            .broadcast_to_peers(true, WhichUsernames {})
            .map_err(|err| TransitionError::Failed {
                state: self.label(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match self.dispatch.get(packet.kind()) {
            Some(handler) => handler(self, packet).await,
            None => self.ctx.drop_unhandled(self.label(), &packet),
        }
    }
}

/// Post-login state: announces itself with a broadcast `Hello`, answers
/// `WhichUsernames` queries with its own name, relays its own client's chat
/// to peers and surfaces peer traffic to its client.
pub struct RelayState {
    ctx: StateContext,
    dispatch: Dispatch<Self>,
    pub username: String,
}

impl RelayState {
    pub fn new(ctx: StateContext) -> Self {
        let dispatch = Dispatch::<Self>::new()
            .on::<Chat>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_chat(packet))
            })
            .on::<Hello>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_hello(packet))
            })
            .on::<Disconnect>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_disconnect(packet))
            })
            .on::<WhichUsernames>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_which_usernames(packet))
            });
        Self {
            ctx,
            dispatch,
            username: String::new(),
        }
    }

    async fn handle_which_usernames(&mut self, packet: Packet) {
        if packet.body::<WhichUsernames>().is_none() {
            return;
        }
        let _ = self.ctx.send_to_peers(
            packet.from_pid,
            false,
            MyUsername {
                username: self.username.clone(),
            },
        );
    }

    async fn handle_chat(&mut self, packet: Packet) {
        let Some(chat) = packet.body::<Chat>().cloned() else {
            return;
        };
        if packet.from_pid == self.ctx.pid() {
            let exclude_sender = packet.to_pid.is_broadcast();
            let _ = self
                .ctx
                .send_to_peers(packet.to_pid.clone(), exclude_sender, chat);
        } else {
            let _ = self.ctx.send_to_client(packet.from_pid, chat);
        }
    }

    async fn handle_hello(&mut self, packet: Packet) {
        let Some(hello) = packet.body::<Hello>().cloned() else {
            return;
        };
        if packet.from_pid != self.ctx.pid() {
            let _ = self.ctx.send_to_client(packet.from_pid, hello);
        }
    }

    async fn handle_disconnect(&mut self, packet: Packet) {
        let Some(disconnect) = packet.body::<Disconnect>().cloned() else {
            return;
        };
        let _ = self.ctx.send_to_client(packet.from_pid, disconnect);
    }
}

#[async_trait]
impl State for RelayState {
    fn label(&self) -> &'static str {
        "Relay"
    }

    fn context(&self) -> &StateContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut StateContext {
        &mut self.ctx
    }

    async fn on_transition(&mut self, previous: Option<StateView>) -> Result<(), TransitionError> {
        let entry: &EntryView = StateView::require(previous.as_ref(), self.label())?;
        self.username = entry
            .username
            .clone()
            .ok_or_else(|| TransitionError::Failed {
                state: self.label(),
                reason: "entry view has no username".to_string(),
            })?;

        self.ctx
            .broadcast_to_peers(
                true,
                Hello {
                    name: self.username.clone(),
                },
            )
            .map_err(|err| TransitionError::Failed {
                state: self.label(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match self.dispatch.get(packet.kind()) {
            Some(handler) => handler(self, packet).await,
            None => self.ctx.drop_unhandled(self.label(), &packet),
        }
    }
}

/// Builds a started server bound to an ephemeral local port.
pub async fn started_server() -> ServerApp {
    let mut config = EngineConfig::default();
    config.network.host = "127.0.0.1".to_string();
    config.network.port = 0;

    let mut server = ServerApp::new(config, Arc::new(MemoryStoreSink::new()));
    server.register_packets(install_packets);
    server.register_models(&[USERS_MODEL]).expect("store worker alive");

    let initial: StateFactory = Arc::new(|ctx| Box::new(EntryState::new(ctx)) as Box<dyn State>);
    server.start(initial).await.expect("server starts");
    server
}

pub async fn seed_user(server: &ServerApp, username: &str, secret: &str) {
    let record = rmp_serde::to_vec_named(&UserRecord {
        username: username.to_string(),
        secret: secret.to_string(),
    })
    .expect("serializable record");
    server
        .store()
        .save(USERS_MODEL, username, record)
        .await
        .expect("seed user");
}

pub async fn ticks(server: &ServerApp, count: usize) {
    for _ in 0..count {
        server.tick().await;
    }
}

/// A fake client attached straight to the server: sends typed packets into
/// the endpoint's inbound queue and reads real encoded frames back.
pub struct TestClient {
    pub pid: PeerId,
    inbound: UnboundedSender<Packet>,
    frames: UnboundedReceiver<Vec<u8>>,
    registry: Arc<PacketRegistry>,
    limits: CodecLimits,
    buffer: Vec<u8>,
}

impl TestClient {
    pub async fn connect(server: &ServerApp) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let conn = server
            .attach_player(ClientLink::new(frames_tx))
            .await
            .expect("attach player");
        Self {
            pid: conn.pid,
            inbound: conn.inbound,
            frames: frames_rx,
            registry: server.registry().clone(),
            limits: server.config().codec_limits(),
            buffer: Vec::new(),
        }
    }

    pub fn send<T: PacketKind>(&self, to_pid: Recipients, exclude_sender: bool, body: T) {
        let packet = Packet::new(&self.registry, self.pid, to_pid, exclude_sender, body)
            .expect("registered kind");
        self.inbound.send(packet).expect("endpoint inbound open");
    }

    /// Drains and decodes everything the server has flushed so far.
    pub fn recv(&mut self) -> Vec<Packet> {
        while let Ok(mut frame) = self.frames.try_recv() {
            self.buffer.append(&mut frame);
        }

        let mut packets = Vec::new();
        while let Some((payload, consumed)) =
            codec::try_decode_frame(&self.buffer, &self.limits).expect("clean framing")
        {
            self.buffer.drain(..consumed);
            packets.push(codec::decode(&self.registry, &payload).expect("decodable record"));
        }
        packets
    }

    pub fn recv_bodies<T: PacketKind + Clone>(&mut self) -> Vec<T> {
        self.recv()
            .iter()
            .filter_map(|packet| packet.body::<T>().cloned())
            .collect()
    }
}

/// Connects a client and walks it through login as `username`.
pub async fn logged_in_client(server: &ServerApp, username: &str) -> TestClient {
    seed_user(server, username, "secret").await;
    let mut client = TestClient::connect(server).await;
    client.send(
        Recipients::Local,
        false,
        Login {
            username: username.to_string(),
            password: "secret".to_string(),
        },
    );
    // One tick to process the login, one to flush the Accept.
    ticks(server, 2).await;
    let accepted = client
        .recv()
        .iter()
        .any(|packet| packet.body::<Accept>().is_some());
    assert!(accepted, "login of '{username}' was not accepted");
    client
}
