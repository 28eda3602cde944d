//! Reference chat server: every connection starts in `EntryState` (login or
//! register against the `users` model), then transitions to `LoggedState`
//! where chat is relayed between peers.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Local;
use engine::protocol::{
    Disconnect, Packet, PacketKind, PacketRegistry, PeerId, Recipients,
};
use engine::{
    Dispatch, EngineConfig, MemoryStoreSink, ServerApp, State, StateContext, StateFactory,
    StateView, TransitionError, WorldObject,
};
use serde::{Deserialize, Serialize};

const USERS_MODEL: &str = "users";
const LOGIN_RETRY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Accept {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Deny {
    reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Pid {
    pid: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Motd {
    message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Login {
    username: String,
    password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Register {
    username: String,
    password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Chat {
    message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WhichUsernames {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MyUsername {
    username: String,
}

macro_rules! kind {
    ($ty:ident) => {
        impl PacketKind for $ty {
            const KIND: &'static str = stringify!($ty);
        }
    };
}

kind!(Accept);
kind!(Deny);
kind!(Pid);
kind!(Motd);
kind!(Login);
kind!(Register);
kind!(Chat);
kind!(Hello);
kind!(WhichUsernames);
kind!(MyUsername);

fn install_packets(registry: &mut PacketRegistry) {
    registry.register::<Accept>();
    registry.register::<Deny>();
    registry.register::<Pid>();
    registry.register::<Motd>();
    registry.register::<Login>();
    registry.register::<Register>();
    registry.register::<Chat>();
    registry.register::<Hello>();
    registry.register::<WhichUsernames>();
    registry.register::<MyUsername>();
}

/// Stored under the `users` model, keyed by username. The secret is opaque
/// to the engine; hash it upstream if the deployment needs that.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct UserRecord {
    username: String,
    secret: String,
}

fn push_client<T: PacketKind>(ctx: &StateContext, from_pid: PeerId, body: T) {
    if let Err(err) = ctx.send_to_client(from_pid, body) {
        log::error!("[{}] dropping client packet: {err}", ctx.pid());
    }
}

fn push_peers<T: PacketKind>(
    ctx: &StateContext,
    to_pid: impl Into<Recipients>,
    exclude_sender: bool,
    body: T,
) {
    if let Err(err) = ctx.send_to_peers(to_pid, exclude_sender, body) {
        log::error!("[{}] dropping peer packet: {err}", ctx.pid());
    }
}

/// Seconds the server has been up, advanced by the game-frame loop.
#[derive(Default)]
struct ServerClock {
    uptime: f64,
}

impl WorldObject for ServerClock {
    fn update(&mut self, delta: f64) {
        self.uptime += delta;
    }

    fn unique(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct EntryView {
    username: Option<String>,
}

struct EntryState {
    ctx: StateContext,
    dispatch: Dispatch<Self>,
    username: Option<String>,
    last_failed_login: Option<Instant>,
    usernames_in_use: HashSet<String>,
}

impl EntryState {
    fn new(ctx: StateContext) -> Self {
        let dispatch = Dispatch::<Self>::new()
            .on::<Login>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_login(packet))
            })
            .on::<Register>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_register(packet))
            })
            .on::<MyUsername>(ctx.registry(), |state, packet| {
                Box::pin(state.handle_my_username(packet))
            });
        Self {
            ctx,
            dispatch,
            username: None,
            last_failed_login: None,
            usernames_in_use: HashSet::new(),
        }
    }

    // Answers to the WhichUsernames query sent on transition.
    async fn handle_my_username(&mut self, packet: Packet) {
        if let Some(answer) = packet.body::<MyUsername>() {
            self.usernames_in_use.insert(answer.username.clone());
        }
    }

    fn deny(&self, reason: &str) {
        push_client(
            &self.ctx,
            self.ctx.pid(),
            Deny {
                reason: reason.to_string(),
            },
        );
    }

    async fn load_user(&self, username: &str) -> Option<UserRecord> {
        match self.ctx.store().load(USERS_MODEL, username).await {
            Ok(record) => record.and_then(|bytes| rmp_serde::from_slice(&bytes).ok()),
            Err(err) => {
                log::error!("[{}] user lookup failed: {err}", self.ctx.pid());
                None
            }
        }
    }

    async fn handle_login(&mut self, packet: Packet) {
        let Some(login) = packet.body::<Login>().cloned() else {
            return;
        };

        if let Some(last_failed) = self.last_failed_login {
            if last_failed.elapsed() < LOGIN_RETRY_WINDOW {
                log::warn!("[{}] login throttled", self.ctx.pid());
                self.deny("Too many failed login attempts. Please wait a few seconds.");
                return;
            }
        }

        // Denying a live username is not a failed attempt for the throttle.
        if self.usernames_in_use.contains(&login.username) {
            self.deny("This user is already logged in");
            return;
        }

        match self.load_user(&login.username).await {
            Some(user) if user.secret == login.password => {
                self.username = Some(login.username);
                push_client(&self.ctx, self.ctx.pid(), Accept {});
                let view = self.view();
                self.ctx
                    .change_states(view, |ctx| Box::new(LoggedState::new(ctx)) as Box<dyn State>);
            }
            _ => {
                self.last_failed_login = Some(Instant::now());
                self.deny("Invalid username or password");
            }
        }
    }

    async fn handle_register(&mut self, packet: Packet) {
        let Some(register) = packet.body::<Register>().cloned() else {
            return;
        };

        if self.load_user(&register.username).await.is_some() {
            self.deny("Username already taken");
            return;
        }

        let record = UserRecord {
            username: register.username.clone(),
            secret: register.password,
        };
        let bytes = match rmp_serde::to_vec_named(&record) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("[{}] could not serialize user record: {err}", self.ctx.pid());
                self.deny("Registration is unavailable right now");
                return;
            }
        };

        match self
            .ctx
            .store()
            .save(USERS_MODEL, &register.username, bytes)
            .await
        {
            Ok(()) => {
                log::info!("[{}] registered user '{}'", self.ctx.pid(), record.username);
                push_client(&self.ctx, self.ctx.pid(), Accept {});
            }
            Err(err) => {
                log::error!("[{}] user save failed: {err}", self.ctx.pid());
                self.deny("Registration is unavailable right now");
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
        push_client(&self.ctx, self.ctx.pid(), Pid { pid: self.ctx.pid() });

        let uptime = self
            .ctx
            .world()
            .with_unique(|clock: &ServerClock| clock.uptime)
            .await
            .unwrap_or_default();
        let now = Local::now();
        push_client(
            &self.ctx,
            self.ctx.pid(),
            Motd {
                message: format!(
                    "Welcome! It is {}, and this server has been up for {uptime:.0} seconds.",
                    now.format("%A, %B %d %I:%M %p")
                ),
            },
        );

        // Ask who is already logged in, to refuse double logins later.
        push_peers(&self.ctx, PeerId::BROADCAST, true, WhichUsernames {});
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match self.dispatch.get(packet.kind()) {
            Some(handler) => handler(self, packet).await,
            None => self.ctx.drop_unhandled(self.label(), &packet),
        }
    }
}

struct LoggedState {
    ctx: StateContext,
    dispatch: Dispatch<Self>,
    username: String,
    known_others: HashMap<PeerId, String>,
}

impl LoggedState {
    fn new(ctx: StateContext) -> Self {
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
            known_others: HashMap::new(),
        }
    }

    async fn handle_which_usernames(&mut self, packet: Packet) {
        if packet.body::<WhichUsernames>().is_none() {
            return;
        }
        push_peers(
            &self.ctx,
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
            // Our own client speaking: relay to the addressed peers.
            let exclude_sender = packet.to_pid.is_broadcast();
            push_peers(&self.ctx, packet.to_pid.clone(), exclude_sender, chat);
        } else {
            // A peer speaking: surface it to our client.
            push_client(&self.ctx, packet.from_pid, chat);
        }
    }

    async fn handle_hello(&mut self, packet: Packet) {
        let Some(hello) = packet.body::<Hello>().cloned() else {
            return;
        };
        if packet.from_pid == self.ctx.pid() {
            log::warn!("[{}] received our own hello", self.ctx.pid());
            return;
        }

        if !self.known_others.contains_key(&packet.from_pid) {
            push_client(&self.ctx, packet.from_pid, hello.clone());
            self.known_others.insert(packet.from_pid, hello.name);

            // Introduce ourselves back, directly.
            push_peers(
                &self.ctx,
                packet.from_pid,
                false,
                Hello {
                    name: self.username.clone(),
                },
            );
        }
    }

    async fn handle_disconnect(&mut self, packet: Packet) {
        let Some(disconnect) = packet.body::<Disconnect>().cloned() else {
            return;
        };
        self.known_others.remove(&packet.from_pid);
        push_client(&self.ctx, packet.from_pid, disconnect);
    }
}

#[async_trait]
impl State for LoggedState {
    fn label(&self) -> &'static str {
        "Logged"
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
                username: Some(self.username.clone()),
            },
        )
    }

    async fn on_transition(&mut self, previous: Option<StateView>) -> Result<(), TransitionError> {
        let entry: &EntryView = StateView::require(previous.as_ref(), self.label())?;
        self.username = entry
            .username
            .clone()
            .ok_or_else(|| TransitionError::Failed {
                state: self.label(),
                reason: "no username carried over from the entry view".to_string(),
            })?;

        push_peers(
            &self.ctx,
            PeerId::BROADCAST,
            true,
            Hello {
                name: self.username.clone(),
            },
        );
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match self.dispatch.get(packet.kind()) {
            Some(handler) => handler(self, packet).await,
            None => self.ctx.drop_unhandled(self.label(), &packet),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        dotenvy::from_filename("engine/.env").ok();
    }
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    log::info!("starting chat server");
    log::info!("protocol version: {}", engine::protocol::protocol_version());

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "engine/config/chatd.toml".to_string());
    let config = EngineConfig::load_from_file(&config_path).unwrap_or_else(|err| {
        log::warn!("failed to load config from '{config_path}': {err}; using defaults");
        EngineConfig::default()
    });

    let ticks_per_second = config.ticks.ticks_per_second;
    let game_fps = config.ticks.game_fps;

    let mut server = ServerApp::new(config, Arc::new(MemoryStoreSink::new()));
    server.register_packets(install_packets);
    server.register_models(&[USERS_MODEL])?;
    server.add_world_object(ServerClock::default()).await;

    let initial: StateFactory = Arc::new(|ctx| Box::new(EntryState::new(ctx)) as Box<dyn State>);
    let gateway = server.start(initial).await?;
    log::info!("listening on {}", gateway.local_addr());

    tokio::select! {
        _ = server.run(ticks_per_second) => {}
        _ = server.process_world(game_fps) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            gateway.close();
        }
    }

    Ok(())
}
