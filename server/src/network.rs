//! Server tick loop and per-client session state machine.
//!
//! [`Server`] is generic over [`ServerTransport`], so the same loop runs over
//! UDP in the dedicated server and over loopback queues in singleplayer and
//! tests. One call to [`Server::tick`] is one simulation step:
//!
//! 1. poll the transport and dispatch every event through the session phases
//! 2. integrate physics for every in-game player
//! 3. fire script timers and apply queued script commands
//! 4. send one `StateSnapshot` to every in-game player
//! 5. flush the transport and advance the tick counter
//!
//! [`Server::spawn`] runs that loop on a dedicated thread at a fixed rate.

use crate::client_manager::{ClientManager, SessionPhase};
use crate::game::{BlockChange, GameState};
use crate::scripting::{NoScripts, ScriptCommand, ScriptHooks, ScriptQueue, Timers, WorldView};
use log::{debug, info, warn};
use shared::physics::PlayerBody;
use shared::protocol::{InputFrame, Message, PlayerId, PlayerState, RejectReason};
use shared::transport::{ClientId, ServerTransport, TransportEvent};
use shared::{
    BlockType, DEFAULT_MAX_PLAYERS, DEFAULT_SEED, DEFAULT_TICK_RATE, MAX_HEALTH, PROTOCOL_VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Ticks the loop may fall behind before it stops trying to catch up.
const MAX_TICKS_BEHIND: u32 = 5;

/// Runtime settings of one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_players: usize,
    pub seed: u64,
    /// Directory scanned for map templates and used for map exports.
    pub maps_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_players: DEFAULT_MAX_PLAYERS,
            seed: DEFAULT_SEED,
            maps_dir: None,
        }
    }
}

/// Authoritative game server.
///
/// All world and session state is owned here and only touched from the
/// thread calling [`Server::tick`]. Script hooks are invoked inline from
/// that thread.
pub struct Server<T: ServerTransport> {
    transport: T,
    clients: ClientManager,
    game: GameState,
    config: ServerConfig,
    scripts: Box<dyn ScriptHooks>,
    queue: ScriptQueue,
    timers: Timers,
    tick: u64,
}

impl<T: ServerTransport> Server<T> {
    /// Creates a server whose world is built from `config`: the newest
    /// template in the maps directory, or procedural terrain from the seed.
    pub fn new(config: ServerConfig, transport: T) -> Self {
        let game = GameState::load(config.seed, config.maps_dir.clone());
        Self::with_game(config, transport, game)
    }

    /// Creates a server around an already built world.
    pub fn with_game(mut config: ServerConfig, transport: T, game: GameState) -> Self {
        config.tick_rate = config.tick_rate.max(1);
        Self {
            transport,
            clients: ClientManager::new(config.max_players),
            game,
            config,
            scripts: Box::new(NoScripts),
            queue: ScriptQueue::new(),
            timers: Timers::default(),
            tick: 0,
        }
    }

    pub fn set_script_hooks(&mut self, hooks: Box<dyn ScriptHooks>) {
        self.scripts = hooks;
    }

    /// Handle scripts use to queue world changes.
    pub fn script_queue(&self) -> ScriptQueue {
        self.queue.clone()
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.tick_rate as f64)
    }

    fn dt(&self) -> f32 {
        1.0 / self.config.tick_rate as f32
    }

    /// Runs one simulation step.
    pub fn tick(&mut self) {
        for event in self.transport.poll(Duration::ZERO) {
            self.handle_event(event);
        }

        self.simulate();
        self.run_scripts();
        self.replicate();

        self.transport.flush();
        self.tick += 1;
    }

    /// Runs ticks at the configured rate until `running` is cleared, then
    /// disconnects everyone.
    pub fn run(&mut self, running: &AtomicBool) {
        let interval = self.tick_interval();
        info!("Server running at {} Hz", self.config.tick_rate);

        let mut next_tick = Instant::now();
        while running.load(Ordering::SeqCst) {
            next_tick += interval;
            self.tick();

            let now = Instant::now();
            if now < next_tick {
                thread::sleep(next_tick - now);
            } else if now - next_tick > interval * MAX_TICKS_BEHIND {
                warn!(
                    "Tick {} finished {:?} behind schedule, resetting",
                    self.tick,
                    now - next_tick
                );
                next_tick = now;
            }
        }

        self.shutdown();
    }

    /// Disconnects every client after flushing what is still queued.
    pub fn shutdown(&mut self) {
        let connections: Vec<ClientId> = self.clients.iter().map(|c| c.connection).collect();
        info!("Shutting down, disconnecting {} clients", connections.len());
        self.transport.flush();
        for connection in connections {
            self.transport.disconnect(connection);
        }
        self.transport.flush();
    }

    fn notify(&mut self, hook: impl FnOnce(&mut dyn ScriptHooks, &WorldView<'_>)) {
        let view = WorldView::new(&self.game, &self.clients, self.tick);
        hook(self.scripts.as_mut(), &view);
    }

    fn send_to(&mut self, player_id: PlayerId, message: Message) {
        if let Some(client) = self.clients.get(player_id) {
            self.transport.send(client.connection, &message);
        }
    }

    /// Sends to every in-game client except `exclude`.
    fn broadcast(&mut self, message: Message, exclude: Option<PlayerId>) {
        for client in self.clients.in_game() {
            if Some(client.player_id) != exclude {
                self.transport.send(client.connection, &message);
            }
        }
    }

    fn reject(&mut self, player_id: PlayerId, seq: u32, reason: RejectReason) {
        debug!(
            "Rejecting request {} from player {}: {:?}",
            seq, player_id, reason
        );
        self.send_to(player_id, Message::ActionRejected { seq, reason });
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(connection) => {
                if self.clients.add_client(connection).is_none() {
                    warn!("Server full, dropping connection {}", connection);
                    self.transport.disconnect(connection);
                }
            }
            TransportEvent::Disconnected(connection) => {
                let Some(mut client) = self.clients.remove_connection(connection) else {
                    return;
                };
                let joined = client.is_in_game();
                client.advance(SessionPhase::Disconnecting);
                info!("Player {} ({}) left", client.player_id, client.name);

                if joined {
                    let player_id = client.player_id;
                    self.broadcast(Message::PlayerLeft { player_id }, None);
                    self.notify(|hooks, world| hooks.on_player_leave(world, player_id));
                }
            }
            TransportEvent::Received(connection, message) => {
                if let Some(player_id) = self.clients.player_for(connection) {
                    self.dispatch(player_id, message);
                }
            }
        }
    }

    /// Routes one message through the sender's session phase.
    fn dispatch(&mut self, player_id: PlayerId, message: Message) {
        let Some(phase) = self.clients.get(player_id).map(|c| c.phase) else {
            return;
        };

        match message {
            Message::ClientHello { version, name } => {
                self.handle_hello(player_id, phase, version, name)
            }
            Message::JoinMatch => match phase {
                SessionPhase::Handshaking => self.join(player_id),
                SessionPhase::InGame => debug!("Player {} joined twice", player_id),
                _ => self.reject(player_id, 0, RejectReason::NotAllowed),
            },
            Message::InputFrame(input) => {
                if phase == SessionPhase::InGame {
                    self.handle_input(player_id, input);
                } else {
                    self.reject(player_id, input.seq, RejectReason::NotAllowed);
                }
            }
            Message::TrySetBlock {
                seq,
                x,
                y,
                z,
                block,
            } => {
                if phase == SessionPhase::InGame {
                    self.handle_set_block(player_id, seq, (x, y, z), block);
                } else {
                    self.reject(player_id, seq, RejectReason::NotAllowed);
                }
            }
            Message::TryExportMap { seq, name } => {
                if phase == SessionPhase::InGame {
                    self.handle_export(player_id, seq, &name);
                } else {
                    self.reject(player_id, seq, RejectReason::NotAllowed);
                }
            }
            Message::Heartbeat { client_time_ms } => {
                let server_tick = self.tick;
                self.send_to(
                    player_id,
                    Message::HeartbeatAck {
                        client_time_ms,
                        server_tick,
                    },
                );
            }
            Message::ServerHello { .. }
            | Message::JoinAck { .. }
            | Message::StateSnapshot { .. }
            | Message::RemotePlayers { .. }
            | Message::PlayerJoined { .. }
            | Message::PlayerLeft { .. }
            | Message::BlockPlaced { .. }
            | Message::BlockBroken { .. }
            | Message::ActionRejected { .. }
            | Message::ExportResult { .. }
            | Message::HeartbeatAck { .. }
            | Message::ChatMessage { .. }
            | Message::RoundStarted { .. }
            | Message::RoundEnded { .. } => {
                warn!(
                    "Player {} sent server-only message {}, ignoring",
                    player_id,
                    message.kind()
                );
            }
        }
    }

    fn handle_hello(&mut self, player_id: PlayerId, phase: SessionPhase, version: u32, name: String) {
        if phase != SessionPhase::Connected {
            debug!("Player {} repeated ClientHello", player_id);
            return;
        }
        if version != PROTOCOL_VERSION {
            // No negotiation yet: assume compatible and carry on.
            warn!(
                "Player {} speaks protocol {}, server speaks {}",
                player_id, version, PROTOCOL_VERSION
            );
        }

        if let Some(client) = self.clients.get_mut(player_id) {
            client.name = name;
            client.advance(SessionPhase::Handshaking);
        }
        let hello = Message::ServerHello {
            version: PROTOCOL_VERSION,
            tick_rate: self.config.tick_rate,
            world_seed: self.game.terrain.seed(),
        };
        self.send_to(player_id, hello);
    }

    fn join(&mut self, player_id: PlayerId) {
        let spawn = self.game.spawn_point();
        let body = self.game.spawn_body();
        let Some(client) = self.clients.get_mut(player_id) else {
            return;
        };
        client.body = body;
        client.health = MAX_HEALTH;
        client.advance(SessionPhase::InGame);
        info!(
            "Player {} ({}) joined at ({:.1}, {:.1}, {:.1})",
            player_id, client.name, spawn.x, spawn.y, spawn.z
        );

        self.send_to(player_id, Message::JoinAck { player_id, spawn });
        self.broadcast(Message::PlayerJoined { player_id }, Some(player_id));
        self.notify(|hooks, world| hooks.on_player_join(world, player_id));
        self.notify(|hooks, world| hooks.on_player_spawn(world, player_id));
    }

    fn handle_input(&mut self, player_id: PlayerId, input: InputFrame) {
        if let Some(client) = self.clients.get_mut(player_id) {
            client.set_input(input);
        }
    }

    fn handle_set_block(
        &mut self,
        player_id: PlayerId,
        seq: u32,
        (x, y, z): (i32, i32, i32),
        block: BlockType,
    ) {
        let Some(actor) = self.clients.get(player_id).map(|c| c.body) else {
            return;
        };
        let others: Vec<PlayerBody> = self
            .clients
            .in_game()
            .filter(|c| c.player_id != player_id)
            .map(|c| c.body)
            .collect();

        match self.game.try_set_block(&actor, &others, x, y, z, block) {
            Ok(None) => {}
            Ok(Some(BlockChange::Placed(block))) => {
                debug!(
                    "Player {} placed {:?} at ({}, {}, {})",
                    player_id, block, x, y, z
                );
                self.broadcast(
                    Message::BlockPlaced {
                        x,
                        y,
                        z,
                        block,
                        player_id,
                    },
                    None,
                );
                self.notify(|hooks, world| hooks.on_block_place(world, player_id, (x, y, z), block));
            }
            Ok(Some(BlockChange::Broken)) => {
                debug!("Player {} broke ({}, {}, {})", player_id, x, y, z);
                self.broadcast(Message::BlockBroken { x, y, z, player_id }, None);
                self.notify(|hooks, world| hooks.on_block_break(world, player_id, (x, y, z)));
            }
            Err(reason) => self.reject(player_id, seq, reason),
        }
    }

    fn handle_export(&mut self, player_id: PlayerId, seq: u32, name: &str) {
        if self.game.maps_dir().is_none() {
            self.reject(player_id, seq, RejectReason::ExportUnavailable);
            return;
        }
        let result = match self.game.export_map(name) {
            Ok(file_name) => Message::ExportResult {
                seq,
                success: true,
                file_name,
            },
            Err(e) => {
                warn!("Map export for player {} failed: {}", player_id, e);
                Message::ExportResult {
                    seq,
                    success: false,
                    file_name: String::new(),
                }
            }
        };
        self.send_to(player_id, result);
    }

    fn simulate(&mut self) {
        let dt = self.dt();
        let mut fallen = Vec::new();
        for client in self.clients.iter_mut() {
            if !client.is_in_game() {
                continue;
            }
            let input = client.last_input;
            self.game
                .step_player(&mut client.body, &input, client.jump_held, dt);
            client.jump_held = input.jump;
            if GameState::is_out_of_world(&client.body) {
                fallen.push(client.player_id);
            }
        }

        for player_id in fallen {
            info!("Player {} fell out of the world", player_id);
            self.kill_player(player_id);
        }

        let log_interval = self.config.tick_rate as u64;
        for player_id in self.clients.in_game_ids() {
            if !self.clients.should_log(player_id, self.tick, log_interval) {
                continue;
            }
            if let Some(client) = self.clients.get(player_id) {
                let p = client.body.position;
                debug!(
                    "Player {} at ({:.2}, {:.2}, {:.2}) voxel {:?} ground={}",
                    player_id,
                    p.x,
                    p.y,
                    p.z,
                    GameState::feet_voxel(&client.body),
                    client.body.on_ground
                );
            }
        }
    }

    /// Death followed by an immediate respawn at the spawn point.
    fn kill_player(&mut self, player_id: PlayerId) {
        let body = self.game.spawn_body();
        let Some(client) = self.clients.get_mut(player_id) else {
            return;
        };
        client.health = 0;
        self.notify(|hooks, world| hooks.on_player_death(world, player_id));

        if let Some(client) = self.clients.get_mut(player_id) {
            client.body = body;
            client.health = MAX_HEALTH;
            client.jump_held = false;
        }
        self.notify(|hooks, world| hooks.on_player_spawn(world, player_id));
    }

    fn run_scripts(&mut self) {
        for name in self.timers.due(self.tick) {
            self.notify(|hooks, world| hooks.on_timer(world, &name));
        }
        for command in self.queue.drain() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: ScriptCommand) {
        match command {
            ScriptCommand::SetBlock { x, y, z, block } => {
                if !self.game.set_block(x, y, z, block) {
                    return;
                }
                let message = if block == BlockType::Air {
                    Message::BlockBroken {
                        x,
                        y,
                        z,
                        player_id: 0,
                    }
                } else {
                    Message::BlockPlaced {
                        x,
                        y,
                        z,
                        block,
                        player_id: 0,
                    }
                };
                self.broadcast(message, None);
            }
            ScriptCommand::BroadcastMessage { text } => {
                self.broadcast(Message::ChatMessage { text }, None);
            }
            ScriptCommand::SendMessage { player_id, text } => {
                self.send_to(player_id, Message::ChatMessage { text });
            }
            ScriptCommand::StartRound => {
                if self.game.round_active {
                    return;
                }
                self.game.round += 1;
                self.game.round_active = true;
                let round = self.game.round;
                info!("Round {} started", round);
                self.broadcast(Message::RoundStarted { round }, None);
                self.notify(|hooks, world| hooks.on_round_start(world, round));
            }
            ScriptCommand::EndRound => {
                if !self.game.round_active {
                    return;
                }
                self.game.round_active = false;
                let round = self.game.round;
                info!("Round {} ended", round);
                self.broadcast(Message::RoundEnded { round }, None);
                self.notify(|hooks, world| hooks.on_round_end(world, round));
            }
            ScriptCommand::StartTimer {
                name,
                delay_ticks,
                repeat,
            } => {
                self.timers.start(&name, self.tick, delay_ticks, repeat);
            }
            ScriptCommand::SetPlayerHealth { player_id, health } => {
                let Some(client) = self.clients.get_mut(player_id) else {
                    return;
                };
                client.health = health.min(MAX_HEALTH);
                if health <= 0 && client.is_in_game() {
                    self.kill_player(player_id);
                }
            }
            ScriptCommand::SetPlayerTeam { player_id, team } => {
                if let Some(client) = self.clients.get_mut(player_id) {
                    client.team = team;
                }
            }
            ScriptCommand::TeleportPlayer {
                player_id,
                position,
            } => {
                let valid = position.x.is_finite() && position.y.is_finite() && position.z.is_finite();
                if let Some(client) = self.clients.get_mut(player_id).filter(|_| valid) {
                    client.body = PlayerBody::at(position);
                }
            }
            ScriptCommand::FireEvent { name, payload } => {
                self.notify(|hooks, world| hooks.on_custom_event(world, &name, &payload));
            }
        }
    }

    fn replicate(&mut self) {
        let server_tick = self.tick;
        let mut snapshots = Vec::new();
        let mut players: Vec<PlayerState> = Vec::new();
        for client in self.clients.in_game() {
            snapshots.push((
                client.connection,
                Message::StateSnapshot {
                    server_tick,
                    player_id: client.player_id,
                    position: client.body.position,
                    velocity: client.body.velocity,
                    on_ground: client.body.on_ground,
                    last_input_seq: client.last_input.seq,
                },
            ));
            players.push(client.snapshot());
        }

        for (connection, snapshot) in &snapshots {
            self.transport.send(*connection, snapshot);
        }
        if players.len() > 1 {
            self.broadcast(
                Message::RemotePlayers {
                    server_tick,
                    players,
                },
                None,
            );
        }
    }
}

impl<T: ServerTransport + 'static> Server<T> {
    /// Moves the server onto its own tick thread.
    pub fn spawn(self) -> std::io::Result<ServerHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("server-tick".into())
            .spawn(move || {
                let mut server = self;
                server.run(&flag);
            })?;
        Ok(ServerHandle {
            running,
            thread: Some(thread),
        })
    }
}

/// Owner of a running tick thread.
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The flag the tick thread watches; clearing it stops the server.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Asks the tick thread to stop after the current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the tick thread is still alive and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the server and waits for the tick thread to exit.
    /// Returns false if the tick thread panicked.
    pub fn join(mut self) -> bool {
        self.stop_and_wait()
    }

    fn stop_and_wait(&mut self) -> bool {
        self.stop();
        match self.thread.take().map(JoinHandle::join) {
            Some(Err(_)) => {
                warn!("Server tick thread panicked");
                false
            }
            _ => true,
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop_and_wait();
    }
}
