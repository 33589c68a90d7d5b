//! Per-connection session records for the server.
//!
//! Every transport connection gets a [`ClientState`] as soon as it is
//! accepted. The record carries the session phase that gates which messages
//! are honoured, the player's authoritative body and the latest input.
//!
//! Records are keyed by [`PlayerId`]; a second index maps transport
//! [`ClientId`]s back to players so incoming events can be routed.

use log::info;
use shared::physics::PlayerBody;
use shared::protocol::{InputFrame, PlayerId, PlayerState};
use shared::transport::ClientId;
use shared::MAX_HEALTH;
use std::collections::{BTreeMap, HashMap};

/// Where a client is in the session handshake. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    /// Accepted; only `ClientHello` is honoured.
    Connected,
    /// Hello exchanged; waiting for `JoinMatch`.
    Handshaking,
    /// Simulated and replicated every tick.
    InGame,
    /// Leaving; no further messages are processed.
    Disconnecting,
}

/// Authoritative state of one connected client.
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Gameplay identity, assigned when the connection is accepted.
    pub player_id: PlayerId,
    /// Transport id the client's messages arrive on.
    pub connection: ClientId,
    /// Handshake progress; only moves forward.
    pub phase: SessionPhase,
    /// Name announced in `ClientHello`.
    pub name: String,
    /// Authoritative position and velocity.
    pub body: PlayerBody,
    /// Most recent input; later frames replace earlier ones.
    pub last_input: InputFrame,
    /// Jump state of the input applied on the previous tick.
    pub jump_held: bool,
    /// Capped at `MAX_HEALTH`; reaching zero kills and respawns the player.
    pub health: i32,
    /// Team index set by scripts; 0 until assigned.
    pub team: u8,
    /// Tick of the last movement log line for this client.
    pub last_logged_tick: u64,
}

impl ClientState {
    pub fn new(player_id: PlayerId, connection: ClientId) -> Self {
        Self {
            player_id,
            connection,
            phase: SessionPhase::Connected,
            name: String::new(),
            body: PlayerBody::default(),
            last_input: InputFrame::default(),
            jump_held: false,
            health: MAX_HEALTH,
            team: 0,
            last_logged_tick: 0,
        }
    }

    /// Moves to `phase` if it is later than the current one. Returns whether
    /// the phase changed.
    pub fn advance(&mut self, phase: SessionPhase) -> bool {
        if phase > self.phase {
            self.phase = phase;
            true
        } else {
            false
        }
    }

    /// True once the join handshake has completed.
    pub fn is_in_game(&self) -> bool {
        self.phase == SessionPhase::InGame
    }

    /// Stores `input` unless an input with a higher sequence number has
    /// already been seen.
    pub fn set_input(&mut self, input: InputFrame) {
        if input.seq >= self.last_input.seq {
            self.last_input = input;
        }
    }

    /// Public state replicated to other players.
    pub fn snapshot(&self) -> PlayerState {
        PlayerState {
            player_id: self.player_id,
            position: self.body.position,
            velocity: self.body.velocity,
            on_ground: self.body.on_ground,
            health: self.health,
            team: self.team,
        }
    }
}

/// All connected clients of one server.
pub struct ClientManager {
    clients: BTreeMap<PlayerId, ClientState>,
    by_connection: HashMap<ClientId, PlayerId>,
    /// Next id to hand out; ids are never reused.
    next_player_id: PlayerId,
    max_clients: usize,
}

impl ClientManager {
    /// Player ids start from 1 and increment for each accepted connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            by_connection: HashMap::new(),
            next_player_id: 1,
            max_clients,
        }
    }

    /// Registers a new connection. Returns `None` when the server is full or
    /// the connection is already known.
    pub fn add_client(&mut self, connection: ClientId) -> Option<PlayerId> {
        if self.clients.len() >= self.max_clients || self.by_connection.contains_key(&connection)
        {
            return None;
        }

        let player_id = self.next_player_id;
        self.next_player_id += 1;

        self.clients
            .insert(player_id, ClientState::new(player_id, connection));
        self.by_connection.insert(connection, player_id);
        info!("Connection {} registered as player {}", connection, player_id);
        Some(player_id)
    }

    /// Drops the record of a departed connection. The returned state keeps
    /// the phase the client was in when it left.
    pub fn remove_connection(&mut self, connection: ClientId) -> Option<ClientState> {
        let player_id = self.by_connection.remove(&connection)?;
        self.clients.remove(&player_id)
    }

    pub fn player_for(&self, connection: ClientId) -> Option<PlayerId> {
        self.by_connection.get(&connection).copied()
    }

    pub fn get(&self, player_id: PlayerId) -> Option<&ClientState> {
        self.clients.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: PlayerId) -> Option<&mut ClientState> {
        self.clients.get_mut(&player_id)
    }

    /// Clients in player id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientState> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientState> {
        self.clients.values_mut()
    }

    pub fn in_game(&self) -> impl Iterator<Item = &ClientState> {
        self.clients.values().filter(|c| c.is_in_game())
    }

    pub fn in_game_ids(&self) -> Vec<PlayerId> {
        self.in_game().map(|c| c.player_id).collect()
    }

    pub fn in_game_count(&self) -> usize {
        self.in_game().count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Rate limit for per-client movement logs: true at most once every
    /// `interval` ticks per client.
    pub fn should_log(&mut self, player_id: PlayerId, tick: u64, interval: u64) -> bool {
        match self.clients.get_mut(&player_id) {
            Some(client) if tick >= client.last_logged_tick + interval => {
                client.last_logged_tick = tick;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_ids_start_at_one() {
        let mut manager = ClientManager::new(4);
        assert_eq!(manager.add_client(ClientId(7)), Some(1));
        assert_eq!(manager.add_client(ClientId(8)), Some(2));
        assert_eq!(manager.player_for(ClientId(8)), Some(2));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut manager = ClientManager::new(1);
        assert!(manager.add_client(ClientId(1)).is_some());
        assert_eq!(manager.add_client(ClientId(2)), None);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_duplicate_connection_is_rejected() {
        let mut manager = ClientManager::new(4);
        manager.add_client(ClientId(1));
        assert_eq!(manager.add_client(ClientId(1)), None);
    }

    #[test]
    fn test_player_ids_are_not_reused() {
        let mut manager = ClientManager::new(4);
        manager.add_client(ClientId(1));
        let removed = manager.remove_connection(ClientId(1)).unwrap();
        assert_eq!(removed.phase, SessionPhase::Connected);
        assert!(manager.is_empty());
        assert_eq!(manager.add_client(ClientId(2)), Some(2));
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let mut client = ClientState::new(1, ClientId(1));
        assert!(client.advance(SessionPhase::Handshaking));
        assert!(client.advance(SessionPhase::InGame));
        assert!(!client.advance(SessionPhase::Handshaking));
        assert_eq!(client.phase, SessionPhase::InGame);
    }

    #[test]
    fn test_input_is_latest_wins() {
        let mut client = ClientState::new(1, ClientId(1));
        client.set_input(InputFrame {
            seq: 5,
            move_y: 1.0,
            ..InputFrame::default()
        });
        client.set_input(InputFrame {
            seq: 3,
            move_y: -1.0,
            ..InputFrame::default()
        });
        assert_eq!(client.last_input.seq, 5);
        assert_eq!(client.last_input.move_y, 1.0);

        client.set_input(InputFrame {
            seq: 6,
            ..InputFrame::default()
        });
        assert_eq!(client.last_input.seq, 6);
        assert_eq!(client.last_input.move_y, 0.0);
    }

    #[test]
    fn test_in_game_filter() {
        let mut manager = ClientManager::new(4);
        let a = manager.add_client(ClientId(1)).unwrap();
        let b = manager.add_client(ClientId(2)).unwrap();
        manager.get_mut(b).unwrap().advance(SessionPhase::InGame);
        assert_eq!(manager.in_game_ids(), vec![b]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_log_throttling() {
        let mut manager = ClientManager::new(4);
        let id = manager.add_client(ClientId(1)).unwrap();
        assert!(manager.should_log(id, 30, 30));
        assert!(!manager.should_log(id, 45, 30));
        assert!(manager.should_log(id, 60, 30));
        assert!(!manager.should_log(99, 60, 30));
    }
}
