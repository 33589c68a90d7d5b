//! Boundary between the simulation and game-mode scripts.
//!
//! Scripts observe the world through [`ScriptHooks`] callbacks, which run on
//! the tick thread with a read-only [`WorldView`] and must return quickly.
//! They never mutate the world directly: changes are pushed onto a
//! [`ScriptQueue`] and applied by the server once per tick.

use crate::client_manager::ClientManager;
use crate::game::GameState;
use shared::physics::Vec3;
use shared::protocol::PlayerId;
use shared::BlockType;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A world change requested by a script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    SetBlock {
        x: i32,
        y: i32,
        z: i32,
        block: BlockType,
    },
    BroadcastMessage {
        text: String,
    },
    SendMessage {
        player_id: PlayerId,
        text: String,
    },
    StartRound,
    EndRound,
    /// Calls [`ScriptHooks::on_timer`] after `delay_ticks`, and every
    /// `delay_ticks` afterwards when `repeat` is set.
    StartTimer {
        name: String,
        delay_ticks: u64,
        repeat: bool,
    },
    SetPlayerHealth {
        player_id: PlayerId,
        health: i32,
    },
    SetPlayerTeam {
        player_id: PlayerId,
        team: u8,
    },
    TeleportPlayer {
        player_id: PlayerId,
        position: Vec3,
    },
    /// Delivered back to scripts through [`ScriptHooks::on_custom_event`].
    FireEvent {
        name: String,
        payload: String,
    },
}

/// Thread-safe command queue shared between scripts and the server.
#[derive(Debug, Clone, Default)]
pub struct ScriptQueue {
    commands: Arc<Mutex<VecDeque<ScriptCommand>>>,
}

impl ScriptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: ScriptCommand) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(command);
    }

    /// Takes every queued command. Commands pushed while the result is being
    /// applied wait for the next drain.
    pub fn drain(&self) -> Vec<ScriptCommand> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only world access handed to every hook.
pub struct WorldView<'a> {
    game: &'a GameState,
    clients: &'a ClientManager,
    tick: u64,
}

impl<'a> WorldView<'a> {
    pub fn new(game: &'a GameState, clients: &'a ClientManager, tick: u64) -> Self {
        Self {
            game,
            clients,
            tick,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn round(&self) -> u32 {
        self.game.round
    }

    pub fn round_active(&self) -> bool {
        self.game.round_active
    }

    pub fn get_block(&self, x: i32, y: i32, z: i32) -> BlockType {
        self.game.terrain.get_block(x, y, z)
    }

    /// Players currently in the match, in id order.
    pub fn players(&self) -> Vec<PlayerId> {
        self.clients.in_game_ids()
    }

    pub fn player_name(&self, player_id: PlayerId) -> Option<&str> {
        self.clients.get(player_id).map(|c| c.name.as_str())
    }

    pub fn player_position(&self, player_id: PlayerId) -> Option<Vec3> {
        self.clients.get(player_id).map(|c| c.body.position)
    }

    pub fn player_health(&self, player_id: PlayerId) -> Option<i32> {
        self.clients.get(player_id).map(|c| c.health)
    }

    pub fn player_team(&self, player_id: PlayerId) -> Option<u8> {
        self.clients.get(player_id).map(|c| c.team)
    }
}

/// Lifecycle callbacks. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait ScriptHooks: Send {
    fn on_player_join(&mut self, world: &WorldView<'_>, player_id: PlayerId) {}
    fn on_player_leave(&mut self, world: &WorldView<'_>, player_id: PlayerId) {}
    fn on_player_spawn(&mut self, world: &WorldView<'_>, player_id: PlayerId) {}
    fn on_player_death(&mut self, world: &WorldView<'_>, player_id: PlayerId) {}
    fn on_block_place(
        &mut self,
        world: &WorldView<'_>,
        player_id: PlayerId,
        position: (i32, i32, i32),
        block: BlockType,
    ) {
    }
    fn on_block_break(&mut self, world: &WorldView<'_>, player_id: PlayerId, position: (i32, i32, i32)) {}
    fn on_round_start(&mut self, world: &WorldView<'_>, round: u32) {}
    fn on_round_end(&mut self, world: &WorldView<'_>, round: u32) {}
    fn on_timer(&mut self, world: &WorldView<'_>, name: &str) {}
    fn on_custom_event(&mut self, world: &WorldView<'_>, name: &str, payload: &str) {}
}

/// Hooks for servers without a game mode.
#[derive(Debug, Default)]
pub struct NoScripts;

impl ScriptHooks for NoScripts {}

#[derive(Debug, Clone)]
struct Timer {
    name: String,
    due_tick: u64,
    period: Option<u64>,
}

/// Named tick timers started by scripts.
#[derive(Debug, Default)]
pub struct Timers {
    timers: Vec<Timer>,
}

impl Timers {
    /// Starting a timer with a name already in use replaces it.
    pub fn start(&mut self, name: &str, now: u64, delay_ticks: u64, repeat: bool) {
        let delay = delay_ticks.max(1);
        self.timers.retain(|t| t.name != name);
        self.timers.push(Timer {
            name: name.to_string(),
            due_tick: now + delay,
            period: repeat.then_some(delay),
        });
    }

    /// Names of timers due at `now`, in start order. One-shot timers are
    /// removed; repeating ones are rescheduled.
    pub fn due(&mut self, now: u64) -> Vec<String> {
        let mut fired = Vec::new();
        self.timers.retain_mut(|timer| {
            if timer.due_tick > now {
                return true;
            }
            fired.push(timer.name.clone());
            match timer.period {
                Some(period) => {
                    timer.due_tick = now + period;
                    true
                }
                None => false,
            }
        });
        fired
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drains_in_order() {
        let queue = ScriptQueue::new();
        let handle = queue.clone();
        handle.push(ScriptCommand::StartRound);
        handle.push(ScriptCommand::BroadcastMessage { text: "go".into() });
        assert_eq!(queue.len(), 2);

        assert_eq!(
            queue.drain(),
            vec![
                ScriptCommand::StartRound,
                ScriptCommand::BroadcastMessage { text: "go".into() }
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_is_shared_across_threads() {
        let queue = ScriptQueue::new();
        let handle = queue.clone();
        std::thread::spawn(move || handle.push(ScriptCommand::EndRound))
            .join()
            .unwrap();
        assert_eq!(queue.drain(), vec![ScriptCommand::EndRound]);
    }

    #[test]
    fn test_one_shot_timer() {
        let mut timers = Timers::default();
        timers.start("bomb", 10, 5, false);
        assert!(timers.due(14).is_empty());
        assert_eq!(timers.due(15), vec!["bomb".to_string()]);
        assert!(timers.due(20).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_repeating_timer() {
        let mut timers = Timers::default();
        timers.start("wave", 0, 3, true);
        let fired: Vec<u64> = (0..10).filter(|&t| !timers.due(t).is_empty()).collect();
        assert_eq!(fired, vec![3, 6, 9]);
    }

    #[test]
    fn test_restarting_timer_replaces_it() {
        let mut timers = Timers::default();
        timers.start("t", 0, 2, false);
        timers.start("t", 0, 5, false);
        assert_eq!(timers.len(), 1);
        assert!(timers.due(2).is_empty());
        assert_eq!(timers.due(5).len(), 1);
    }

    #[test]
    fn test_zero_delay_fires_next_tick() {
        let mut timers = Timers::default();
        timers.start("now", 7, 0, false);
        assert!(timers.due(7).is_empty());
        assert_eq!(timers.due(8).len(), 1);
    }
}
