//! Messages exchanged between clients and the server.
//!
//! [`Message`] is the closed set of everything that travels over a
//! transport. Each variant maps to exactly one [`Channel`]; the mapping is a
//! plain `match` so adding a variant without choosing a channel fails to
//! compile.

use crate::block::BlockType;
use crate::physics::Vec3;
use serde::{Deserialize, Serialize};

/// Server-assigned player identifier. Never reused within one server run;
/// 0 is never assigned.
pub type PlayerId = u32;

/// Delivery class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, acknowledged, resent until delivered.
    Reliable,
    /// Fire and forget; may be lost or reordered.
    Unreliable,
}

/// One client input sample. The server keeps only the most recent one.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InputFrame {
    pub seq: u32,
    /// Strafe axis, -1 (left) to 1 (right).
    pub move_x: f32,
    /// Forward axis, -1 (back) to 1 (forward).
    pub move_y: f32,
    /// Heading in radians; 0 faces +Z.
    pub yaw: f32,
    pub pitch: f32,
    pub jump: bool,
    pub sprint: bool,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Sent in the wrong session phase.
    NotAllowed,
    /// Target out of reach or occluded.
    Unreachable,
    /// Target may not be broken by players.
    Unbreakable,
    /// Target is solid or would overlap a player.
    Occupied,
    /// Block type cannot be placed.
    InvalidBlock,
    /// Map export failed or no maps directory is configured.
    ExportUnavailable,
}

/// Replicated kinematic and gameplay state of one player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: PlayerId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub on_ground: bool,
    pub health: i32,
    pub team: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Client to server.
    ClientHello {
        version: u32,
        name: String,
    },
    JoinMatch,
    InputFrame(InputFrame),
    /// `block == Air` requests a break, anything else a placement.
    TrySetBlock {
        seq: u32,
        x: i32,
        y: i32,
        z: i32,
        block: BlockType,
    },
    TryExportMap {
        seq: u32,
        name: String,
    },
    Heartbeat {
        client_time_ms: u64,
    },

    // Server to client.
    ServerHello {
        version: u32,
        tick_rate: u32,
        world_seed: u64,
    },
    JoinAck {
        player_id: PlayerId,
        spawn: Vec3,
    },
    StateSnapshot {
        server_tick: u64,
        player_id: PlayerId,
        position: Vec3,
        velocity: Vec3,
        on_ground: bool,
        last_input_seq: u32,
    },
    RemotePlayers {
        server_tick: u64,
        players: Vec<PlayerState>,
    },
    PlayerJoined {
        player_id: PlayerId,
    },
    PlayerLeft {
        player_id: PlayerId,
    },
    BlockPlaced {
        x: i32,
        y: i32,
        z: i32,
        block: BlockType,
        player_id: PlayerId,
    },
    BlockBroken {
        x: i32,
        y: i32,
        z: i32,
        player_id: PlayerId,
    },
    ActionRejected {
        seq: u32,
        reason: RejectReason,
    },
    ExportResult {
        seq: u32,
        success: bool,
        file_name: String,
    },
    HeartbeatAck {
        client_time_ms: u64,
        server_tick: u64,
    },
    ChatMessage {
        text: String,
    },
    RoundStarted {
        round: u32,
    },
    RoundEnded {
        round: u32,
    },
}

impl Message {
    /// Transport channel this message travels on.
    pub fn channel(&self) -> Channel {
        match self {
            Message::ClientHello { .. }
            | Message::JoinMatch
            | Message::InputFrame(_)
            | Message::TrySetBlock { .. }
            | Message::TryExportMap { .. }
            | Message::ServerHello { .. }
            | Message::JoinAck { .. }
            | Message::StateSnapshot { .. }
            | Message::PlayerJoined { .. }
            | Message::PlayerLeft { .. }
            | Message::BlockPlaced { .. }
            | Message::BlockBroken { .. }
            | Message::ActionRejected { .. }
            | Message::ExportResult { .. }
            | Message::ChatMessage { .. }
            | Message::RoundStarted { .. }
            | Message::RoundEnded { .. } => Channel::Reliable,
            Message::Heartbeat { .. }
            | Message::HeartbeatAck { .. }
            | Message::RemotePlayers { .. } => Channel::Unreliable,
        }
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientHello { .. } => "ClientHello",
            Message::JoinMatch => "JoinMatch",
            Message::InputFrame(_) => "InputFrame",
            Message::TrySetBlock { .. } => "TrySetBlock",
            Message::TryExportMap { .. } => "TryExportMap",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::ServerHello { .. } => "ServerHello",
            Message::JoinAck { .. } => "JoinAck",
            Message::StateSnapshot { .. } => "StateSnapshot",
            Message::RemotePlayers { .. } => "RemotePlayers",
            Message::PlayerJoined { .. } => "PlayerJoined",
            Message::PlayerLeft { .. } => "PlayerLeft",
            Message::BlockPlaced { .. } => "BlockPlaced",
            Message::BlockBroken { .. } => "BlockBroken",
            Message::ActionRejected { .. } => "ActionRejected",
            Message::ExportResult { .. } => "ExportResult",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::ChatMessage { .. } => "ChatMessage",
            Message::RoundStarted { .. } => "RoundStarted",
            Message::RoundEnded { .. } => "RoundEnded",
        }
    }
}
