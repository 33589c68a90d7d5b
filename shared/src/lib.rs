//! Code shared by the server and headless clients: wire protocol, world
//! model, player physics and the transport layer.

pub mod block;
pub mod codec;
pub mod noise;
pub mod physics;
pub mod protocol;
pub mod reach;
pub mod template;
pub mod terrain;
pub mod transport;

pub use block::{BlockKey, BlockType};
pub use codec::{decode, encode, CodecError};
pub use physics::{PlayerBody, Vec3};
pub use protocol::{Channel, InputFrame, Message, PlayerId, PlayerState, RejectReason};
pub use template::{MapTemplate, TemplateError};
pub use terrain::Terrain;

/// Bumped whenever a message layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_TICK_RATE: u32 = 30;
pub const DEFAULT_MAX_PLAYERS: usize = 16;
pub const DEFAULT_SEED: u64 = 1337;

/// Horizontal edge length of a chunk, in blocks.
pub const CHUNK_SIZE: i32 = 16;
/// Number of block layers; valid y is `0..WORLD_HEIGHT`.
pub const WORLD_HEIGHT: i32 = 64;
/// Editable x and z lie in `-WORLD_HALF_EXTENT..WORLD_HALF_EXTENT`.
pub const WORLD_HALF_EXTENT: i32 = 4096;

// Player movement, in blocks and seconds.
pub const GRAVITY: f32 = 28.0;
pub const TERMINAL_VELOCITY: f32 = 50.0;
pub const JUMP_VELOCITY: f32 = 8.5;
pub const WALK_SPEED: f32 = 4.3;
pub const SPRINT_SPEED: f32 = 5.6;

pub const PLAYER_WIDTH: f32 = 0.6;
pub const PLAYER_HEIGHT: f32 = 1.8;
/// Eye offset above the feet, used as the origin of reach checks.
pub const EYE_HEIGHT: f32 = 1.6;
/// Maximum distance from the eye to a block a player may edit.
pub const MAX_REACH: f32 = 6.0;

pub const MAX_HEALTH: i32 = 100;
