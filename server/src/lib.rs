//! # Game Server Library
//!
//! Authoritative server for the voxel match. The server owns the canonical
//! world, runs every player's physics at a fixed tick rate and decides what
//! block requests do. Clients send intents and conform to what comes back.
//!
//! ## Module Organization
//!
//! - [`client_manager`]: one record per connection with its session phase,
//!   body and latest input.
//! - [`game`]: terrain ownership, movement integration, block request
//!   validation and map export.
//! - [`network`]: the tick loop and the message state machine, generic over
//!   the transport so the same server runs over UDP or in process.
//! - [`scripting`]: callbacks and the command queue used by game modes.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//! use shared::transport::NetServerTransport;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let transport = NetServerTransport::bind("0.0.0.0", 7777, config.max_players)?;
//!     let handle = Server::new(config, transport).spawn()?;
//!
//!     // ... wait for a shutdown signal ...
//!     if !handle.join() {
//!         return Err("tick thread panicked".into());
//!     }
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod game;
pub mod network;
pub mod scripting;

pub use client_manager::{ClientManager, ClientState, SessionPhase};
pub use game::{BlockChange, GameState};
pub use network::{Server, ServerConfig, ServerHandle};
pub use scripting::{NoScripts, ScriptCommand, ScriptHooks, ScriptQueue, WorldView};
