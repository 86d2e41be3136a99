//! Frame synchronization for Lockstep.
//!
//! Every peer runs the same deterministic [`Simulation`]. This crate keeps
//! them in step without ever sending the state itself:
//!
//! 1. **Server** ([`FrameServer`]): stamps each command with the frame it
//!    must run at, broadcasts it, and tells clients how far they may run
//! 2. **Client** ([`FrameClient`]): buffers stamped commands and runs
//!    frames up to the server's limit, comparing checksums on the way
//! 3. **Map transfer** ([`MapTransferQueue`], [`MapReceiver`]): hands a
//!    joining client the full state once, in chunks
//!
//! # How it fits in the stack
//!
//! ```text
//! Node (above)  ← owns the registry and the simulation, runs the tick
//!     ↕
//! Sync Layer (this crate)  ← frames, commands, checksums, map transfer
//!     ↕
//! Session Layer (below)  ← per-connection state and packet queues
//! ```

mod client;
mod config;
mod error;
mod schedule;
mod server;
mod simulation;
mod transfer;

pub use client::FrameClient;
pub use config::{MAX_CHUNK_SIZE, SyncConfig, TransferConfig};
pub use error::SyncError;
pub use schedule::FrameSchedule;
pub use server::{Distribution, FrameServer, LagStatus};
pub use simulation::{PauseReason, Simulation};
pub use transfer::{MapReceiver, MapTransferQueue};
