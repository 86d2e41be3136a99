//! The `Simulation` trait: the one extension point an application implements.
//!
//! Lockstep never looks inside the simulation. It hands over commands at
//! the frame they must run, tells the simulation to step, and asks for
//! a checksum now and then. Everything else about the world stays on the
//! application's side of this trait.

use bytes::Bytes;
use lockstep_protocol::{ClientId, CommandPacket, ContentId, SyncSeeds};

/// Why the server wants the simulation paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseReason {
    /// A client is downloading the map.
    Joining,
    /// A client is falling behind on its acknowledgments.
    LaggingClient,
}

/// A deterministic simulation driven frame by frame.
///
/// Every peer runs its own instance. As long as each one executes the
/// same commands at the same frames, all instances stay identical, and
/// [`sync_seeds`](Self::sync_seeds) returns the same value everywhere.
///
/// The frame loop calls, per frame:
/// 1. [`execute`](Self::execute) for every command due at the frame, in
///    replication order
/// 2. [`advance`](Self::advance) once
pub trait Simulation: Send + 'static {
    /// Applies one command at `frame`.
    ///
    /// Must be deterministic. A command that fails here fails identically
    /// on every peer, which keeps them in sync.
    ///
    /// Only `company`, `cmd`, `data` and `frame` are the same everywhere.
    /// The server executes with the sender's real `client_id` while
    /// clients decode [`ClientId::INVALID`], and `my_cmd` is set only on
    /// the peer that issued the command. Letting either field change the
    /// game state desyncs the clients.
    fn execute(&mut self, frame: u32, cmd: &CommandPacket);

    /// Steps the world to the end of `frame`.
    fn advance(&mut self, frame: u32);

    /// The determinism checksum of the current state.
    fn sync_seeds(&self) -> SyncSeeds;

    /// Serializes the whole state for a joining client.
    fn snapshot(&self) -> Result<Bytes, String>;

    /// Replaces the whole state with a received snapshot.
    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String>;

    /// Checks a client command before it is queued on the server.
    ///
    /// Returning `Err` drops the sending client. Default: accept all.
    fn validate_command(&self, _client: ClientId, _cmd: &CommandPacket) -> Result<(), String> {
        Ok(())
    }

    /// Whether the simulation is currently paused. Default: never.
    fn is_paused(&self) -> bool {
        false
    }

    /// Whether `cmd` may run while paused (e.g. the unpause command).
    ///
    /// Commands that may not stay queued until the pause ends.
    /// Default: none.
    fn allowed_while_paused(&self, _cmd: &CommandPacket) -> bool {
        false
    }

    /// The command that pauses (`paused = true`) or unpauses the
    /// simulation for `reason`.
    ///
    /// Pausing is an ordinary replicated command, so every peer pauses at
    /// the same frame. Return `None` if the simulation cannot pause.
    /// Default: `None`.
    fn pause_command(&self, _reason: PauseReason, _paused: bool) -> Option<CommandPacket> {
        None
    }

    /// The content a client must have to join.
    fn required_content(&self) -> Vec<ContentId> {
        Vec::new()
    }

    /// Whether this peer has `content` installed. Default: yes.
    fn has_content(&self, _content: &ContentId) -> bool {
        true
    }
}
