//! Error types for the synchronization layer.

use lockstep_protocol::{ErrorCode, ProtocolError, SyncSeeds};
use lockstep_session::{CloseReason, SessionError};

/// Errors raised while replicating commands, advancing frames, or moving
/// the map.
///
/// Everything except [`SyncError::TransferQueueFull`] is fatal to the
/// connection it concerns. Divergence is never retried: once two peers
/// disagree about the simulation, the only safe move is to drop one.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// An ack reported a frame lower than one it already reported.
    #[error("ack for frame {frame} after frame {last_frame}")]
    AckOutOfOrder { frame: u32, last_frame: u32 },

    /// An ack reported a frame the server never let the client reach.
    #[error("ack for frame {frame} is ahead of server frame {last_frame_server}")]
    AckAheadOfServer { frame: u32, last_frame_server: u32 },

    /// An ack echoed a validation token the server did not hand out.
    #[error("ack echoed unknown token {token}")]
    UnknownToken { token: u8 },

    /// The determinism checksum differs from the server's.
    #[error("checksum mismatch at frame {frame}: server {expected}, local {actual}")]
    ChecksumMismatch {
        frame: u32,
        expected: SyncSeeds,
        actual: SyncSeeds,
    },

    /// The command stream no longer matches the local timeline.
    #[error("desync detected at frame {frame}: {reason}")]
    DesyncDetected { frame: u32, reason: &'static str },

    /// The client stopped proving it is alive for too many frames.
    #[error("client lagged {lag_frames} frames behind")]
    Timeout { lag_frames: u32 },

    /// A client queued more commands than allowed.
    #[error("{queued} commands queued, limit reached")]
    TooManyCommands { queued: usize },

    /// The simulation refused a client command.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// A command carries more data than a command packet can hold.
    #[error("command data is {len} bytes, limit is {max}")]
    CommandTooLarge { len: usize, max: usize },

    /// All transfer slots are busy; the requester waits at `position`.
    /// This one is recoverable.
    #[error("map transfer queue full, waiting at position {position}")]
    TransferQueueFull { position: usize },

    /// The map ended with a different byte count than declared.
    #[error("map size mismatch: declared {declared}, received {received}")]
    MapSizeMismatch { declared: u32, received: u32 },

    /// A map packet arrived out of sequence (e.g. data before size).
    #[error("unexpected map packet: {0}")]
    UnexpectedMapPacket(&'static str),

    /// The simulation could not produce or load a snapshot.
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SyncError {
    /// Returns `true` for the one error that is not fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::TransferQueueFull { .. })
    }

    /// The reason the affected connection is closed with.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SyncError::ChecksumMismatch { .. } | SyncError::DesyncDetected { .. } => {
                CloseReason::Desync
            }
            SyncError::Timeout { .. } => CloseReason::Timeout,
            SyncError::Session(e) => e.close_reason(),
            _ => CloseReason::ProtocolViolation,
        }
    }

    /// The code reported to the peer and to the other clients.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SyncError::ChecksumMismatch { .. } | SyncError::DesyncDetected { .. } => {
                ErrorCode::Desync
            }
            SyncError::Timeout { .. } => ErrorCode::TimeoutComputer,
            SyncError::TooManyCommands { .. } => ErrorCode::TooManyCommands,
            SyncError::CommandRejected(_) => ErrorCode::NotExpected,
            SyncError::CommandTooLarge { .. } => ErrorCode::IllegalPacket,
            SyncError::Snapshot(_) => ErrorCode::SnapshotFailed,
            SyncError::MapSizeMismatch { .. } | SyncError::UnexpectedMapPacket(_) => {
                ErrorCode::SnapshotFailed
            }
            SyncError::Session(SessionError::AuthenticationFailed(_)) => ErrorCode::NotAuthorized,
            _ => ErrorCode::IllegalPacket,
        }
    }
}
