//! Unified error type for Lockstep.

use lockstep_protocol::{ErrorCode, ProtocolError};
use lockstep_session::{CloseReason, PeerHandle, SessionError};
use lockstep_sync::SyncError;
use lockstep_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `lockstep` crate you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attributes let `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum LockstepError {
    /// A transport-level error (connect, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A malformed packet.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A connection lifecycle error (illegal packet, failed auth).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A synchronization error (desync, lag, map transfer).
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The peer was turned away or dropped for a reason it is told with
    /// `code` (wrong revision, name in use, a phase timeout).
    #[error("{code}")]
    Refused { code: ErrorCode, reason: CloseReason },

    /// The other side reported an error and closed.
    #[error("remote error: {0}")]
    Remote(ErrorCode),

    /// An operation that needs a synchronized connection was attempted
    /// before the map was loaded or after the connection closed.
    #[error("not synchronized with the server")]
    NotSynchronized,

    /// A handle that no longer names a connection.
    #[error("no connection for {0}")]
    UnknownPeer(PeerHandle),

    /// A configuration file could not be read.
    #[error("config io: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// A configuration file could not be parsed.
    #[error("config parse: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl LockstepError {
    /// Refusal with a code sent to the peer and a protocol-violation reason.
    pub(crate) fn refused(code: ErrorCode) -> Self {
        LockstepError::Refused {
            code,
            reason: CloseReason::ProtocolViolation,
        }
    }

    /// No room for another client.
    pub(crate) fn full() -> Self {
        LockstepError::Refused {
            code: ErrorCode::Full,
            reason: CloseReason::ServerFull,
        }
    }

    /// A phase ran past its deadline.
    pub(crate) fn timed_out(code: ErrorCode) -> Self {
        LockstepError::Refused {
            code,
            reason: CloseReason::Timeout,
        }
    }

    /// The reason the affected connection is closed with.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            LockstepError::Session(e) => e.close_reason(),
            LockstepError::Sync(e) => e.close_reason(),
            LockstepError::Refused { reason, .. } => *reason,
            LockstepError::Remote(ErrorCode::Desync) => CloseReason::Desync,
            LockstepError::Remote(code) => CloseReason::RemoteError(*code),
            LockstepError::Transport(_) => CloseReason::ConnectionLost,
            LockstepError::Protocol(_)
            | LockstepError::NotSynchronized
            | LockstepError::UnknownPeer(_)
            | LockstepError::ConfigIo(_)
            | LockstepError::ConfigParse(_) => CloseReason::ProtocolViolation,
        }
    }

    /// The code reported to the peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LockstepError::Sync(e) => e.error_code(),
            LockstepError::Refused { code, .. } | LockstepError::Remote(code) => *code,
            LockstepError::Session(SessionError::AuthenticationFailed(_)) => {
                ErrorCode::NotAuthorized
            }
            LockstepError::Transport(_) => ErrorCode::ConnectionLost,
            _ => ErrorCode::IllegalPacket,
        }
    }
}
