//! Error types for the session layer.

use lockstep_protocol::{PacketKind, ProtocolError};

use crate::{CloseReason, ConnectionState};

/// Errors that can occur while driving a connection's lifecycle.
///
/// Every variant is fatal to the connection it happened on.
/// [`SessionError::close_reason`] tells the caller which reason to close
/// with.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A packet arrived that the connection's current state does not
    /// accept, e.g. an ack before the client finished the handshake.
    #[error("packet {kind} is not legal in state {state}")]
    IllegalStateTransition {
        state: ConnectionState,
        kind: PacketKind,
    },

    /// Code tried to move a connection along an edge the state machine
    /// does not have.
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// The key exchange did not verify (wrong password, tampered keys).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// An encrypted packet failed its integrity check.
    #[error("encrypted packet failed verification")]
    DecryptionFailed,

    /// The packet's bytes were malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// The reason a connection should be closed with after this error.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SessionError::AuthenticationFailed(_) => CloseReason::AuthenticationFailed,
            SessionError::IllegalStateTransition { .. }
            | SessionError::InvalidTransition { .. }
            | SessionError::DecryptionFailed
            | SessionError::Protocol(_) => CloseReason::ProtocolViolation,
        }
    }
}
