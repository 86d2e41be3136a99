//! One peer connection: lifecycle state, frame cursors, and packet queues.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use lockstep_protocol::{
    ClientId, CommandQueue, CompanyId, ErrorCode, Message, PacketKind, RawPacket, Role,
};

use crate::{ConnectionState, PacketCipher, PendingDeletion, SessionError};

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Why a connection was closed, as reported to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ServerFull,
    Banned,
    ProtocolViolation,
    AuthenticationFailed,
    Timeout,
    Desync,
    /// The peer said goodbye.
    RemoteQuit,
    /// The peer reported an error and left.
    RemoteError(ErrorCode),
    /// The socket went away without a goodbye.
    ConnectionLost,
    /// This side is shutting down, or the server announced its shutdown.
    Shutdown,
    /// A game-info query was answered; the querier never joined.
    QueryAnswered,
}

impl CloseReason {
    /// Clean closes still flush queued outbound packets; error closes
    /// drop them.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            CloseReason::RemoteQuit | CloseReason::Shutdown | CloseReason::QueryAnswered
        )
    }

    /// The code to report to the peer (and to other clients), if any.
    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            CloseReason::ProtocolViolation => Some(ErrorCode::IllegalPacket),
            CloseReason::AuthenticationFailed => Some(ErrorCode::NotAuthorized),
            CloseReason::Timeout => Some(ErrorCode::TimeoutComputer),
            CloseReason::Desync => Some(ErrorCode::Desync),
            CloseReason::ConnectionLost => Some(ErrorCode::ConnectionLost),
            CloseReason::RemoteError(code) => Some(code),
            CloseReason::ServerFull => Some(ErrorCode::Full),
            CloseReason::Banned
            | CloseReason::RemoteQuit
            | CloseReason::Shutdown
            | CloseReason::QueryAnswered => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ServerFull => write!(f, "server full"),
            CloseReason::Banned => write!(f, "banned"),
            CloseReason::ProtocolViolation => write!(f, "protocol violation"),
            CloseReason::AuthenticationFailed => write!(f, "authentication failed"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Desync => write!(f, "desync"),
            CloseReason::RemoteQuit => write!(f, "remote quit"),
            CloseReason::RemoteError(code) => write!(f, "remote error: {code}"),
            CloseReason::ConnectionLost => write!(f, "connection lost"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::QueryAnswered => write!(f, "query answered"),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerConnection
// ---------------------------------------------------------------------------

/// Everything one end knows about one connection.
///
/// A `PeerConnection` never touches a socket. Incoming packets are fed in
/// through [`receive`](Self::receive); outgoing ones pile up in an outbound
/// queue that the I/O driver drains with
/// [`drain_outbound`](Self::drain_outbound).
///
/// Closing never destroys the connection. [`close`](Self::close) moves it
/// to `Closing` and marks it pending deletion; the owning
/// [`ConnectionRegistry`](crate::ConnectionRegistry) removes it on the next
/// sweep.
#[derive(Debug)]
pub struct PeerConnection {
    role: Role,
    state: ConnectionState,
    state_since: Instant,
    /// Assigned participant id. [`ClientId::INVALID`] until welcomed.
    pub client_id: ClientId,
    pub name: String,
    pub company: CompanyId,
    /// Last frame this peer executed.
    pub last_frame: u32,
    /// Last frame the server executed, as far as this peer knows.
    pub last_frame_server: u32,
    /// When a packet last arrived.
    pub last_packet: Instant,
    /// Commands received from this peer, not yet distributed.
    pub incoming_queue: CommandQueue,
    /// Validation token attached to a frame and not yet echoed.
    pub pending_token: Option<u8>,
    /// Frame at which the last token was echoed (or the connection joined).
    pub last_token_frame: u32,
    /// Frame the peer's map snapshot was taken at.
    pub snapshot_frame: Option<u32>,
    pending_deletion: bool,
    close_reason: Option<CloseReason>,
    outbound: VecDeque<Queued>,
    cipher: Option<PacketCipher>,
}

/// An encoded packet waiting to leave. It is sealed on drain, so only
/// packets that actually go out use up a nonce.
#[derive(Debug)]
struct Queued {
    packet: Bytes,
    seal: bool,
}

impl PeerConnection {
    /// A fresh connection on the `role` side, created on accept/connect.
    pub fn new(role: Role, now: Instant) -> Self {
        Self {
            role,
            state: ConnectionState::Inactive,
            state_since: now,
            client_id: ClientId::INVALID,
            name: String::new(),
            company: CompanyId::SPECTATOR,
            last_frame: 0,
            last_frame_server: 0,
            last_packet: now,
            incoming_queue: CommandQueue::new(),
            pending_token: None,
            last_token_frame: 0,
            snapshot_frame: None,
            pending_deletion: false,
            close_reason: None,
            outbound: VecDeque::new(),
            cipher: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// When the connection entered its current state.
    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Moves along one edge of the state machine.
    ///
    /// # Errors
    /// [`SessionError::InvalidTransition`] if the edge does not exist.
    pub fn transition(
        &mut self,
        target: ConnectionState,
        now: Instant,
    ) -> Result<(), SessionError> {
        if !self.state.can_transition_to(self.role, target) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        tracing::debug!(
            client_id = %self.client_id,
            from = %self.state,
            to = %target,
            "connection state changed"
        );
        self.state = target;
        self.state_since = now;
        Ok(())
    }

    /// Moves to the next live state for this connection's role.
    pub fn advance(&mut self, now: Instant) -> Result<ConnectionState, SessionError> {
        let next = self
            .state
            .next(self.role)
            .ok_or(SessionError::InvalidTransition {
                from: self.state,
                to: self.state,
            })?;
        self.transition(next, now)?;
        Ok(next)
    }

    /// Runs one received packet through the receive pipeline: decrypt,
    /// resolve the kind for this role, check it is legal in the current
    /// state, decode.
    pub fn receive(&mut self, packet: &[u8], now: Instant) -> Result<Message, SessionError> {
        let raw = match self.cipher.as_mut() {
            Some(cipher) => cipher.open(packet)?,
            None => RawPacket::parse(packet)?,
        };
        let kind = PacketKind::for_receiver(raw.kind, self.role)?;
        if !self.state.accepts(self.role, kind) {
            return Err(SessionError::IllegalStateTransition {
                state: self.state,
                kind,
            });
        }
        let msg = Message::from_raw(kind, &raw)?;
        self.last_packet = now;
        Ok(msg)
    }

    /// Encodes a message onto the outbound queue. Once encryption is
    /// enabled the packet is sealed when drained. Nothing is queued once
    /// the connection is closing.
    pub fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        if !self.state.is_live() {
            return Ok(());
        }
        self.push_outbound(msg)
    }

    fn push_outbound(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.outbound.push_back(Queued {
            packet: msg.encode()?,
            seal: self.cipher.is_some(),
        });
        Ok(())
    }

    /// Starts sealing and opening every later packet.
    ///
    /// The server calls this right after queueing enable-encryption (which
    /// itself goes out in the clear); the client calls it on receipt.
    pub fn enable_encryption(&mut self, cipher: PacketCipher) {
        self.cipher = Some(cipher);
    }

    /// Starts closing the connection.
    ///
    /// An error close drops whatever was still queued for sending; only
    /// `final_packet` (usually an error notice) goes out. A clean close
    /// keeps the queue so it can be flushed. Either way the connection is
    /// marked for deletion. Closing an already closing connection is a
    /// no-op, so the first reason wins.
    pub fn close(&mut self, reason: CloseReason, final_packet: Option<Message>, now: Instant) {
        if !self.state.is_live() {
            return;
        }
        let error = reason.is_error();
        if error {
            self.outbound.clear();
        }
        if let Some(msg) = final_packet {
            if let Err(e) = self.push_outbound(&msg) {
                tracing::warn!(client_id = %self.client_id, error = %e, "could not queue close packet");
            }
        }
        tracing::info!(client_id = %self.client_id, %reason, error, "closing connection");
        self.state = ConnectionState::Closing { error };
        self.state_since = now;
        self.close_reason = Some(reason);
        self.pending_deletion = true;
    }

    /// Finishes teardown. Called by the owner after the sweep.
    pub fn mark_closed(&mut self) {
        if matches!(self.state, ConnectionState::Closing { .. }) {
            self.state = ConnectionState::Closed;
        }
    }

    /// Takes every packet queued for sending, sealing the ones queued
    /// after encryption was enabled.
    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(self.outbound.len());
        for queued in self.outbound.drain(..) {
            let cipher = match (queued.seal, self.cipher.as_mut()) {
                (true, Some(cipher)) => cipher,
                _ => {
                    out.push(queued.packet);
                    continue;
                }
            };
            match cipher.seal(&queued.packet) {
                Ok(sealed) => out.push(sealed),
                Err(e) => {
                    tracing::warn!(client_id = %self.client_id, error = %e, "could not seal packet, dropped");
                }
            }
        }
        out
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}

impl PendingDeletion for PeerConnection {
    fn is_pending_deletion(&self) -> bool {
        self.pending_deletion
    }

    fn defer_deletion(&mut self) {
        self.pending_deletion = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_peer() -> PeerConnection {
        PeerConnection::new(Role::Server, Instant::now())
    }

    #[test]
    fn test_receive_legal_packet_decodes_and_touches() {
        let start = Instant::now();
        let mut peer = PeerConnection::new(Role::Server, start);
        let later = start + std::time::Duration::from_secs(1);
        let packet = Message::ClientJoin {
            revision: "v1".into(),
            company: CompanyId(1),
        }
        .encode()
        .unwrap();

        let msg = peer.receive(&packet, later).unwrap();
        assert!(matches!(msg, Message::ClientJoin { .. }));
        assert_eq!(peer.last_packet, later);
    }

    #[test]
    fn test_receive_out_of_state_packet_returns_illegal_transition() {
        let mut peer = server_peer();
        let packet = Message::ClientAck { frame: 1, token: 0 }.encode().unwrap();
        let err = peer.receive(&packet, Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::IllegalStateTransition {
                state: ConnectionState::Inactive,
                kind: PacketKind::ClientAck
            }
        ));
        assert_eq!(err.close_reason(), CloseReason::ProtocolViolation);
    }

    #[test]
    fn test_receive_own_role_kind_returns_invalid_kind() {
        let mut peer = server_peer();
        let packet = Message::ServerShutdown.encode().unwrap();
        assert!(matches!(
            peer.receive(&packet, Instant::now()),
            Err(SessionError::Protocol(lockstep_protocol::ProtocolError::InvalidPacketKind(9)))
        ));
    }

    #[test]
    fn test_transition_skipping_a_state_fails() {
        let mut peer = server_peer();
        let result = peer.transition(ConnectionState::Identifying, Instant::now());
        assert!(matches!(result, Err(SessionError::InvalidTransition { .. })));
        assert_eq!(peer.state(), ConnectionState::Inactive);
        assert_eq!(peer.advance(Instant::now()).unwrap(), ConnectionState::Authenticating);
    }

    #[test]
    fn test_close_error_discards_outbound_but_keeps_final_packet() {
        let mut peer = server_peer();
        peer.send(&Message::ServerWelcome { client_id: ClientId(2) }).unwrap();
        peer.send(&Message::ServerMapDone).unwrap();

        peer.close(
            CloseReason::ProtocolViolation,
            Some(Message::ServerError { code: ErrorCode::IllegalPacket }),
            Instant::now(),
        );

        assert_eq!(peer.state(), ConnectionState::Closing { error: true });
        assert!(peer.is_pending_deletion());
        let out = peer.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][2], PacketKind::ServerError as u8);
    }

    #[test]
    fn test_close_clean_keeps_queued_packets() {
        let mut peer = server_peer();
        peer.send(&Message::ServerMapDone).unwrap();
        peer.close(CloseReason::Shutdown, Some(Message::ServerShutdown), Instant::now());

        assert_eq!(peer.state(), ConnectionState::Closing { error: false });
        assert_eq!(peer.outbound_len(), 2);
    }

    #[test]
    fn test_close_twice_keeps_first_reason_and_ignores_sends() {
        let mut peer = server_peer();
        peer.close(CloseReason::Timeout, None, Instant::now());
        peer.close(CloseReason::RemoteQuit, None, Instant::now());
        assert_eq!(peer.close_reason(), Some(CloseReason::Timeout));

        peer.send(&Message::ServerMapDone).unwrap();
        assert_eq!(peer.outbound_len(), 0);
        peer.mark_closed();
        assert_eq!(peer.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_reason_error_codes() {
        assert_eq!(CloseReason::Desync.error_code(), Some(ErrorCode::Desync));
        assert_eq!(CloseReason::RemoteQuit.error_code(), None);
        assert!(!CloseReason::RemoteQuit.is_error());
        assert!(CloseReason::Banned.is_error());
        assert!(!CloseReason::QueryAnswered.is_error());
    }
}
