//! The per-connection lifecycle state machine.

use std::fmt;

use lockstep_protocol::{PacketKind, Role};

/// The lifecycle state of one connection.
///
/// Live states advance strictly in order; no skipping:
///
/// ```text
/// Inactive → Authenticating → Identifying → ContentChecking
///          → Welcoming (server) / AwaitingWelcome (client)
///          → MapTransfer → Synchronized
/// ```
///
/// Any live state may drop into `Closing`, and `Closing` ends in `Closed`.
/// On the server a state names what the connection is waiting for from
/// the client; on the client it names which handshake step it is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket is open, nothing exchanged yet (server), or the join was
    /// sent and the client waits for the auth request (client).
    Inactive,
    Authenticating,
    Identifying,
    ContentChecking,
    /// Client only: content was confirmed, waiting for the welcome.
    AwaitingWelcome,
    /// Server only: welcome was sent, waiting for the map request.
    Welcoming,
    MapTransfer,
    Synchronized,
    /// Tearing down. With `error: true` unsent outbound data is dropped.
    Closing { error: bool },
    Closed,
}

impl ConnectionState {
    /// The next live state for a connection on the `role` side.
    pub fn next(self, role: Role) -> Option<Self> {
        use ConnectionState::*;
        match (self, role) {
            (Inactive, _) => Some(Authenticating),
            (Authenticating, _) => Some(Identifying),
            (Identifying, _) => Some(ContentChecking),
            (ContentChecking, Role::Server) => Some(Welcoming),
            (ContentChecking, Role::Client) => Some(AwaitingWelcome),
            (Welcoming, Role::Server) | (AwaitingWelcome, Role::Client) => Some(MapTransfer),
            (MapTransfer, _) => Some(Synchronized),
            _ => None,
        }
    }

    /// Returns `true` if moving from `self` to `target` is a legal edge.
    pub fn can_transition_to(self, role: Role, target: Self) -> bool {
        match target {
            ConnectionState::Closing { .. } => self.is_live(),
            ConnectionState::Closed => matches!(self, ConnectionState::Closing { .. }),
            _ => self.next(role) == Some(target),
        }
    }

    /// Returns `true` until the connection starts closing.
    pub fn is_live(self) -> bool {
        !matches!(self, ConnectionState::Closing { .. } | ConnectionState::Closed)
    }

    /// Returns `true` once the connection executes frames with the server.
    pub fn is_synchronized(self) -> bool {
        matches!(self, ConnectionState::Synchronized)
    }

    /// Whether a connection on the `receiver` side may accept `kind` now.
    ///
    /// Quit and error kinds are legal in every live state; nothing is
    /// legal once the connection is closing.
    pub fn accepts(self, receiver: Role, kind: PacketKind) -> bool {
        use ConnectionState as S;
        use PacketKind as K;

        if !self.is_live() {
            return false;
        }
        match receiver {
            Role::Server => match kind {
                K::ClientQuit | K::ClientError => true,
                K::ClientJoin | K::ClientGameInfo => self == S::Inactive,
                K::ClientAuthResponse => self == S::Authenticating,
                K::ClientIdentify => self == S::Identifying,
                K::ClientContentChecked => self == S::ContentChecking,
                K::ClientGetMap => self == S::Welcoming,
                K::ClientMapOk => self == S::MapTransfer,
                K::ClientAck
                | K::ClientCommand
                | K::ClientChat
                | K::ClientRcon
                | K::ClientMove
                | K::ClientSetName => self == S::Synchronized,
                _ => false,
            },
            Role::Client => match kind {
                K::ServerError | K::ServerShutdown | K::ServerNewGame => true,
                K::ServerFull | K::ServerBanned | K::ServerGameInfo => self == S::Inactive,
                K::ServerAuthRequest => self == S::Inactive,
                K::ServerEnableEncryption => self == S::Authenticating,
                K::ServerCheckContent => self == S::Identifying,
                K::ServerWelcome => self == S::AwaitingWelcome,
                K::ServerWait
                | K::ServerMapBegin
                | K::ServerMapSize
                | K::ServerMapData
                | K::ServerMapDone => self == S::MapTransfer,
                // Frames, commands, and notices keep flowing while the map
                // downloads; they are buffered until the map is loaded.
                K::ServerClientInfo
                | K::ServerJoin
                | K::ServerFrame
                | K::ServerSync
                | K::ServerCommand
                | K::ServerQuit
                | K::ServerErrorQuit
                | K::ServerMove
                | K::ServerConfigUpdate
                | K::ServerChat
                | K::ServerExternalChat => {
                    matches!(self, S::MapTransfer | S::Synchronized)
                }
                K::ServerRcon => self == S::Synchronized,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closing { error: true } => write!(f, "Closing(error)"),
            Self::Closing { error: false } => write!(f, "Closing"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_server_chain_follows_strict_order() {
        let mut state = ConnectionState::Inactive;
        let mut seen = vec![state];
        while let Some(next) = state.next(Role::Server) {
            state = next;
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Inactive,
                ConnectionState::Authenticating,
                ConnectionState::Identifying,
                ConnectionState::ContentChecking,
                ConnectionState::Welcoming,
                ConnectionState::MapTransfer,
                ConnectionState::Synchronized,
            ]
        );
    }

    #[test]
    fn test_next_client_uses_awaiting_welcome() {
        assert_eq!(
            ConnectionState::ContentChecking.next(Role::Client),
            Some(ConnectionState::AwaitingWelcome)
        );
        assert_eq!(ConnectionState::Welcoming.next(Role::Client), None);
    }

    #[test]
    fn test_can_transition_to_rejects_skips_and_backward_edges() {
        let s = ConnectionState::Authenticating;
        assert!(s.can_transition_to(Role::Server, ConnectionState::Identifying));
        assert!(!s.can_transition_to(Role::Server, ConnectionState::ContentChecking));
        assert!(!s.can_transition_to(Role::Server, ConnectionState::Inactive));
    }

    #[test]
    fn test_can_transition_to_closing_from_any_live_state() {
        for s in [
            ConnectionState::Inactive,
            ConnectionState::MapTransfer,
            ConnectionState::Synchronized,
        ] {
            assert!(s.can_transition_to(Role::Server, ConnectionState::Closing { error: true }));
        }
        let closing = ConnectionState::Closing { error: false };
        assert!(!closing.can_transition_to(Role::Server, ConnectionState::Closing { error: true }));
        assert!(closing.can_transition_to(Role::Server, ConnectionState::Closed));
        assert!(!ConnectionState::Synchronized.can_transition_to(Role::Server, ConnectionState::Closed));
    }

    #[test]
    fn test_accepts_server_rejects_ack_before_synchronized() {
        assert!(!ConnectionState::Identifying.accepts(Role::Server, PacketKind::ClientAck));
        assert!(ConnectionState::Synchronized.accepts(Role::Server, PacketKind::ClientAck));
    }

    #[test]
    fn test_accepts_quit_in_every_live_state() {
        for s in [
            ConnectionState::Inactive,
            ConnectionState::Authenticating,
            ConnectionState::Welcoming,
            ConnectionState::Synchronized,
        ] {
            assert!(s.accepts(Role::Server, PacketKind::ClientQuit), "{s}");
        }
        assert!(!ConnectionState::Closing { error: false }.accepts(Role::Server, PacketKind::ClientQuit));
    }

    #[test]
    fn test_accepts_client_buffers_commands_during_map_transfer() {
        assert!(ConnectionState::MapTransfer.accepts(Role::Client, PacketKind::ServerCommand));
        assert!(!ConnectionState::AwaitingWelcome.accepts(Role::Client, PacketKind::ServerCommand));
        assert!(!ConnectionState::Synchronized.accepts(Role::Client, PacketKind::ServerMapData));
    }
}
