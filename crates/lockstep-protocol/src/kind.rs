//! The closed set of packet kinds and who may send each one.
//!
//! Kinds are split into two tiers:
//!
//! - **Tier A** (values 0..=9) is frozen. A peer probing an unfamiliar
//!   server reads only these before it knows which protocol version the
//!   other side speaks, so their ordinals must never change. Two retired
//!   placeholders are kept in the middle purely to hold their slots.
//! - **Tier B** (values 10 and up) is only exchanged after the join
//!   handshake, where both sides have already agreed on a revision. Its
//!   order may change between releases.
//!
//! Adding a kind means appending it to Tier B and to [`PacketKind::ALL`].

use std::fmt;

use crate::ProtocolError;

/// Which end of a connection a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// The role on the other end of the connection.
    pub fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Compatibility tier of a packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Ordinal-stable, may be exchanged before the revision check.
    A,
    /// Version-gated, only exchanged after a successful join.
    B,
}

/// Every packet kind on the wire, by its one-byte ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    // -- Tier A: never reorder ----------------------------------------------
    ServerFull = 0,
    ServerBanned = 1,
    ClientJoin = 2,
    ServerError = 3,
    ClientUnused = 4,
    ServerUnused = 5,
    ServerGameInfo = 6,
    ClientGameInfo = 7,
    ServerNewGame = 8,
    ServerShutdown = 9,

    // -- Tier B: handshake --------------------------------------------------
    ServerAuthRequest = 10,
    ClientAuthResponse = 11,
    ServerEnableEncryption = 12,
    ClientIdentify = 13,
    ServerCheckContent = 14,
    ClientContentChecked = 15,
    ServerWelcome = 16,
    ServerClientInfo = 17,

    // -- Tier B: map transfer -----------------------------------------------
    ClientGetMap = 18,
    ServerWait = 19,
    ServerMapBegin = 20,
    ServerMapSize = 21,
    ServerMapData = 22,
    ServerMapDone = 23,
    ClientMapOk = 24,
    ServerJoin = 25,

    // -- Tier B: in game ----------------------------------------------------
    ServerFrame = 26,
    ClientAck = 27,
    ServerSync = 28,
    ClientCommand = 29,
    ServerCommand = 30,
    ClientChat = 31,
    ServerChat = 32,
    ServerExternalChat = 33,
    ClientRcon = 34,
    ServerRcon = 35,
    ClientMove = 36,
    ServerMove = 37,
    ClientSetName = 38,
    ServerConfigUpdate = 39,

    // -- Tier B: leaving ----------------------------------------------------
    ClientQuit = 40,
    ServerQuit = 41,
    ClientError = 42,
    ServerErrorQuit = 43,
}

impl PacketKind {
    /// All kinds in ordinal order. `ALL[k as usize] == k` for every kind.
    pub const ALL: [PacketKind; 44] = [
        PacketKind::ServerFull,
        PacketKind::ServerBanned,
        PacketKind::ClientJoin,
        PacketKind::ServerError,
        PacketKind::ClientUnused,
        PacketKind::ServerUnused,
        PacketKind::ServerGameInfo,
        PacketKind::ClientGameInfo,
        PacketKind::ServerNewGame,
        PacketKind::ServerShutdown,
        PacketKind::ServerAuthRequest,
        PacketKind::ClientAuthResponse,
        PacketKind::ServerEnableEncryption,
        PacketKind::ClientIdentify,
        PacketKind::ServerCheckContent,
        PacketKind::ClientContentChecked,
        PacketKind::ServerWelcome,
        PacketKind::ServerClientInfo,
        PacketKind::ClientGetMap,
        PacketKind::ServerWait,
        PacketKind::ServerMapBegin,
        PacketKind::ServerMapSize,
        PacketKind::ServerMapData,
        PacketKind::ServerMapDone,
        PacketKind::ClientMapOk,
        PacketKind::ServerJoin,
        PacketKind::ServerFrame,
        PacketKind::ClientAck,
        PacketKind::ServerSync,
        PacketKind::ClientCommand,
        PacketKind::ServerCommand,
        PacketKind::ClientChat,
        PacketKind::ServerChat,
        PacketKind::ServerExternalChat,
        PacketKind::ClientRcon,
        PacketKind::ServerRcon,
        PacketKind::ClientMove,
        PacketKind::ServerMove,
        PacketKind::ClientSetName,
        PacketKind::ServerConfigUpdate,
        PacketKind::ClientQuit,
        PacketKind::ServerQuit,
        PacketKind::ClientError,
        PacketKind::ServerErrorQuit,
    ];

    /// One past the highest valid ordinal.
    pub const END: u8 = 44;

    pub fn tier(self) -> Tier {
        if (self as u8) < 10 { Tier::A } else { Tier::B }
    }

    /// The only role allowed to send this kind.
    pub fn sender(self) -> Role {
        use PacketKind::*;
        match self {
            ClientJoin | ClientUnused | ClientGameInfo | ClientAuthResponse
            | ClientIdentify | ClientContentChecked | ClientGetMap
            | ClientMapOk | ClientAck | ClientCommand | ClientChat
            | ClientRcon | ClientMove | ClientSetName | ClientQuit
            | ClientError => Role::Client,
            _ => Role::Server,
        }
    }

    /// Retired kinds only hold their ordinal; receiving one is an error.
    pub fn is_retired(self) -> bool {
        matches!(self, PacketKind::ClientUnused | PacketKind::ServerUnused)
    }

    /// Resolves a received kind byte for a peer acting as `receiver`.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidPacketKind`] if the value is out of range,
    /// names a retired placeholder, or names a kind that only `receiver`'s
    /// own role may send.
    pub fn for_receiver(value: u8, receiver: Role) -> Result<Self, ProtocolError> {
        let kind = Self::try_from(value)?;
        if kind.is_retired() || kind.sender() == receiver {
            return Err(ProtocolError::InvalidPacketKind(value));
        }
        Ok(kind)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::InvalidPacketKind(value))
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
