//! Identity types, enumerations, and small value types carried in packets.
//!
//! Everything here has a fixed binary shape. Enumerations are `#[repr(u8)]`
//! and convert from their wire byte with `TryFrom<u8>`, failing with
//! [`ProtocolError::InvalidValue`] for bytes that name no variant.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Field limits
// ---------------------------------------------------------------------------

/// Longest client name, in bytes.
pub const MAX_CLIENT_NAME_LEN: usize = 24;
/// Longest server name advertised in game info.
pub const MAX_SERVER_NAME_LEN: usize = 80;
/// Longest revision string sent with a join.
pub const MAX_REVISION_LEN: usize = 32;
/// Longest chat message.
pub const MAX_CHAT_LEN: usize = 900;
/// Longest remote-console command or password.
pub const MAX_RCON_LEN: usize = 500;
/// Longest textual public key in client info (64 hex digits).
pub const MAX_PUBLIC_KEY_TEXT_LEN: usize = 64;
/// Most content entries a single check-content packet may carry.
pub const MAX_CONTENT_ENTRIES: usize = 255;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies one participant for the lifetime of a server session.
///
/// `0` is never a valid participant and `1` is the server itself when it
/// takes part in the game. Joining clients are numbered from 2 upward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const INVALID: ClientId = ClientId(0);
    pub const SERVER: ClientId = ClientId(1);
    /// The first id handed to a joining client.
    pub const FIRST_REMOTE: ClientId = ClientId(2);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// The company (team) a participant plays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(pub u8);

impl CompanyId {
    /// Watching without controlling a company.
    pub const SPECTATOR: CompanyId = CompanyId(255);
    /// Ask the server to found a new company.
    pub const NEW_COMPANY: CompanyId = CompanyId(254);

    pub fn is_spectator(self) -> bool {
        self == Self::SPECTATOR
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SPECTATOR => write!(f, "spectator"),
            Self::NEW_COMPANY => write!(f, "new-company"),
            CompanyId(id) => write!(f, "company-{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Reason codes carried by error and error-quit packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    General = 0,
    Desync = 1,
    SnapshotFailed = 2,
    ConnectionLost = 3,
    IllegalPacket = 4,
    ContentMismatch = 5,
    NotAuthorized = 6,
    NotExpected = 7,
    WrongRevision = 8,
    NameInUse = 9,
    WrongPassword = 10,
    CompanyMismatch = 11,
    Kicked = 12,
    Cheater = 13,
    Full = 14,
    TooManyCommands = 15,
    TimeoutPassword = 16,
    TimeoutComputer = 17,
    TimeoutMap = 18,
    TimeoutJoin = 19,
    InvalidClientName = 20,
    NotOnAllowList = 21,
    NoAuthenticationMethod = 22,
}

impl ErrorCode {
    const ALL: [ErrorCode; 23] = [
        ErrorCode::General,
        ErrorCode::Desync,
        ErrorCode::SnapshotFailed,
        ErrorCode::ConnectionLost,
        ErrorCode::IllegalPacket,
        ErrorCode::ContentMismatch,
        ErrorCode::NotAuthorized,
        ErrorCode::NotExpected,
        ErrorCode::WrongRevision,
        ErrorCode::NameInUse,
        ErrorCode::WrongPassword,
        ErrorCode::CompanyMismatch,
        ErrorCode::Kicked,
        ErrorCode::Cheater,
        ErrorCode::Full,
        ErrorCode::TooManyCommands,
        ErrorCode::TimeoutPassword,
        ErrorCode::TimeoutComputer,
        ErrorCode::TimeoutMap,
        ErrorCode::TimeoutJoin,
        ErrorCode::InvalidClientName,
        ErrorCode::NotOnAllowList,
        ErrorCode::NoAuthenticationMethod,
    ];
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::InvalidValue {
                field: "error_code",
                value: value as u64,
            })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::General => "general error",
            ErrorCode::Desync => "desync",
            ErrorCode::SnapshotFailed => "could not load snapshot",
            ErrorCode::ConnectionLost => "connection lost",
            ErrorCode::IllegalPacket => "illegal packet",
            ErrorCode::ContentMismatch => "content mismatch",
            ErrorCode::NotAuthorized => "not authorized",
            ErrorCode::NotExpected => "unexpected packet",
            ErrorCode::WrongRevision => "wrong revision",
            ErrorCode::NameInUse => "name already in use",
            ErrorCode::WrongPassword => "wrong password",
            ErrorCode::CompanyMismatch => "company mismatch",
            ErrorCode::Kicked => "kicked",
            ErrorCode::Cheater => "cheater",
            ErrorCode::Full => "server full",
            ErrorCode::TooManyCommands => "too many commands",
            ErrorCode::TimeoutPassword => "password timeout",
            ErrorCode::TimeoutComputer => "computer too slow",
            ErrorCode::TimeoutMap => "map download timeout",
            ErrorCode::TimeoutJoin => "join timeout",
            ErrorCode::InvalidClientName => "invalid client name",
            ErrorCode::NotOnAllowList => "not on allow list",
            ErrorCode::NoAuthenticationMethod => "no authentication method available",
        };
        f.write_str(text)
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// What kind of notice a chat packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkAction {
    Join = 0,
    Leave = 1,
    ServerMessage = 2,
    Chat = 3,
    ChatCompany = 4,
    ChatClient = 5,
    GiveMoney = 6,
    NameChange = 7,
    CompanySpectator = 8,
    CompanyJoin = 9,
    CompanyNew = 10,
    Kicked = 11,
    ExternalChat = 12,
}

impl TryFrom<u8> for NetworkAction {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NetworkAction::*;
        Ok(match value {
            0 => Join,
            1 => Leave,
            2 => ServerMessage,
            3 => Chat,
            4 => ChatCompany,
            5 => ChatClient,
            6 => GiveMoney,
            7 => NameChange,
            8 => CompanySpectator,
            9 => CompanyJoin,
            10 => CompanyNew,
            11 => Kicked,
            12 => ExternalChat,
            other => {
                return Err(ProtocolError::InvalidValue {
                    field: "action",
                    value: other as u64,
                });
            }
        })
    }
}

/// Who a chat message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DestType {
    /// Everyone.
    Broadcast = 0,
    /// Every client of one company; the destination id is a company.
    Team = 1,
    /// One client; the destination id is a client id.
    Client = 2,
}

impl TryFrom<u8> for DestType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DestType::Broadcast),
            1 => Ok(DestType::Team),
            2 => Ok(DestType::Client),
            other => Err(ProtocolError::InvalidValue {
                field: "dest_type",
                value: other as u64,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// How the server wants the client to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AuthMethod {
    /// Plain X25519 key exchange; proves nothing but sets up encryption.
    KeyExchangeOnly = 0,
    /// Key exchange with the server password mixed into the derived keys.
    Password = 1,
}

impl TryFrom<u8> for AuthMethod {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthMethod::KeyExchangeOnly),
            1 => Ok(AuthMethod::Password),
            other => Err(ProtocolError::InvalidValue {
                field: "auth_method",
                value: other as u64,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulation-facing values
// ---------------------------------------------------------------------------

/// The determinism checksum: the simulation's random seed state at a frame.
///
/// Two peers that executed the same commands at the same frames have the
/// same seeds. A difference means the simulations diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSeeds {
    pub seed1: u32,
    pub seed2: u32,
}

impl fmt::Display for SyncSeeds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.seed1, self.seed2)
    }
}

/// One piece of content (an add-on) the simulation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    pub id: u32,
    /// MD5 of the content, as computed by the content system.
    pub checksum: [u8; 16],
}

/// Public summary of a server, answered to game-info queries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameInfo {
    pub server_name: String,
    pub revision: String,
    pub use_password: bool,
    pub clients_on: u8,
    pub clients_max: u8,
    pub companies_on: u8,
    pub companies_max: u8,
    pub spectators_on: u8,
    pub frame: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_reserved_values() {
        assert!(!ClientId::INVALID.is_valid());
        assert!(ClientId::SERVER.is_valid());
        assert!(ClientId::FIRST_REMOTE > ClientId::SERVER);
        assert_eq!(ClientId(5).to_string(), "C-5");
    }

    #[test]
    fn test_error_code_try_from_round_trips_every_variant() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::try_from(code as u8), Ok(code));
        }
    }

    #[test]
    fn test_error_code_try_from_unknown_returns_invalid_value() {
        assert!(matches!(
            ErrorCode::try_from(200),
            Err(ProtocolError::InvalidValue { field: "error_code", value: 200 })
        ));
    }

    #[test]
    fn test_network_action_and_dest_type_reject_unknown_bytes() {
        assert_eq!(NetworkAction::try_from(3), Ok(NetworkAction::Chat));
        assert!(NetworkAction::try_from(13).is_err());
        assert_eq!(DestType::try_from(1), Ok(DestType::Team));
        assert!(DestType::try_from(3).is_err());
    }

    #[test]
    fn test_company_display_names_special_values() {
        assert_eq!(CompanyId::SPECTATOR.to_string(), "spectator");
        assert_eq!(CompanyId(3).to_string(), "company-3");
    }
}
