//! Typed packet payloads: one [`Message`] variant per packet kind.
//!
//! This is where payload shapes live. The codec only knows fields; this
//! module knows that a frame packet is two `u32`s, optional seeds, and an
//! optional token. Receivers decode once, then dispatch with a single
//! `match` over the variant.

use bytes::Bytes;

use crate::codec::{PacketReader, PacketWriter};
use crate::command::{CommandPacket, MAX_COMMAND_DATA_LEN};
use crate::types::{
    AuthMethod, ClientId, CompanyId, ContentId, DestType, ErrorCode, GameInfo,
    MAX_CHAT_LEN, MAX_CLIENT_NAME_LEN, MAX_CONTENT_ENTRIES,
    MAX_PUBLIC_KEY_TEXT_LEN, MAX_RCON_LEN, MAX_REVISION_LEN,
    MAX_SERVER_NAME_LEN, NetworkAction, SyncSeeds,
};
use crate::{PacketKind, ProtocolError, RawPacket};

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of an XChaCha20 nonce.
pub const NONCE_LEN: usize = 24;
/// Length of a Poly1305 tag.
pub const MAC_LEN: usize = 16;
/// Length of the random challenge a client encrypts to prove its keys.
pub const CHALLENGE_LEN: usize = 8;

const FRAME_HAS_SEEDS: u8 = 0b01;
const FRAME_HAS_TOKEN: u8 = 0b10;

/// A decoded packet.
///
/// Variants are named after their [`PacketKind`]; retired kinds have no
/// variant because they can never be received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // -- Tier A -------------------------------------------------------------
    ServerFull,
    ServerBanned,
    ClientJoin { revision: String, company: CompanyId },
    ServerError { code: ErrorCode },
    ServerGameInfo(GameInfo),
    ClientGameInfo,
    ServerNewGame,
    ServerShutdown,

    // -- Handshake ----------------------------------------------------------
    ServerAuthRequest {
        method: AuthMethod,
        public_key: [u8; PUBLIC_KEY_LEN],
        nonce: [u8; NONCE_LEN],
    },
    ClientAuthResponse {
        public_key: [u8; PUBLIC_KEY_LEN],
        mac: [u8; MAC_LEN],
        challenge: [u8; CHALLENGE_LEN],
    },
    ServerEnableEncryption { nonce: [u8; NONCE_LEN] },
    ClientIdentify { name: String, company: CompanyId },
    ServerCheckContent { content: Vec<ContentId> },
    ClientContentChecked,
    ServerWelcome { client_id: ClientId },
    ServerClientInfo {
        client_id: ClientId,
        company: CompanyId,
        name: String,
        public_key: String,
    },

    // -- Map transfer -------------------------------------------------------
    ClientGetMap,
    ServerWait { waiting: u8 },
    ServerMapBegin { frame: u32 },
    ServerMapSize { bytes: u32 },
    ServerMapData { chunk: Bytes },
    ServerMapDone,
    ClientMapOk,
    ServerJoin { client_id: ClientId },

    // -- In game ------------------------------------------------------------
    ServerFrame {
        frame: u32,
        frame_max: u32,
        seeds: Option<SyncSeeds>,
        token: Option<u8>,
    },
    ClientAck { frame: u32, token: u8 },
    ServerSync { frame: u32, seeds: SyncSeeds },
    ClientCommand(CommandPacket),
    ServerCommand(CommandPacket),
    ClientChat {
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: String,
        data: u64,
    },
    ServerChat {
        action: NetworkAction,
        client_id: ClientId,
        self_send: bool,
        message: String,
        data: u64,
    },
    ServerExternalChat {
        source: String,
        colour: u16,
        user: String,
        message: String,
    },
    ClientRcon { password: String, command: String },
    ServerRcon { colour: u16, output: String },
    ClientMove { company: CompanyId },
    ServerMove { client_id: ClientId, company: CompanyId },
    ClientSetName { name: String },
    ServerConfigUpdate { max_companies: u8, max_spectators: u8 },

    // -- Leaving ------------------------------------------------------------
    ClientQuit,
    ServerQuit { client_id: ClientId },
    ClientError { code: ErrorCode },
    ServerErrorQuit { client_id: ClientId, code: ErrorCode },
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        use Message as M;
        use PacketKind as K;
        match self {
            M::ServerFull => K::ServerFull,
            M::ServerBanned => K::ServerBanned,
            M::ClientJoin { .. } => K::ClientJoin,
            M::ServerError { .. } => K::ServerError,
            M::ServerGameInfo(_) => K::ServerGameInfo,
            M::ClientGameInfo => K::ClientGameInfo,
            M::ServerNewGame => K::ServerNewGame,
            M::ServerShutdown => K::ServerShutdown,
            M::ServerAuthRequest { .. } => K::ServerAuthRequest,
            M::ClientAuthResponse { .. } => K::ClientAuthResponse,
            M::ServerEnableEncryption { .. } => K::ServerEnableEncryption,
            M::ClientIdentify { .. } => K::ClientIdentify,
            M::ServerCheckContent { .. } => K::ServerCheckContent,
            M::ClientContentChecked => K::ClientContentChecked,
            M::ServerWelcome { .. } => K::ServerWelcome,
            M::ServerClientInfo { .. } => K::ServerClientInfo,
            M::ClientGetMap => K::ClientGetMap,
            M::ServerWait { .. } => K::ServerWait,
            M::ServerMapBegin { .. } => K::ServerMapBegin,
            M::ServerMapSize { .. } => K::ServerMapSize,
            M::ServerMapData { .. } => K::ServerMapData,
            M::ServerMapDone => K::ServerMapDone,
            M::ClientMapOk => K::ClientMapOk,
            M::ServerJoin { .. } => K::ServerJoin,
            M::ServerFrame { .. } => K::ServerFrame,
            M::ClientAck { .. } => K::ClientAck,
            M::ServerSync { .. } => K::ServerSync,
            M::ClientCommand(_) => K::ClientCommand,
            M::ServerCommand(_) => K::ServerCommand,
            M::ClientChat { .. } => K::ClientChat,
            M::ServerChat { .. } => K::ServerChat,
            M::ServerExternalChat { .. } => K::ServerExternalChat,
            M::ClientRcon { .. } => K::ClientRcon,
            M::ServerRcon { .. } => K::ServerRcon,
            M::ClientMove { .. } => K::ClientMove,
            M::ServerMove { .. } => K::ServerMove,
            M::ClientSetName { .. } => K::ClientSetName,
            M::ServerConfigUpdate { .. } => K::ServerConfigUpdate,
            M::ClientQuit => K::ClientQuit,
            M::ServerQuit { .. } => K::ServerQuit,
            M::ClientError { .. } => K::ClientError,
            M::ServerErrorQuit { .. } => K::ServerErrorQuit,
        }
    }

    /// Encodes the message into a complete packet, header included.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = PacketWriter::new(self.kind());
        self.write_payload(&mut w)?;
        Ok(w.finish())
    }

    fn write_payload(&self, w: &mut PacketWriter) -> Result<(), ProtocolError> {
        use Message as M;
        match self {
            M::ServerFull
            | M::ServerBanned
            | M::ClientGameInfo
            | M::ServerNewGame
            | M::ServerShutdown
            | M::ClientContentChecked
            | M::ClientGetMap
            | M::ServerMapDone
            | M::ClientMapOk
            | M::ClientQuit => {}

            M::ClientJoin { revision, company } => {
                w.put_str(revision, MAX_REVISION_LEN)?;
                w.put_u8(company.0)?;
            }
            M::ServerError { code } | M::ClientError { code } => {
                w.put_u8(*code as u8)?;
            }
            M::ServerGameInfo(info) => write_game_info(w, info)?,

            M::ServerAuthRequest {
                method,
                public_key,
                nonce,
            } => {
                w.put_u8(*method as u8)?;
                w.put_raw(public_key)?;
                w.put_raw(nonce)?;
            }
            M::ClientAuthResponse {
                public_key,
                mac,
                challenge,
            } => {
                w.put_raw(public_key)?;
                w.put_raw(mac)?;
                w.put_raw(challenge)?;
            }
            M::ServerEnableEncryption { nonce } => w.put_raw(nonce)?,
            M::ClientIdentify { name, company } => {
                w.put_str(name, MAX_CLIENT_NAME_LEN)?;
                w.put_u8(company.0)?;
            }
            M::ServerCheckContent { content } => {
                if content.len() > MAX_CONTENT_ENTRIES {
                    return Err(ProtocolError::Oversized {
                        len: content.len(),
                        limit: MAX_CONTENT_ENTRIES,
                    });
                }
                w.put_u8(content.len() as u8)?;
                for entry in content {
                    w.put_u32(entry.id)?;
                    w.put_raw(&entry.checksum)?;
                }
            }
            M::ServerWelcome { client_id }
            | M::ServerJoin { client_id }
            | M::ServerQuit { client_id } => w.put_u32(client_id.0)?,
            M::ServerClientInfo {
                client_id,
                company,
                name,
                public_key,
            } => {
                w.put_u32(client_id.0)?;
                w.put_u8(company.0)?;
                w.put_str(name, MAX_CLIENT_NAME_LEN)?;
                w.put_str(public_key, MAX_PUBLIC_KEY_TEXT_LEN)?;
            }

            M::ServerWait { waiting } => w.put_u8(*waiting)?,
            M::ServerMapBegin { frame } => w.put_u32(*frame)?,
            M::ServerMapSize { bytes } => w.put_u32(*bytes)?,
            M::ServerMapData { chunk } => w.put_raw(chunk)?,

            M::ServerFrame {
                frame,
                frame_max,
                seeds,
                token,
            } => {
                let mut flags = 0;
                if seeds.is_some() {
                    flags |= FRAME_HAS_SEEDS;
                }
                if token.is_some() {
                    flags |= FRAME_HAS_TOKEN;
                }
                w.put_u8(flags)?;
                w.put_u32(*frame)?;
                w.put_u32(*frame_max)?;
                if let Some(seeds) = seeds {
                    w.put_u32(seeds.seed1)?;
                    w.put_u32(seeds.seed2)?;
                }
                if let Some(token) = token {
                    w.put_u8(*token)?;
                }
            }
            M::ClientAck { frame, token } => {
                w.put_u32(*frame)?;
                w.put_u8(*token)?;
            }
            M::ServerSync { frame, seeds } => {
                w.put_u32(*frame)?;
                w.put_u32(seeds.seed1)?;
                w.put_u32(seeds.seed2)?;
            }
            M::ClientCommand(cp) => write_command(w, cp)?,
            M::ServerCommand(cp) => {
                write_command(w, cp)?;
                w.put_u32(cp.frame)?;
                w.put_bool(cp.my_cmd)?;
            }

            M::ClientChat {
                action,
                dest_type,
                dest,
                message,
                data,
            } => {
                w.put_u8(*action as u8)?;
                w.put_u8(*dest_type as u8)?;
                w.put_u32(*dest)?;
                w.put_str(message, MAX_CHAT_LEN)?;
                w.put_u64(*data)?;
            }
            M::ServerChat {
                action,
                client_id,
                self_send,
                message,
                data,
            } => {
                w.put_u8(*action as u8)?;
                w.put_u32(client_id.0)?;
                w.put_bool(*self_send)?;
                w.put_str(message, MAX_CHAT_LEN)?;
                w.put_u64(*data)?;
            }
            M::ServerExternalChat {
                source,
                colour,
                user,
                message,
            } => {
                w.put_str(source, MAX_CLIENT_NAME_LEN)?;
                w.put_u16(*colour)?;
                w.put_str(user, MAX_CLIENT_NAME_LEN)?;
                w.put_str(message, MAX_CHAT_LEN)?;
            }
            M::ClientRcon { password, command } => {
                w.put_str(password, MAX_RCON_LEN)?;
                w.put_str(command, MAX_RCON_LEN)?;
            }
            M::ServerRcon { colour, output } => {
                w.put_u16(*colour)?;
                w.put_str(output, MAX_CHAT_LEN)?;
            }
            M::ClientMove { company } => w.put_u8(company.0)?,
            M::ServerMove { client_id, company } => {
                w.put_u32(client_id.0)?;
                w.put_u8(company.0)?;
            }
            M::ClientSetName { name } => w.put_str(name, MAX_CLIENT_NAME_LEN)?,
            M::ServerConfigUpdate {
                max_companies,
                max_spectators,
            } => {
                w.put_u8(*max_companies)?;
                w.put_u8(*max_spectators)?;
            }
            M::ServerErrorQuit { client_id, code } => {
                w.put_u32(client_id.0)?;
                w.put_u8(*code as u8)?;
            }
        }
        Ok(())
    }

    /// Decodes a raw packet whose kind was already checked for the receiver.
    pub fn from_raw(kind: PacketKind, raw: &RawPacket) -> Result<Self, ProtocolError> {
        Self::decode(kind, &raw.payload)
    }

    /// Decodes a payload of the given kind.
    ///
    /// Trailing bytes after the last known field are ignored, so a newer
    /// peer may append fields without breaking older readers.
    pub fn decode(kind: PacketKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        use Message as M;
        use PacketKind as K;
        let mut r = PacketReader::new(payload);
        let r = &mut r;
        Ok(match kind {
            K::ServerFull => M::ServerFull,
            K::ServerBanned => M::ServerBanned,
            K::ClientJoin => M::ClientJoin {
                revision: r.get_str(MAX_REVISION_LEN)?,
                company: CompanyId(r.get_u8()?),
            },
            K::ServerError => M::ServerError {
                code: ErrorCode::try_from(r.get_u8()?)?,
            },
            K::ClientUnused | K::ServerUnused => {
                return Err(ProtocolError::InvalidPacketKind(kind as u8));
            }
            K::ServerGameInfo => M::ServerGameInfo(read_game_info(r)?),
            K::ClientGameInfo => M::ClientGameInfo,
            K::ServerNewGame => M::ServerNewGame,
            K::ServerShutdown => M::ServerShutdown,

            K::ServerAuthRequest => M::ServerAuthRequest {
                method: AuthMethod::try_from(r.get_u8()?)?,
                public_key: r.get_array()?,
                nonce: r.get_array()?,
            },
            K::ClientAuthResponse => M::ClientAuthResponse {
                public_key: r.get_array()?,
                mac: r.get_array()?,
                challenge: r.get_array()?,
            },
            K::ServerEnableEncryption => M::ServerEnableEncryption {
                nonce: r.get_array()?,
            },
            K::ClientIdentify => M::ClientIdentify {
                name: r.get_str(MAX_CLIENT_NAME_LEN)?,
                company: CompanyId(r.get_u8()?),
            },
            K::ServerCheckContent => {
                let count = r.get_u8()? as usize;
                let mut content = Vec::with_capacity(count);
                for _ in 0..count {
                    content.push(ContentId {
                        id: r.get_u32()?,
                        checksum: r.get_array()?,
                    });
                }
                M::ServerCheckContent { content }
            }
            K::ClientContentChecked => M::ClientContentChecked,
            K::ServerWelcome => M::ServerWelcome {
                client_id: ClientId(r.get_u32()?),
            },
            K::ServerClientInfo => M::ServerClientInfo {
                client_id: ClientId(r.get_u32()?),
                company: CompanyId(r.get_u8()?),
                name: r.get_str(MAX_CLIENT_NAME_LEN)?,
                public_key: r.get_str(MAX_PUBLIC_KEY_TEXT_LEN)?,
            },

            K::ClientGetMap => M::ClientGetMap,
            K::ServerWait => M::ServerWait {
                waiting: r.get_u8()?,
            },
            K::ServerMapBegin => M::ServerMapBegin {
                frame: r.get_u32()?,
            },
            K::ServerMapSize => M::ServerMapSize {
                bytes: r.get_u32()?,
            },
            K::ServerMapData => M::ServerMapData {
                chunk: Bytes::copy_from_slice(r.get_rest()),
            },
            K::ServerMapDone => M::ServerMapDone,
            K::ClientMapOk => M::ClientMapOk,
            K::ServerJoin => M::ServerJoin {
                client_id: ClientId(r.get_u32()?),
            },

            K::ServerFrame => {
                let flags = r.get_u8()?;
                let frame = r.get_u32()?;
                let frame_max = r.get_u32()?;
                let seeds = if flags & FRAME_HAS_SEEDS != 0 {
                    Some(SyncSeeds {
                        seed1: r.get_u32()?,
                        seed2: r.get_u32()?,
                    })
                } else {
                    None
                };
                let token = if flags & FRAME_HAS_TOKEN != 0 {
                    Some(r.get_u8()?)
                } else {
                    None
                };
                M::ServerFrame {
                    frame,
                    frame_max,
                    seeds,
                    token,
                }
            }
            K::ClientAck => M::ClientAck {
                frame: r.get_u32()?,
                token: r.get_u8()?,
            },
            K::ServerSync => M::ServerSync {
                frame: r.get_u32()?,
                seeds: SyncSeeds {
                    seed1: r.get_u32()?,
                    seed2: r.get_u32()?,
                },
            },
            K::ClientCommand => M::ClientCommand(read_command(r)?),
            K::ServerCommand => {
                let mut cp = read_command(r)?;
                cp.frame = r.get_u32()?;
                cp.my_cmd = r.get_bool()?;
                M::ServerCommand(cp)
            }

            K::ClientChat => M::ClientChat {
                action: NetworkAction::try_from(r.get_u8()?)?,
                dest_type: DestType::try_from(r.get_u8()?)?,
                dest: r.get_u32()?,
                message: r.get_str(MAX_CHAT_LEN)?,
                data: r.get_u64()?,
            },
            K::ServerChat => M::ServerChat {
                action: NetworkAction::try_from(r.get_u8()?)?,
                client_id: ClientId(r.get_u32()?),
                self_send: r.get_bool()?,
                message: r.get_str(MAX_CHAT_LEN)?,
                data: r.get_u64()?,
            },
            K::ServerExternalChat => M::ServerExternalChat {
                source: r.get_str(MAX_CLIENT_NAME_LEN)?,
                colour: r.get_u16()?,
                user: r.get_str(MAX_CLIENT_NAME_LEN)?,
                message: r.get_str(MAX_CHAT_LEN)?,
            },
            K::ClientRcon => M::ClientRcon {
                password: r.get_str(MAX_RCON_LEN)?,
                command: r.get_str(MAX_RCON_LEN)?,
            },
            K::ServerRcon => M::ServerRcon {
                colour: r.get_u16()?,
                output: r.get_str(MAX_CHAT_LEN)?,
            },
            K::ClientMove => M::ClientMove {
                company: CompanyId(r.get_u8()?),
            },
            K::ServerMove => M::ServerMove {
                client_id: ClientId(r.get_u32()?),
                company: CompanyId(r.get_u8()?),
            },
            K::ClientSetName => M::ClientSetName {
                name: r.get_str(MAX_CLIENT_NAME_LEN)?,
            },
            K::ServerConfigUpdate => M::ServerConfigUpdate {
                max_companies: r.get_u8()?,
                max_spectators: r.get_u8()?,
            },

            K::ClientQuit => M::ClientQuit,
            K::ServerQuit => M::ServerQuit {
                client_id: ClientId(r.get_u32()?),
            },
            K::ClientError => M::ClientError {
                code: ErrorCode::try_from(r.get_u8()?)?,
            },
            K::ServerErrorQuit => M::ServerErrorQuit {
                client_id: ClientId(r.get_u32()?),
                code: ErrorCode::try_from(r.get_u8()?)?,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Shared payload pieces
// ---------------------------------------------------------------------------

fn write_command(w: &mut PacketWriter, cp: &CommandPacket) -> Result<(), ProtocolError> {
    w.put_u8(cp.company.0)?;
    w.put_u32(cp.cmd)?;
    w.put_blob(&cp.data, MAX_COMMAND_DATA_LEN)?;
    w.put_u8(cp.callback)
}

fn read_command(r: &mut PacketReader<'_>) -> Result<CommandPacket, ProtocolError> {
    let company = CompanyId(r.get_u8()?);
    let cmd = r.get_u32()?;
    let data = r.get_blob(MAX_COMMAND_DATA_LEN)?;
    let callback = r.get_u8()?;
    Ok(CommandPacket::new(company, cmd, data, callback))
}

fn write_game_info(w: &mut PacketWriter, info: &GameInfo) -> Result<(), ProtocolError> {
    w.put_str(&info.server_name, MAX_SERVER_NAME_LEN)?;
    w.put_str(&info.revision, MAX_REVISION_LEN)?;
    w.put_bool(info.use_password)?;
    w.put_u8(info.clients_on)?;
    w.put_u8(info.clients_max)?;
    w.put_u8(info.companies_on)?;
    w.put_u8(info.companies_max)?;
    w.put_u8(info.spectators_on)?;
    w.put_u32(info.frame)
}

fn read_game_info(r: &mut PacketReader<'_>) -> Result<GameInfo, ProtocolError> {
    Ok(GameInfo {
        server_name: r.get_str(MAX_SERVER_NAME_LEN)?,
        revision: r.get_str(MAX_REVISION_LEN)?,
        use_password: r.get_bool()?,
        clients_on: r.get_u8()?,
        clients_max: r.get_u8()?,
        companies_on: r.get_u8()?,
        companies_max: r.get_u8()?,
        spectators_on: r.get_u8()?,
        frame: r.get_u32()?,
    })
}
