//! Wire protocol for Lockstep.
//!
//! This crate defines the bytes that servers and clients exchange:
//!
//! - **Codec** ([`PacketWriter`], [`PacketReader`], [`split_packet`]):
//!   the length-prefixed binary packet format and stream framing.
//! - **Kinds** ([`PacketKind`], [`Role`]): the closed set of packet
//!   kinds and which side may send each one.
//! - **Messages** ([`Message`]): one typed payload per kind.
//! - **Commands** ([`CommandPacket`], [`CommandQueue`]): the simulation
//!   mutations that lockstep replicates.
//! - **Errors** ([`ProtocolError`]): what can go wrong with the bytes.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (a byte stream) and session
//! (connection state). It doesn't know about sockets or connection state;
//! it only turns packets into messages and back.
//!
//! ```text
//! Transport (bytes) → split_packet → RawPacket → PacketKind::for_receiver → Message
//! ```

mod codec;
mod command;
mod error;
mod kind;
mod message;
mod types;

pub use codec::{
    COMPAT_MTU, ENCRYPTION_OVERHEAD, HEADER_SIZE, PacketReader, PacketWriter,
    RawPacket, SEND_MTU, split_packet,
};
pub use command::{CommandPacket, CommandQueue, MAX_COMMAND_DATA_LEN};
pub use error::ProtocolError;
pub use kind::{PacketKind, Role, Tier};
pub use message::{CHALLENGE_LEN, MAC_LEN, Message, NONCE_LEN, PUBLIC_KEY_LEN};
pub use types::{
    AuthMethod, ClientId, CompanyId, ContentId, DestType, ErrorCode, GameInfo,
    MAX_CHAT_LEN, MAX_CLIENT_NAME_LEN, MAX_CONTENT_ENTRIES,
    MAX_PUBLIC_KEY_TEXT_LEN, MAX_RCON_LEN, MAX_REVISION_LEN,
    MAX_SERVER_NAME_LEN, NetworkAction, SyncSeeds,
};
