//! Error types for the protocol layer.
//!
//! Each crate in Lockstep defines its own error enum. When you see a
//! `ProtocolError`, the problem is in the bytes themselves: a packet was
//! cut short, a field was larger than allowed, or a kind value is not one
//! this side of the connection may receive.

/// Errors that can occur while encoding or decoding packets.
///
/// All of these are fatal to the packet being processed. The session
/// layer decides what that means for the connection (almost always: close
/// it with a protocol-violation reason).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Fewer bytes remain in the packet than the next field requires.
    ///
    /// Also returned by stream framing when a declared packet size is
    /// smaller than the packet header itself.
    #[error("truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A length (declared on the wire or produced while encoding) exceeds
    /// the configured limit for that field or for the whole packet.
    #[error("oversized field: {len} bytes exceeds limit of {limit}")]
    Oversized { len: usize, limit: usize },

    /// The kind byte is unknown, retired, or may not be received by this
    /// side of the connection (e.g. a server receiving a server-only kind).
    #[error("invalid packet kind {0}")]
    InvalidPacketKind(u8),

    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidString,

    /// A field decoded fine but holds a value outside its domain,
    /// e.g. an unknown error code or authentication method.
    #[error("invalid value {value} for field `{field}`")]
    InvalidValue { field: &'static str, value: u64 },
}
