//! Binary packet codec: typed fields in, bytes out (and back).
//!
//! Every packet on the wire has the same three-byte header followed by a
//! payload whose shape depends on the packet kind:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────────────────┐
//! │ size: u16 LE │ kind: u8  │ payload (kind-specific)      │
//! └──────────────┴───────────┴──────────────────────────────┘
//!   size counts the whole packet, header included
//! ```
//!
//! The codec itself is versionless: it knows how to write and read
//! integers, strings, and blobs, but not what a "frame packet" looks like.
//! That knowledge lives in [`Message`](crate::Message).
//!
//! Integers are little-endian. Strings and blobs carry a `u16` length
//! prefix. Fixed-size arrays (keys, nonces, MACs) are written raw.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{PacketKind, ProtocolError};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Hard upper bound on the size of one packet, header included.
pub const SEND_MTU: usize = 32767;

/// Packet size that is safe for every peer, including ones still probing
/// the server with Tier A packets.
pub const COMPAT_MTU: usize = 1460;

/// Bytes taken by the `size` + `kind` header.
pub const HEADER_SIZE: usize = 3;

/// Bytes added to a payload once the connection is encrypted (the
/// Poly1305 tag). Writers reserve this so a sealed packet still fits.
pub const ENCRYPTION_OVERHEAD: usize = 16;

// ---------------------------------------------------------------------------
// PacketWriter
// ---------------------------------------------------------------------------

/// Builds one packet, enforcing the packet size limit on every write.
///
/// ```rust
/// use lockstep_protocol::{PacketKind, PacketReader, PacketWriter, RawPacket};
///
/// let mut w = PacketWriter::new(PacketKind::ClientAck);
/// w.put_u32(42).unwrap();
/// w.put_u8(7).unwrap();
/// let bytes = w.finish();
///
/// let raw = RawPacket::parse(&bytes).unwrap();
/// let mut r = PacketReader::new(&raw.payload);
/// assert_eq!(r.get_u32().unwrap(), 42);
/// assert_eq!(r.get_u8().unwrap(), 7);
/// ```
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
    limit: usize,
}

impl PacketWriter {
    /// Starts a packet of the given kind with the default limit
    /// (`SEND_MTU` minus room for the encryption tag).
    pub fn new(kind: PacketKind) -> Self {
        Self::with_limit(kind, SEND_MTU - ENCRYPTION_OVERHEAD)
    }

    /// Starts a packet with a custom size limit. The limit is capped at
    /// [`SEND_MTU`] since the size field could not describe anything larger
    /// that every peer accepts.
    pub fn with_limit(kind: PacketKind, limit: usize) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        // Size placeholder, patched in `finish`.
        buf.put_u16_le(0);
        buf.put_u8(kind as u8);
        Self {
            buf,
            limit: limit.clamp(HEADER_SIZE, SEND_MTU),
        }
    }

    fn reserve(&self, additional: usize) -> Result<(), ProtocolError> {
        let len = self.buf.len() + additional;
        if len > self.limit {
            return Err(ProtocolError::Oversized {
                len,
                limit: self.limit,
            });
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.reserve(1)?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), ProtocolError> {
        self.reserve(2)?;
        self.buf.put_u16_le(value);
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.reserve(4)?;
        self.buf.put_u32_le(value);
        Ok(())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<(), ProtocolError> {
        self.reserve(8)?;
        self.buf.put_u64_le(value);
        Ok(())
    }

    pub fn put_bool(&mut self, value: bool) -> Result<(), ProtocolError> {
        self.put_u8(u8::from(value))
    }

    /// Writes bytes as-is, without a length prefix. Used for fixed-size
    /// fields whose length both sides already know.
    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.reserve(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string of at most `max_len` bytes.
    pub fn put_str(
        &mut self,
        value: &str,
        max_len: usize,
    ) -> Result<(), ProtocolError> {
        self.put_blob(value.as_bytes(), max_len)
    }

    /// Writes a length-prefixed byte blob of at most `max_len` bytes.
    pub fn put_blob(
        &mut self,
        value: &[u8],
        max_len: usize,
    ) -> Result<(), ProtocolError> {
        let limit = max_len.min(u16::MAX as usize);
        if value.len() > limit {
            return Err(ProtocolError::Oversized {
                len: value.len(),
                limit,
            });
        }
        self.reserve(2 + value.len())?;
        self.buf.put_u16_le(value.len() as u16);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Current packet length, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing but the header has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    /// How many more payload bytes fit before the limit is hit.
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    /// Patches the size field and returns the finished packet.
    pub fn finish(mut self) -> Bytes {
        let size = self.buf.len() as u16;
        self.buf[..2].copy_from_slice(&size.to_le_bytes());
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// PacketReader
// ---------------------------------------------------------------------------

/// Reads typed fields from a packet payload, bounds-checking every read.
///
/// The reader borrows the payload; `get_*` calls advance a cursor. There is
/// no implicit coercion: reading a `u32` needs four bytes, full stop.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a boolean. Only `0` and `1` are valid encodings.
    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                field: "bool",
                value: other as u64,
            }),
        }
    }

    /// Reads exactly `N` raw bytes.
    pub fn get_array<const N: usize>(
        &mut self,
    ) -> Result<[u8; N], ProtocolError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a length-prefixed string, rejecting declared lengths above
    /// `max_len` before looking at the bytes.
    pub fn get_str(&mut self, max_len: usize) -> Result<String, ProtocolError> {
        let bytes = self.get_blob_slice(max_len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidString)
    }

    /// Reads a length-prefixed blob of at most `max_len` bytes.
    pub fn get_blob(&mut self, max_len: usize) -> Result<Bytes, ProtocolError> {
        self.get_blob_slice(max_len).map(Bytes::copy_from_slice)
    }

    fn get_blob_slice(&mut self, max_len: usize) -> Result<&'a [u8], ProtocolError> {
        let len = self.get_u16()? as usize;
        if len > max_len {
            return Err(ProtocolError::Oversized {
                len,
                limit: max_len,
            });
        }
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Consumes and returns everything left in the payload.
    pub fn get_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

// ---------------------------------------------------------------------------
// RawPacket and stream framing
// ---------------------------------------------------------------------------

/// A framed packet whose kind byte has not been interpreted yet.
///
/// The kind stays a raw `u8` here on purpose: deciding whether a kind is
/// legal is the registry's job ([`PacketKind::for_receiver`]), and it needs
/// to know which side is receiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub kind: u8,
    pub payload: Bytes,
}

impl RawPacket {
    /// Parses exactly one complete packet.
    pub fn parse(packet: &[u8]) -> Result<Self, ProtocolError> {
        if packet.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                remaining: packet.len(),
            });
        }
        let size = u16::from_le_bytes([packet[0], packet[1]]) as usize;
        if size < HEADER_SIZE || size > packet.len() {
            return Err(ProtocolError::Truncated {
                needed: size.max(HEADER_SIZE),
                remaining: packet.len(),
            });
        }
        Ok(Self {
            kind: packet[2],
            payload: Bytes::copy_from_slice(&packet[HEADER_SIZE..size]),
        })
    }

    /// Re-assembles the packet, header included. Used after the payload
    /// was replaced (for example by encryption).
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let size = HEADER_SIZE + self.payload.len();
        if size > SEND_MTU {
            return Err(ProtocolError::Oversized {
                len: size,
                limit: SEND_MTU,
            });
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16_le(size as u16);
        buf.put_u8(self.kind);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Splits the next complete packet off the front of a stream buffer.
///
/// Returns `Ok(None)` when the buffer does not hold a whole packet yet;
/// the partial bytes stay in `buf` for the next read.
///
/// # Errors
/// - [`ProtocolError::Truncated`] if the declared size is smaller than the
///   header (the stream is corrupt).
/// - [`ProtocolError::Oversized`] if the declared size exceeds `limit`.
pub fn split_packet(
    buf: &mut BytesMut,
    limit: usize,
) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let size = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if size < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: HEADER_SIZE,
            remaining: size,
        });
    }
    if size > limit {
        return Err(ProtocolError::Oversized { len: size, limit });
    }
    if buf.len() < size {
        return Ok(None);
    }
    Ok(Some(buf.split_to(size).freeze()))
}
