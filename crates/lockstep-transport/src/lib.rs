//! How packets get from one node to another.
//!
//! The nodes above this crate only ever see whole packets: a `u16` size,
//! a kind byte, and the payload. [`Transport`] hands out incoming links and
//! [`Connection`] moves packets over one of them. [`TcpTransport`] and
//! [`TcpConnection`] are the implementation used in practice; they cut the
//! TCP byte stream back into packets with
//! [`split_packet`](lockstep_protocol::split_packet).
//!
//! Bytes of a packet that has not fully arrived stay buffered inside the
//! connection until a later `recv` completes it.

#![allow(async_fn_in_trait)]

mod error;
mod tcp;

pub use error::TransportError;
pub use tcp::{TcpConnection, TcpTransport};

use std::net::SocketAddr;

use bytes::Bytes;

/// A listener for new links.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;
    type Error: std::error::Error + Send + Sync;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Stops handing out links. Accepted connections are not affected.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// One link that carries whole packets in both directions.
///
/// Everything takes `&self`: a reader task can sit in `recv` while a
/// writer task sends on the same connection.
pub trait Connection: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync;

    /// Writes `packet`, header included.
    async fn send(&self, packet: &[u8]) -> Result<(), Self::Error>;

    /// The next whole packet, or `Ok(None)` once the peer hung up cleanly
    /// on a packet boundary.
    async fn recv(&self) -> Result<Option<Bytes>, Self::Error>;

    /// Ends our side of the stream. Packets already sent still arrive.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Where the other end of the link is.
    fn peer_addr(&self) -> SocketAddr;
}
