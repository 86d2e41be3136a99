use std::io;

use lockstep_protocol::ProtocolError;

/// What can go wrong between the socket and a whole packet.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not listen: {0}")]
    Bind(#[source] io::Error),

    /// Opening or configuring an outgoing stream failed.
    #[error("could not connect: {0}")]
    Connect(#[source] io::Error),

    #[error("could not accept: {0}")]
    Accept(#[source] io::Error),

    #[error("write failed: {0}")]
    Send(#[source] io::Error),

    #[error("read failed: {0}")]
    Receive(#[source] io::Error),

    /// The peer hung up in the middle of a packet.
    #[error("stream ended with {pending} bytes of an unfinished packet")]
    PartialPacket { pending: usize },

    /// The stream carried something that is not a packet.
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    /// The listener no longer hands out connections.
    #[error("transport shut down")]
    Shutdown,
}
