//! TCP links carrying length-prefixed packets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use lockstep_protocol::{SEND_MTU, split_packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Connection, Transport, TransportError};

/// Listens for game connections on a TCP port.
pub struct TcpTransport {
    listener: TcpListener,
    shut_down: AtomicBool,
}

impl TcpTransport {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        let local = listener.local_addr().map_err(TransportError::Bind)?;
        info!(%local, "listening for game connections");
        Ok(Self {
            listener,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The address actually bound, which differs from the requested one
    /// after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::Bind)
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<TcpConnection, TransportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        let conn = TcpConnection::from_stream(stream, peer).map_err(|e| match e {
            TransportError::Connect(io) => TransportError::Accept(io),
            other => other,
        })?;
        debug!(%peer, "accepted game connection");
        Ok(conn)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

/// The read half plus whatever part of the next packet already arrived.
struct Inbox {
    half: OwnedReadHalf,
    pending: BytesMut,
}

/// One TCP stream cut into packets.
///
/// Reading and writing lock different halves, so a reader parked in
/// `recv` never holds up a `send`.
pub struct TcpConnection {
    peer: SocketAddr,
    local: SocketAddr,
    max_packet: usize,
    inbox: Mutex<Inbox>,
    outbox: Mutex<OwnedWriteHalf>,
}

impl TcpConnection {
    /// Dials a server.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await.map_err(TransportError::Connect)?;
        let peer = stream.peer_addr().map_err(TransportError::Connect)?;
        let conn = Self::from_stream(stream, peer)?;
        debug!(%peer, local = %conn.local, "connected to game server");
        Ok(conn)
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Result<Self, TransportError> {
        // Frame packets are tiny and every one of them gates a tick.
        stream.set_nodelay(true).map_err(TransportError::Connect)?;
        let local = stream.local_addr().map_err(TransportError::Connect)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            peer,
            local,
            max_packet: SEND_MTU,
            inbox: Mutex::new(Inbox {
                half: read,
                pending: BytesMut::with_capacity(4096),
            }),
            outbox: Mutex::new(write),
        })
    }

    /// Refuses packets larger than `max_packet` (never above the MTU).
    pub fn with_max_packet(mut self, max_packet: usize) -> Self {
        self.max_packet = max_packet.min(SEND_MTU);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Connection for TcpConnection {
    type Error = TransportError;

    async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        let mut out = self.outbox.lock().await;
        out.write_all(packet).await.map_err(TransportError::Send)
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        let Inbox { half, pending } = &mut *inbox;
        loop {
            if let Some(packet) = split_packet(pending, self.max_packet)? {
                return Ok(Some(packet));
            }
            if half.read_buf(pending).await.map_err(TransportError::Receive)? == 0 {
                return match pending.len() {
                    0 => Ok(None),
                    n => Err(TransportError::PartialPacket { pending: n }),
                };
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut out = self.outbox.lock().await;
        out.shutdown().await.map_err(TransportError::Send)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}
