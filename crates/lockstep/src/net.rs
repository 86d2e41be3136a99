//! Tokio drivers that put the nodes on the network.
//!
//! The nodes themselves never block; these drivers own the sockets and
//! the frame clock and shuttle bytes between them.
//!
//! # Server
//!
//! ```text
//!   accept task ──┐
//!   reader task ──┼──► node loop (GameServer, FrameClock) ──► writer task per connection
//!   reader task ──┘
//! ```
//!
//! Every connection gets a reader task that forwards whole packets to the
//! node loop and a writer task that drains a channel of outgoing packets.
//! The node loop is the only place the [`GameServer`] is touched, so no
//! locks are needed around it.
//!
//! # Client
//!
//! [`run_client`] does the same for one [`GameClient`]: one reader task,
//! and the loop itself writes to the socket.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lockstep_protocol::{ClientId, CommandPacket, CompanyId, DestType, NetworkAction};
use lockstep_session::PeerHandle;
use lockstep_sync::Simulation;
use lockstep_tick::{FrameClock, FrameClockConfig};
use lockstep_transport::{Connection, TcpConnection, TcpTransport, Transport, TransportError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{ClientEvent, GameClient, GameServer, LockstepError, ServerEvent};

/// How long shutdown waits for writers to flush their last packets.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Something the host asks the running server to do.
#[derive(Debug, Clone)]
pub enum ServerRequest {
    Command(CommandPacket),
    Chat {
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: String,
    },
    ExternalChat {
        source: String,
        colour: u16,
        user: String,
        message: String,
    },
    RconReply {
        client_id: ClientId,
        colour: u16,
        output: String,
    },
    UpdateConfig { max_companies: u8, max_spectators: u8 },
}

/// What the accept and reader tasks report to the node loop.
enum Inbound {
    Accepted(TcpConnection),
    Packet(PeerHandle, Bytes),
    Lost(PeerHandle),
}

enum Outbound {
    Packet(Bytes),
    Close,
}

/// The tasks serving one accepted connection.
struct Link {
    tx: UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Runs a [`GameServer`] on a TCP listener.
///
/// ```rust,ignore
/// let server = GameServer::new(config, MySim::default());
/// let runtime = ServerRuntime::bind("0.0.0.0:3979", server).await?;
/// let server = runtime.run(tokio::signal::ctrl_c()).await?;
/// ```
pub struct ServerRuntime<S: Simulation> {
    server: GameServer<S>,
    transport: TcpTransport,
    events: Option<UnboundedSender<ServerEvent>>,
    requests: Option<UnboundedReceiver<ServerRequest>>,
}

impl<S: Simulation> ServerRuntime<S> {
    /// Binds the listener. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        server: GameServer<S>,
    ) -> Result<Self, LockstepError> {
        let transport = TcpTransport::bind(addr).await?;
        Ok(Self {
            server,
            transport,
            events: None,
            requests: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LockstepError> {
        Ok(self.transport.local_addr()?)
    }

    /// Forwards every [`ServerEvent`] to `tx`.
    pub fn with_events(mut self, tx: UnboundedSender<ServerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Takes host requests from `rx` while running.
    pub fn with_requests(mut self, rx: UnboundedReceiver<ServerRequest>) -> Self {
        self.requests = Some(rx);
        self
    }

    /// Serves until `shutdown` resolves, then says goodbye to every
    /// client and hands the server back.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<GameServer<S>, LockstepError> {
        let Self {
            mut server,
            transport,
            events,
            mut requests,
        } = self;
        let mut clock = FrameClock::new(server.config().clock.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept = tokio::spawn(accept_loop(transport, tx.clone()));
        let mut links: HashMap<PeerHandle, Link> = HashMap::new();
        tokio::pin!(shutdown);

        info!(name = %server.config().server_name, "server running");
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(inbound) = rx.recv() => {
                    let now = Instant::now();
                    match inbound {
                        Inbound::Accepted(conn) => {
                            let handle = server.accept(now);
                            info!(%handle, peer = %conn.peer_addr(), "client connected");
                            links.insert(handle, spawn_link(handle, conn, tx.clone()));
                        }
                        Inbound::Packet(handle, packet) => server.receive(handle, &packet, now),
                        Inbound::Lost(handle) => server.connection_lost(handle, now),
                    }
                }
                Some(request) = recv_request(&mut requests) => {
                    if let Err(e) = apply_request(&mut server, request) {
                        warn!(error = %e, "host request failed");
                    }
                }
                tick = clock.wait_for_frame() => {
                    for _ in 0..tick.frames {
                        server.tick(Instant::now());
                    }
                    clock.record_frame_end();
                }
            }
            flush(&mut server, &mut links, events.as_ref());
        }

        accept.abort();
        server.shutdown(Instant::now());
        flush(&mut server, &mut links, events.as_ref());
        for (_, link) in links.drain() {
            let _ = link.tx.send(Outbound::Close);
            link.reader.abort();
            if tokio::time::timeout(FLUSH_TIMEOUT, link.writer).await.is_err() {
                debug!("writer did not finish flushing");
            }
        }
        info!(frame = server.frame(), "server stopped");
        Ok(server)
    }
}

async fn recv_request(rx: &mut Option<UnboundedReceiver<ServerRequest>>) -> Option<ServerRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn apply_request<S: Simulation>(
    server: &mut GameServer<S>,
    request: ServerRequest,
) -> Result<(), LockstepError> {
    match request {
        ServerRequest::Command(cmd) => server.submit_command(cmd)?,
        ServerRequest::Chat {
            action,
            dest_type,
            dest,
            message,
        } => server.send_chat(action, dest_type, dest, &message)?,
        ServerRequest::ExternalChat {
            source,
            colour,
            user,
            message,
        } => server.send_external_chat(&source, colour, &user, &message)?,
        ServerRequest::RconReply {
            client_id,
            colour,
            output,
        } => {
            if !server.rcon_reply(client_id, colour, &output)? {
                debug!(%client_id, "rcon reply for a departed client");
            }
        }
        ServerRequest::UpdateConfig {
            max_companies,
            max_spectators,
        } => server.update_config(max_companies, max_spectators)?,
    }
    Ok(())
}

async fn accept_loop(mut transport: TcpTransport, tx: UnboundedSender<Inbound>) {
    loop {
        match transport.accept().await {
            Ok(conn) => {
                if tx.send(Inbound::Accepted(conn)).is_err() {
                    break;
                }
            }
            Err(TransportError::Shutdown) => break,
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

fn spawn_link(handle: PeerHandle, conn: TcpConnection, tx: UnboundedSender<Inbound>) -> Link {
    let conn = Arc::new(conn);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    let reader_conn = Arc::clone(&conn);
    let reader = tokio::spawn(async move {
        loop {
            match reader_conn.recv().await {
                Ok(Some(packet)) => {
                    if tx.send(Inbound::Packet(handle, packet)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%handle, error = %e, "receive failed");
                    break;
                }
            }
        }
        let _ = tx.send(Inbound::Lost(handle));
    });

    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Packet(packet) => {
                    if let Err(e) = conn.send(&packet).await {
                        debug!(%handle, error = %e, "send failed");
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = conn.close().await;
    });

    Link {
        tx: out_tx,
        reader,
        writer,
    }
}

/// Hands queued packets to the writers, retires swept connections, and
/// forwards events.
fn flush<S: Simulation>(
    server: &mut GameServer<S>,
    links: &mut HashMap<PeerHandle, Link>,
    events: Option<&UnboundedSender<ServerEvent>>,
) {
    for (handle, packets) in server.drain_outgoing() {
        if let Some(link) = links.get(&handle) {
            for packet in packets {
                let _ = link.tx.send(Outbound::Packet(packet));
            }
        }
    }
    for gone in server.sweep(Instant::now()) {
        let Some(link) = links.remove(&gone.handle) else {
            continue;
        };
        for packet in gone.final_packets {
            let _ = link.tx.send(Outbound::Packet(packet));
        }
        let _ = link.tx.send(Outbound::Close);
        link.reader.abort();
    }
    // Departure notices queued by the sweep go out now, not next cycle.
    for (handle, packets) in server.drain_outgoing() {
        if let Some(link) = links.get(&handle) {
            for packet in packets {
                let _ = link.tx.send(Outbound::Packet(packet));
            }
        }
    }
    let pending = server.drain_events();
    if let Some(tx) = events {
        for event in pending {
            let _ = tx.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Something the player asks the running client to do.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Command(CommandPacket),
    Chat {
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: String,
    },
    Rcon { password: String, command: String },
    Move(CompanyId),
    SetName(String),
    Quit,
}

/// Drives `client` over `conn` until the connection closes, then returns
/// the client so the caller can inspect why.
///
/// Requests that are not allowed yet (a command before the map loaded,
/// say) are logged and dropped.
pub async fn run_client<S: Simulation>(
    mut client: GameClient<S>,
    conn: TcpConnection,
    clock: FrameClockConfig,
    mut requests: UnboundedReceiver<ClientRequest>,
    events: Option<UnboundedSender<ClientEvent>>,
) -> Result<GameClient<S>, LockstepError> {
    let conn = Arc::new(conn);
    let (tx, mut packets) = mpsc::unbounded_channel();
    let reader_conn = Arc::clone(&conn);
    let reader = tokio::spawn(async move {
        while let Ok(Some(packet)) = reader_conn.recv().await {
            if tx.send(packet).is_err() {
                return;
            }
        }
    });

    let mut clock = FrameClock::new(clock);
    let mut requests_open = true;
    client.start()?;

    while !client.is_closed() {
        send_all(&conn, &mut client).await;
        forward(&mut client, events.as_ref());

        tokio::select! {
            packet = packets.recv() => match packet {
                Some(packet) => client.receive(&packet, Instant::now()),
                None => client.connection_lost(Instant::now()),
            },
            request = requests.recv(), if requests_open => match request {
                Some(request) => {
                    if let Err(e) = apply_client_request(&mut client, request) {
                        warn!(error = %e, "request refused");
                    }
                }
                None => requests_open = false,
            },
            tick = clock.wait_for_frame() => {
                for _ in 0..tick.frames {
                    client.tick(Instant::now());
                }
                clock.record_frame_end();
            }
        }
    }

    send_all(&conn, &mut client).await;
    forward(&mut client, events.as_ref());
    reader.abort();
    let _ = conn.close().await;
    info!(reason = ?client.close_reason(), "disconnected");
    Ok(client)
}

fn apply_client_request<S: Simulation>(
    client: &mut GameClient<S>,
    request: ClientRequest,
) -> Result<(), LockstepError> {
    match request {
        ClientRequest::Command(cmd) => client.submit_command(cmd),
        ClientRequest::Chat {
            action,
            dest_type,
            dest,
            message,
        } => client.send_chat(action, dest_type, dest, &message),
        ClientRequest::Rcon { password, command } => client.rcon(&password, &command),
        ClientRequest::Move(company) => client.move_to(company),
        ClientRequest::SetName(name) => client.set_name(&name),
        ClientRequest::Quit => {
            client.quit(Instant::now());
            Ok(())
        }
    }
}

async fn send_all<S: Simulation>(conn: &TcpConnection, client: &mut GameClient<S>) {
    for packet in client.drain_outbound() {
        if let Err(e) = conn.send(&packet).await {
            debug!(error = %e, "send failed");
            client.connection_lost(Instant::now());
            return;
        }
    }
}

fn forward<S: Simulation>(client: &mut GameClient<S>, events: Option<&UnboundedSender<ClientEvent>>) {
    let pending = client.drain_events();
    if let Some(tx) = events {
        for event in pending {
            let _ = tx.send(event);
        }
    }
}
