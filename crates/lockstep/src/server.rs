//! The server node.
//!
//! [`GameServer`] owns every connection, the authoritative simulation,
//! the frame synchronizer and the map transfer queue. It never touches a
//! socket: the I/O driver feeds it packets and clock ticks and carries its
//! outbound packets to the wire.
//!
//! One processing cycle looks like this:
//!
//! ```text
//! accept()  receive() × n  tick()   drain_outgoing()   sweep()
//!    │          │            │            │               │
//!    ▼          ▼            ▼            ▼               ▼
//! registry   handlers     frame loop   driver sends    closed connections
//! insert     (handler.rs)  + timeouts   the packets     removed, notices out
//! ```
//!
//! Handlers only ever *mark* a connection for removal. The registry sweep
//! at the end of the cycle is the single place connections disappear.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lockstep_protocol::{
    ClientId, CommandPacket, CompanyId, DestType, ErrorCode, GameInfo, Message,
    NetworkAction, Role,
};
use lockstep_session::{
    CloseReason, ConnectionRegistry, ConnectionState, PeerConnection, PeerHandle,
    ServerAuthHandshake,
};
use lockstep_sync::{FrameServer, LagStatus, MapTransferQueue, PauseReason, Simulation};
use tracing::{debug, info, warn};

use crate::{LockstepError, ServerConfig};

/// Text colour for ordinary remote console output.
pub const RCON_COLOUR_DEFAULT: u16 = 1;
/// Text colour for remote console errors.
pub const RCON_COLOUR_ERROR: u16 = 3;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something the host application may want to show or act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client loaded the map and now follows the frame loop.
    ClientJoined { client_id: ClientId, name: String },
    /// A welcomed client went away.
    ClientLeft {
        client_id: ClientId,
        name: String,
        reason: CloseReason,
    },
    /// A client stopped echoing tokens for more than half the lag limit.
    ClientLagging { client_id: ClientId, lag_frames: u32 },
    Chat {
        from: ClientId,
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: String,
        data: u64,
    },
    /// An authorized remote console command. Answer with
    /// [`GameServer::rcon_reply`].
    Rcon { client_id: ClientId, command: String },
    NameChanged {
        client_id: ClientId,
        old: String,
        new: String,
    },
    ClientMoved { client_id: ClientId, company: CompanyId },
}

/// A connection removed by [`GameServer::sweep`].
///
/// The driver writes `final_packets` (a clean close flushes everything
/// still queued, an error close only the error notice) and then closes
/// the socket.
#[derive(Debug)]
pub struct Disconnected {
    pub handle: PeerHandle,
    /// [`ClientId::INVALID`] if the connection never got past identify.
    pub client_id: ClientId,
    pub reason: CloseReason,
    pub final_packets: Vec<Bytes>,
}

/// Per-connection state the session layer does not track.
#[derive(Debug, Default)]
pub(crate) struct PeerExtras {
    /// Handshake waiting for the auth response.
    pub(crate) auth: Option<ServerAuthHandshake>,
    /// Hex of the client's public key, known after authentication.
    pub(crate) public_key: String,
    /// When the map transfer actually started (not while queued).
    pub(crate) download_started: Option<Instant>,
    pub(crate) lagging: bool,
}

// ---------------------------------------------------------------------------
// GameServer
// ---------------------------------------------------------------------------

/// Authoritative lockstep server.
pub struct GameServer<S: Simulation> {
    pub(crate) config: ServerConfig,
    pub(crate) sim: S,
    pub(crate) peers: ConnectionRegistry<PeerConnection>,
    pub(crate) extras: HashMap<PeerHandle, PeerExtras>,
    pub(crate) sync: FrameServer,
    pub(crate) transfers: MapTransferQueue<PeerHandle>,
    next_client_id: u32,
    last_wait_notice: Option<Instant>,
    pub(crate) events: VecDeque<ServerEvent>,
}

impl<S: Simulation> GameServer<S> {
    /// A server starting at frame 0 with `sim` as the game state.
    pub fn new(config: ServerConfig, sim: S) -> Self {
        let config = config.validated();
        info!(
            server_name = %config.server_name,
            revision = %config.revision,
            password = config.password.is_some(),
            max_clients = config.max_clients,
            "game server created"
        );
        Self {
            sync: FrameServer::new(config.sync.clone(), 0),
            transfers: MapTransferQueue::new(config.transfer.clone()),
            config,
            sim,
            peers: ConnectionRegistry::new(),
            extras: HashMap::new(),
            next_client_id: ClientId::FIRST_REMOTE.0,
            last_wait_notice: None,
            events: VecDeque::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn frame(&self) -> u32 {
        self.sync.frame()
    }

    pub fn frame_max(&self) -> u32 {
        self.sync.frame_max()
    }

    pub fn sync(&self) -> &FrameServer {
        &self.sync
    }

    pub fn transfers(&self) -> &MapTransferQueue<PeerHandle> {
        &self.transfers
    }

    pub fn peer(&self, handle: PeerHandle) -> Option<&PeerConnection> {
        self.peers.get(handle)
    }

    /// The connection that was assigned `client_id`.
    pub fn find_client(&self, client_id: ClientId) -> Option<PeerHandle> {
        if !client_id.is_valid() {
            return None;
        }
        self.peers.find(|p| p.client_id == client_id && p.state().is_live())
    }

    /// Live connections, in any state.
    pub fn connection_count(&self) -> usize {
        self.peers.iter().filter(|(_, p)| p.state().is_live()).count()
    }

    /// The answer to a game-info query.
    pub fn game_info(&self) -> GameInfo {
        let playing: Vec<&PeerConnection> = self
            .peers
            .iter()
            .map(|(_, p)| p)
            .filter(|p| p.state().is_synchronized())
            .collect();
        let mut companies: Vec<CompanyId> = playing
            .iter()
            .map(|p| p.company)
            .filter(|c| !c.is_spectator())
            .collect();
        companies.sort_by_key(|c| c.0);
        companies.dedup();
        GameInfo {
            server_name: self.config.server_name.clone(),
            revision: self.config.revision.clone(),
            use_password: self.config.password.is_some(),
            clients_on: saturate(playing.len()),
            clients_max: self.config.max_clients,
            companies_on: saturate(companies.len()),
            companies_max: self.config.max_companies,
            spectators_on: saturate(playing.iter().filter(|p| p.company.is_spectator()).count()),
            frame: self.sync.frame(),
        }
    }

    // -----------------------------------------------------------------------
    // Connections in and out
    // -----------------------------------------------------------------------

    /// Registers a freshly accepted socket.
    ///
    /// With `max_clients` connections already admitted, the new one is
    /// closed straight away and its only packet is [`Message::ServerFull`].
    pub fn accept(&mut self, now: Instant) -> PeerHandle {
        let full = self.admitted_count(None) >= usize::from(self.config.max_clients);
        let handle = self.peers.insert(PeerConnection::new(Role::Server, now));
        self.extras.insert(handle, PeerExtras::default());
        if full {
            self.fail(handle, &LockstepError::full(), now);
        } else {
            debug!(%handle, "connection accepted");
        }
        handle
    }

    /// Live connections that got past their first packet, `except` aside.
    pub(crate) fn admitted_count(&self, except: Option<PeerHandle>) -> usize {
        self.peers
            .iter()
            .filter(|(h, p)| {
                Some(*h) != except && p.state().is_live() && p.state() != ConnectionState::Inactive
            })
            .count()
    }

    /// Feeds one complete packet received on `handle`.
    ///
    /// Any failure closes that connection with the matching error notice;
    /// nothing is returned because nothing else is affected.
    pub fn receive(&mut self, handle: PeerHandle, packet: &[u8], now: Instant) {
        let Some(peer) = self.peers.get_mut(handle) else {
            debug!(%handle, "packet for a removed connection");
            return;
        };
        if !peer.state().is_live() {
            return;
        }
        let result = match peer.receive(packet, now) {
            Ok(msg) => self.dispatch(handle, msg, now),
            Err(e) => Err(e.into()),
        };
        if let Err(err) = result {
            self.fail(handle, &err, now);
        }
    }

    /// The socket behind `handle` went away without a goodbye.
    pub fn connection_lost(&mut self, handle: PeerHandle, now: Instant) {
        if let Some(peer) = self.peers.get_mut(handle) {
            peer.close(CloseReason::ConnectionLost, None, now);
        }
    }

    /// Closes `handle` because of `err`, telling the peer why.
    pub(crate) fn fail(&mut self, handle: PeerHandle, err: &LockstepError, now: Instant) {
        let Some(peer) = self.peers.get_mut(handle) else {
            return;
        };
        let reason = err.close_reason();
        warn!(%handle, client_id = %peer.client_id, error = %err, %reason, "dropping connection");
        let notice = match reason {
            CloseReason::ServerFull => Message::ServerFull,
            CloseReason::Banned => Message::ServerBanned,
            _ => Message::ServerError {
                code: err.error_code(),
            },
        };
        peer.close(reason, Some(notice), now);
    }

    /// Removes every connection closed since the last sweep.
    ///
    /// Remaining clients learn who left and why; queued joiners move up
    /// when a transfer slot frees.
    pub fn sweep(&mut self, now: Instant) -> Vec<Disconnected> {
        let removed = self.peers.sweep();
        if removed.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(removed.len());
        for (handle, mut peer) in removed {
            self.extras.remove(&handle);
            self.transfers.cancel(handle);
            let reason = peer.close_reason().unwrap_or(CloseReason::ConnectionLost);
            peer.mark_closed();

            let client_id = peer.client_id;
            if client_id.is_valid() {
                let notice = match reason.error_code() {
                    Some(code) if reason.is_error() => Message::ServerErrorQuit { client_id, code },
                    _ => Message::ServerQuit { client_id },
                };
                if let Err(e) = broadcast(&mut self.peers, &notice, is_joined) {
                    warn!(%client_id, error = %e, "could not announce departure");
                }
                self.events.push_back(ServerEvent::ClientLeft {
                    client_id,
                    name: peer.name.clone(),
                    reason,
                });
            }
            info!(%handle, %client_id, %reason, "connection removed");
            out.push(Disconnected {
                handle,
                client_id,
                reason,
                final_packets: peer.drain_outbound(),
            });
        }

        self.promote_waiters(now);
        out
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    /// Runs one frame: replicate queued commands, execute the frame,
    /// announce it, stream map chunks, then check lag and timeouts.
    /// Returns the new frame number.
    pub fn tick(&mut self, now: Instant) -> u32 {
        let distributed = self.sync.distribute(&mut self.peers, &self.sim);
        for (handle, err) in distributed.failed {
            self.fail(handle, &LockstepError::from(err), now);
        }
        let frame = self.sync.advance(&mut self.sim);
        if let Err(e) = self.sync.announce(&mut self.peers) {
            warn!(frame, error = %e, "frame announcement failed");
        }
        self.pump_transfers(now);
        self.repeat_wait_notices(now);
        self.check_peers(now);
        self.update_pauses();
        frame
    }

    fn pump_transfers(&mut self, now: Instant) {
        let mut failures = Vec::new();
        for (handle, msg) in self.transfers.pump() {
            let Some(peer) = self.peers.get_mut(handle) else {
                continue;
            };
            if let Err(e) = peer.send(&msg) {
                failures.push((handle, LockstepError::from(e)));
            }
        }
        for (handle, err) in failures {
            self.fail(handle, &err, now);
        }
    }

    /// Per-state timeouts and the lag check.
    fn check_peers(&mut self, now: Instant) {
        let timeouts = &self.config.timeouts;
        let expired = |limit: Option<Duration>, since: Instant| {
            limit.is_some_and(|limit| now.saturating_duration_since(since) > limit)
        };

        let mut failures = Vec::new();
        let mut lag = Vec::new();
        for (handle, peer) in self.peers.iter() {
            let timed_out = match peer.state() {
                ConnectionState::Inactive | ConnectionState::Authenticating => {
                    expired(timeouts.auth(), peer.state_since())
                        .then_some(ErrorCode::TimeoutPassword)
                }
                ConnectionState::Identifying
                | ConnectionState::ContentChecking
                | ConnectionState::Welcoming => {
                    expired(timeouts.join(), peer.state_since()).then_some(ErrorCode::TimeoutJoin)
                }
                ConnectionState::MapTransfer => self
                    .extras
                    .get(&handle)
                    .and_then(|e| e.download_started)
                    .is_some_and(|started| expired(timeouts.download(), started))
                    .then_some(ErrorCode::TimeoutMap),
                ConnectionState::Synchronized => {
                    expired(timeouts.idle(), peer.last_packet).then_some(ErrorCode::TimeoutComputer)
                }
                _ => None,
            };
            if let Some(code) = timed_out {
                failures.push((handle, LockstepError::timed_out(code)));
                continue;
            }
            if peer.state().is_synchronized() {
                match self.sync.check_lag(peer) {
                    Ok(LagStatus::Healthy) => lag.push((handle, peer.client_id, None)),
                    Ok(LagStatus::Lagging { lag_frames }) => {
                        lag.push((handle, peer.client_id, Some(lag_frames)));
                    }
                    Err(e) => failures.push((handle, e.into())),
                }
            }
        }

        for (handle, client_id, lagging) in lag {
            let Some(extras) = self.extras.get_mut(&handle) else {
                continue;
            };
            match lagging {
                Some(lag_frames) if !extras.lagging => {
                    extras.lagging = true;
                    warn!(%client_id, lag_frames, "client is lagging");
                    self.events
                        .push_back(ServerEvent::ClientLagging { client_id, lag_frames });
                }
                None if extras.lagging => {
                    extras.lagging = false;
                    info!(%client_id, "client caught up");
                }
                _ => {}
            }
        }
        for (handle, err) in failures {
            self.fail(handle, &err, now);
        }
    }

    fn update_pauses(&mut self) {
        if self.config.sync.pause_on_join {
            let joining = self
                .peers
                .iter()
                .any(|(_, p)| p.state() == ConnectionState::MapTransfer);
            self.sync.pause_for(PauseReason::Joining, joining, &self.sim);
        }
        if self.config.sync.pause_on_lag {
            let lagging = self.extras.values().any(|e| e.lagging);
            self.sync.pause_for(PauseReason::LaggingClient, lagging, &self.sim);
        }
    }

    // -----------------------------------------------------------------------
    // Map transfers
    // -----------------------------------------------------------------------

    /// Queues the begin and size packets for `handle` and fixes its
    /// snapshot frame.
    pub(crate) fn begin_download(
        &mut self,
        handle: PeerHandle,
        packets: Vec<Message>,
        now: Instant,
    ) -> Result<(), LockstepError> {
        let peer = self
            .peers
            .get_mut(handle)
            .ok_or(LockstepError::UnknownPeer(handle))?;
        for msg in &packets {
            peer.send(msg)?;
        }
        self.sync.start_transfer(peer)?;
        if let Some(extras) = self.extras.get_mut(&handle) {
            extras.download_started = Some(now);
        }
        Ok(())
    }

    /// Starts queued transfers into free slots and tells everyone still
    /// waiting their new position.
    pub(crate) fn promote_waiters(&mut self, now: Instant) {
        let started = self.transfers.promote(self.sync.frame(), &self.sim);
        for (handle, result) in started {
            let outcome = match result {
                Ok(packets) => self.begin_download(handle, packets, now),
                Err(e) => Err(e.into()),
            };
            if let Err(err) = outcome {
                self.fail(handle, &err, now);
            }
        }
        self.send_wait_notices(now);
    }

    /// Resends queue positions once `wait_notice_secs` passed, so a
    /// waiting client keeps hearing from the server.
    fn repeat_wait_notices(&mut self, now: Instant) {
        let Some(interval) = self.config.timeouts.wait_notice() else {
            return;
        };
        if self.transfers.waiting_len() == 0 {
            return;
        }
        let due = self
            .last_wait_notice
            .is_none_or(|at| now.saturating_duration_since(at) >= interval);
        if due {
            self.send_wait_notices(now);
        }
    }

    fn send_wait_notices(&mut self, now: Instant) {
        self.last_wait_notice = Some(now);
        for (handle, msg) in self.transfers.wait_notices() {
            if let Some(peer) = self.peers.get_mut(handle) {
                if let Err(e) = peer.send(&msg) {
                    warn!(%handle, error = %e, "could not send queue position");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Host API
    // -----------------------------------------------------------------------

    /// Queues a command issued by the host itself.
    ///
    /// # Errors
    /// A command whose data does not fit one packet is refused.
    pub fn submit_command(&mut self, cmd: CommandPacket) -> Result<(), LockstepError> {
        self.sync.submit(cmd)?;
        Ok(())
    }

    /// Sends a chat line from the host.
    pub fn send_chat(
        &mut self,
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: &str,
    ) -> Result<(), LockstepError> {
        self.relay_chat(ClientId::SERVER, action, dest_type, dest, message.to_string(), 0)
    }

    /// Relays a chat line from an outside bridge (IRC, Discord, ...) to
    /// every joined client.
    pub fn send_external_chat(
        &mut self,
        source: &str,
        colour: u16,
        user: &str,
        message: &str,
    ) -> Result<(), LockstepError> {
        let msg = Message::ServerExternalChat {
            source: source.to_string(),
            colour,
            user: user.to_string(),
            message: message.to_string(),
        };
        broadcast(&mut self.peers, &msg, is_joined)
    }

    /// Answers an rcon request, one packet per output line. Returns
    /// `false` if the client is gone.
    pub fn rcon_reply(
        &mut self,
        client_id: ClientId,
        colour: u16,
        output: &str,
    ) -> Result<bool, LockstepError> {
        let Some(handle) = self.find_client(client_id) else {
            return Ok(false);
        };
        let peer = self
            .peers
            .get_mut(handle)
            .ok_or(LockstepError::UnknownPeer(handle))?;
        for line in output.lines() {
            peer.send(&Message::ServerRcon {
                colour,
                output: line.to_string(),
            })?;
        }
        Ok(true)
    }

    /// Changes the company limits and tells every joined client.
    pub fn update_config(&mut self, max_companies: u8, max_spectators: u8) -> Result<(), LockstepError> {
        self.config.max_companies = max_companies;
        self.config.max_spectators = max_spectators;
        info!(max_companies, max_spectators, "configuration updated");
        broadcast(
            &mut self.peers,
            &Message::ServerConfigUpdate {
                max_companies,
                max_spectators,
            },
            is_joined,
        )
    }

    /// Tells every client the server is going away and closes all
    /// connections cleanly. The next [`sweep`](Self::sweep) removes them.
    pub fn shutdown(&mut self, now: Instant) {
        info!(frame = self.sync.frame(), "server shutting down");
        self.close_all(Message::ServerShutdown, now);
    }

    /// Replaces the game with `sim` at frame 0. Connected clients are told
    /// and disconnected; they may rejoin the new game.
    pub fn new_game(&mut self, sim: S, now: Instant) {
        info!(frame = self.sync.frame(), "starting a new game");
        self.close_all(Message::ServerNewGame, now);
        for (handle, _) in self.peers.iter() {
            self.transfers.cancel(handle);
        }
        self.sim = sim;
        self.sync = FrameServer::new(self.config.sync.clone(), 0);
    }

    fn close_all(&mut self, notice: Message, now: Instant) {
        for (_, peer) in self.peers.iter_mut() {
            if !peer.state().is_live() {
                continue;
            }
            if let Err(e) = peer.send(&notice) {
                warn!(client_id = %peer.client_id, error = %e, "could not queue notice");
            }
            peer.close(CloseReason::Shutdown, None, now);
        }
    }

    /// Takes every packet queued for sending, per connection.
    pub fn drain_outgoing(&mut self) -> Vec<(PeerHandle, Vec<Bytes>)> {
        self.peers
            .iter_mut()
            .filter(|(_, p)| p.outbound_len() > 0)
            .map(|(h, p)| (h, p.drain_outbound()))
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        self.events.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Helpers shared with the handlers
    // -----------------------------------------------------------------------

    /// Next free client id. Ids only grow; 0 and 1 are never handed out
    /// and an id still in use after wrap-around is skipped.
    pub(crate) fn allocate_client_id(&mut self) -> ClientId {
        loop {
            let candidate = ClientId(self.next_client_id);
            self.next_client_id = self
                .next_client_id
                .checked_add(1)
                .unwrap_or(ClientId::FIRST_REMOTE.0);
            if self.find_client(candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Whether another connection already uses `name`.
    pub(crate) fn name_in_use(&self, name: &str, except: PeerHandle) -> bool {
        self.peers.iter().any(|(h, p)| {
            h != except && p.client_id.is_valid() && p.state().is_live() && p.name == name
        })
    }

    /// `name`, or `name #2`, `name #3`, ... whichever is free first.
    pub(crate) fn unique_name(&self, name: &str, except: PeerHandle) -> String {
        if !self.name_in_use(name, except) {
            return name.to_string();
        }
        let mut n = 2u32;
        loop {
            let suffix = format!(" #{n}");
            let mut base = name.to_string();
            let limit = lockstep_protocol::MAX_CLIENT_NAME_LEN.saturating_sub(suffix.len());
            while base.len() > limit {
                base.pop();
            }
            let candidate = base + &suffix;
            if !self.name_in_use(&candidate, except) {
                return candidate;
            }
            n += 1;
        }
    }

    /// The client-info packet describing `handle`.
    pub(crate) fn client_info(&self, handle: PeerHandle) -> Option<Message> {
        let peer = self.peers.get(handle)?;
        Some(Message::ServerClientInfo {
            client_id: peer.client_id,
            company: peer.company,
            name: peer.name.clone(),
            public_key: self
                .extras
                .get(&handle)
                .map(|e| e.public_key.clone())
                .unwrap_or_default(),
        })
    }
}

/// Welcomed and not closing: the connection receives notices about other
/// clients, chat and configuration changes.
pub(crate) fn is_joined(peer: &PeerConnection) -> bool {
    matches!(
        peer.state(),
        ConnectionState::Welcoming | ConnectionState::MapTransfer | ConnectionState::Synchronized
    )
}

/// Sends `msg` to every connection `filter` selects.
pub(crate) fn broadcast(
    peers: &mut ConnectionRegistry<PeerConnection>,
    msg: &Message,
    filter: impl Fn(&PeerConnection) -> bool,
) -> Result<(), LockstepError> {
    for (_, peer) in peers.iter_mut() {
        if filter(peer) {
            peer.send(msg)?;
        }
    }
    Ok(())
}

/// Lower-case hex, as public keys appear in ban lists and client info.
pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn saturate(n: usize) -> u8 {
    u8::try_from(n).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::SyncSeeds;

    use super::*;

    #[derive(Default)]
    struct Idle;

    impl Simulation for Idle {
        fn execute(&mut self, _frame: u32, _cmd: &CommandPacket) {}
        fn advance(&mut self, _frame: u32) {}
        fn sync_seeds(&self) -> SyncSeeds {
            SyncSeeds::default()
        }
        fn snapshot(&self) -> Result<Bytes, String> {
            Ok(Bytes::from_static(b"map"))
        }
        fn load_snapshot(&mut self, _data: &[u8]) -> Result<(), String> {
            Ok(())
        }
    }

    fn server() -> GameServer<Idle> {
        GameServer::new(ServerConfig::default(), Idle)
    }

    #[test]
    fn test_hex_formats_lowercase_pairs() {
        assert_eq!(hex(&[0x00, 0xab, 0x0f]), "00ab0f");
    }

    #[test]
    fn test_allocate_client_id_starts_at_first_remote() {
        let mut server = server();
        assert_eq!(server.allocate_client_id(), ClientId(2));
        assert_eq!(server.allocate_client_id(), ClientId(3));
    }

    #[test]
    fn test_allocate_client_id_wraps_past_reserved_ids() {
        let mut server = server();
        server.next_client_id = u32::MAX;
        assert_eq!(server.allocate_client_id(), ClientId(u32::MAX));
        assert_eq!(server.allocate_client_id(), ClientId::FIRST_REMOTE);
    }

    #[test]
    fn test_unique_name_appends_counter() {
        let mut server = server();
        let now = Instant::now();
        let first = server.accept(now);
        let second = server.accept(now);
        let peer = server.peers.get_mut(first).unwrap();
        peer.client_id = ClientId(2);
        peer.name = "alice".to_string();

        assert!(server.name_in_use("alice", second));
        assert!(!server.name_in_use("alice", first));
        assert_eq!(server.unique_name("alice", second), "alice #2");
        assert_eq!(server.unique_name("bob", second), "bob");
    }

    #[test]
    fn test_game_info_counts_only_synchronized_peers() {
        let mut server = server();
        let now = Instant::now();
        let handle = server.accept(now);
        server.accept(now);
        let peer = server.peers.get_mut(handle).unwrap();
        while peer.state() != ConnectionState::Synchronized {
            peer.advance(now).unwrap();
        }
        peer.company = CompanyId(0);

        let info = server.game_info();
        assert_eq!(info.clients_on, 1);
        assert_eq!(info.companies_on, 1);
        assert_eq!(info.spectators_on, 0);
        assert_eq!(info.clients_max, ServerConfig::default().max_clients);
    }

    #[test]
    fn test_auth_timeout_drops_silent_connection() {
        let mut server = server();
        let start = Instant::now();
        let handle = server.accept(start);
        server.tick(start + Duration::from_secs(61));

        assert_eq!(
            server.peer(handle).unwrap().close_reason(),
            Some(CloseReason::Timeout)
        );
        let gone = server.sweep(start + Duration::from_secs(61));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].client_id, ClientId::INVALID);
        assert_eq!(gone[0].final_packets.len(), 1);
        assert!(server.peer(handle).is_none());
    }

    #[test]
    fn test_shutdown_closes_cleanly_with_notice() {
        let mut server = server();
        let now = Instant::now();
        let handle = server.accept(now);
        server.shutdown(now);

        let gone = server.sweep(now);
        assert_eq!(gone[0].handle, handle);
        assert_eq!(gone[0].reason, CloseReason::Shutdown);
        assert_eq!(gone[0].final_packets.len(), 1);
    }
}
