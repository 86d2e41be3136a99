//! The client node.
//!
//! [`GameClient`] walks one connection through the join handshake, loads
//! the map, and then follows the server's frame loop with its own copy of
//! the simulation. Like the server it is sans-IO: feed it packets with
//! [`receive`](GameClient::receive), call [`tick`](GameClient::tick) once
//! per frame, and ship whatever [`drain_outbound`](GameClient::drain_outbound)
//! returns.
//!
//! Frames, syncs and commands that arrive while the map is still
//! downloading are held back and replayed as soon as the snapshot loads,
//! so nothing stamped after the snapshot frame is lost.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use lockstep_protocol::{
    ClientId, CommandPacket, CompanyId, DestType, ErrorCode, GameInfo, Message, NetworkAction,
    Role,
};
use lockstep_session::{
    ClientAuthHandshake, CloseReason, ConnectionState, PacketCipher, PeerConnection, SessionKeys,
};
use lockstep_sync::{FrameClient, MapReceiver, Simulation, SyncError};
use tracing::{debug, info, warn};

use crate::{ClientConfig, LockstepError};

/// Most in-game packets held back while the map downloads.
const MAX_BUFFERED: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the server told us, for whoever draws the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    GameInfo(GameInfo),
    Welcomed { client_id: ClientId },
    /// Waiting for a free map transfer slot.
    Waiting { position: u8 },
    MapProgress { received: usize, total: u32 },
    /// The map is loaded and the client follows the frame loop.
    Synchronized { frame: u32 },
    ClientInfo {
        client_id: ClientId,
        company: CompanyId,
        name: String,
    },
    ClientJoined { client_id: ClientId },
    ClientLeft {
        client_id: ClientId,
        error: Option<ErrorCode>,
    },
    ClientMoved { client_id: ClientId, company: CompanyId },
    Chat {
        action: NetworkAction,
        client_id: ClientId,
        self_send: bool,
        message: String,
        data: u64,
    },
    ExternalChat {
        source: String,
        colour: u16,
        user: String,
        message: String,
    },
    RconOutput { colour: u16, output: String },
    ConfigUpdated { max_companies: u8, max_spectators: u8 },
    /// The server is replacing the game; reconnect to join the new one.
    NewGame,
    Closed {
        reason: CloseReason,
        code: Option<ErrorCode>,
    },
}

/// What the client knows about another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub company: CompanyId,
    pub name: String,
    pub public_key: String,
}

// ---------------------------------------------------------------------------
// GameClient
// ---------------------------------------------------------------------------

/// One client's connection and simulation.
pub struct GameClient<S: Simulation> {
    config: ClientConfig,
    peer: PeerConnection,
    sim: S,
    auth: ClientAuthHandshake,
    keys: Option<SessionKeys>,
    map: Option<MapReceiver>,
    sync: Option<FrameClient>,
    /// In-game packets that arrived before the map was loaded.
    held: Vec<Message>,
    clients: HashMap<ClientId, ClientInfo>,
    events: VecDeque<ClientEvent>,
}

impl<S: Simulation> GameClient<S> {
    /// A client that has not said anything yet. `sim` is replaced by the
    /// server's snapshot during the join.
    pub fn new(config: ClientConfig, sim: S, now: Instant) -> Self {
        let config = config.validated();
        Self {
            auth: ClientAuthHandshake::new(config.password.as_deref()),
            config,
            peer: PeerConnection::new(Role::Client, now),
            sim,
            keys: None,
            map: None,
            sync: None,
            held: Vec::new(),
            clients: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.peer.state()
    }

    pub fn client_id(&self) -> ClientId {
        self.peer.client_id
    }

    pub fn company(&self) -> CompanyId {
        self.peer.company
    }

    /// Last executed frame, once synchronized.
    pub fn frame(&self) -> Option<u32> {
        self.sync.as_ref().map(FrameClient::frame)
    }

    pub fn frame_sync(&self) -> Option<&FrameClient> {
        self.sync.as_ref()
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn clients(&self) -> &HashMap<ClientId, ClientInfo> {
        &self.clients
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.peer.close_reason()
    }

    pub fn is_closed(&self) -> bool {
        !self.peer.state().is_live()
    }

    // -----------------------------------------------------------------------
    // Starting
    // -----------------------------------------------------------------------

    /// Sends the join request.
    pub fn start(&mut self) -> Result<(), LockstepError> {
        info!(name = %self.config.name, revision = %self.config.revision, "joining server");
        self.peer.send(&Message::ClientJoin {
            revision: self.config.revision.clone(),
            company: self.config.company,
        })?;
        Ok(())
    }

    /// Asks for the server's game info instead of joining.
    pub fn query_game_info(&mut self) -> Result<(), LockstepError> {
        self.peer.send(&Message::ClientGameInfo)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Feeds one complete packet from the server.
    pub fn receive(&mut self, packet: &[u8], now: Instant) {
        if !self.peer.state().is_live() {
            return;
        }
        let result = match self.peer.receive(packet, now) {
            Ok(msg) => self.dispatch(msg, now),
            Err(e) => Err(e.into()),
        };
        if let Err(err) = result {
            self.fail(&err, now);
        }
    }

    /// The socket closed underneath us.
    pub fn connection_lost(&mut self, now: Instant) {
        self.close(CloseReason::ConnectionLost, None, None, now);
    }

    fn dispatch(&mut self, msg: Message, now: Instant) -> Result<(), LockstepError> {
        use Message as M;
        match msg {
            M::ServerGameInfo(info) => {
                self.events.push_back(ClientEvent::GameInfo(info));
                self.close(CloseReason::QueryAnswered, None, None, now);
            }
            M::ServerFull => self.close(CloseReason::ServerFull, Some(ErrorCode::Full), None, now),
            M::ServerBanned => self.close(CloseReason::Banned, None, None, now),
            M::ServerError { code } => {
                warn!(%code, "server reported an error");
                let reason = LockstepError::Remote(code).close_reason();
                self.close(reason, Some(code), None, now);
            }
            M::ServerShutdown => {
                info!("server shut down");
                self.close(CloseReason::Shutdown, None, None, now);
            }
            M::ServerNewGame => {
                self.events.push_back(ClientEvent::NewGame);
                self.close(CloseReason::Shutdown, None, None, now);
            }

            M::ServerAuthRequest {
                method,
                public_key,
                nonce,
            } => {
                let (response, keys) = self.auth.respond(method, &public_key, &nonce)?;
                self.peer.send(&response)?;
                self.keys = Some(keys);
                self.peer.advance(now)?;
            }
            M::ServerEnableEncryption { nonce } => {
                let keys = self
                    .keys
                    .take()
                    .ok_or(LockstepError::refused(ErrorCode::NotExpected))?;
                self.peer
                    .enable_encryption(PacketCipher::new(&keys, nonce, Role::Client));
                self.peer.advance(now)?;
                self.peer.send(&Message::ClientIdentify {
                    name: self.config.name.clone(),
                    company: self.config.company,
                })?;
            }
            M::ServerCheckContent { content } => {
                self.peer.advance(now)?;
                let missing = content
                    .iter()
                    .filter(|c| !self.sim.has_content(c))
                    .count();
                if missing > 0 {
                    warn!(missing, "server requires content this client lacks");
                    return Err(LockstepError::refused(ErrorCode::ContentMismatch));
                }
                self.peer.send(&Message::ClientContentChecked)?;
                self.peer.advance(now)?;
            }
            M::ServerWelcome { client_id } => {
                self.peer.client_id = client_id;
                self.peer.company = self.config.company;
                self.peer.advance(now)?;
                self.peer.send(&Message::ClientGetMap)?;
                self.map = Some(MapReceiver::new(self.config.max_map_size));
                info!(%client_id, "welcomed, requesting map");
                self.events.push_back(ClientEvent::Welcomed { client_id });
            }

            M::ServerWait { waiting } => {
                debug!(position = waiting, "waiting for a map transfer slot");
                self.events
                    .push_back(ClientEvent::Waiting { position: waiting });
            }
            M::ServerMapBegin { frame } => self.receiver()?.on_begin(frame)?,
            M::ServerMapSize { bytes } => {
                self.receiver()?.on_size(bytes)?;
                self.report_progress();
            }
            M::ServerMapData { chunk } => {
                self.receiver()?.on_data(&chunk)?;
                self.report_progress();
            }
            M::ServerMapDone => self.load_map(now)?,

            M::ServerFrame { .. } | M::ServerSync { .. } | M::ServerCommand(_) => {
                if self.sync.is_some() {
                    self.on_frame_message(msg)?;
                } else {
                    if self.held.len() >= MAX_BUFFERED {
                        warn!(held = self.held.len(), "too many packets during map download");
                        return Err(LockstepError::refused(ErrorCode::TooManyCommands));
                    }
                    self.held.push(msg);
                }
            }

            M::ServerClientInfo {
                client_id,
                company,
                name,
                public_key,
            } => {
                if client_id == self.peer.client_id {
                    self.peer.name.clone_from(&name);
                    self.peer.company = company;
                }
                self.clients.insert(
                    client_id,
                    ClientInfo {
                        company,
                        name: name.clone(),
                        public_key,
                    },
                );
                self.events.push_back(ClientEvent::ClientInfo {
                    client_id,
                    company,
                    name,
                });
            }
            M::ServerJoin { client_id } => {
                self.events.push_back(ClientEvent::ClientJoined { client_id });
            }
            M::ServerQuit { client_id } => {
                self.clients.remove(&client_id);
                self.events.push_back(ClientEvent::ClientLeft {
                    client_id,
                    error: None,
                });
            }
            M::ServerErrorQuit { client_id, code } => {
                self.clients.remove(&client_id);
                self.events.push_back(ClientEvent::ClientLeft {
                    client_id,
                    error: Some(code),
                });
            }
            M::ServerMove { client_id, company } => {
                if client_id == self.peer.client_id {
                    self.peer.company = company;
                }
                if let Some(info) = self.clients.get_mut(&client_id) {
                    info.company = company;
                }
                self.events
                    .push_back(ClientEvent::ClientMoved { client_id, company });
            }
            M::ServerChat {
                action,
                client_id,
                self_send,
                message,
                data,
            } => self.events.push_back(ClientEvent::Chat {
                action,
                client_id,
                self_send,
                message,
                data,
            }),
            M::ServerExternalChat {
                source,
                colour,
                user,
                message,
            } => self.events.push_back(ClientEvent::ExternalChat {
                source,
                colour,
                user,
                message,
            }),
            M::ServerRcon { colour, output } => {
                self.events
                    .push_back(ClientEvent::RconOutput { colour, output });
            }
            M::ServerConfigUpdate {
                max_companies,
                max_spectators,
            } => self.events.push_back(ClientEvent::ConfigUpdated {
                max_companies,
                max_spectators,
            }),

            other => {
                debug!(kind = %other.kind(), "client-bound packet with no handler");
                return Err(LockstepError::refused(ErrorCode::IllegalPacket));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Map
    // -----------------------------------------------------------------------

    fn receiver(&mut self) -> Result<&mut MapReceiver, LockstepError> {
        self.map
            .as_mut()
            .ok_or(SyncError::UnexpectedMapPacket("map packet before welcome").into())
    }

    fn report_progress(&mut self) {
        if let Some((received, Some(total))) = self.map.as_ref().map(MapReceiver::progress) {
            self.events
                .push_back(ClientEvent::MapProgress { received, total });
        }
    }

    /// Loads the finished snapshot, replays what was held back, and
    /// confirms the load.
    fn load_map(&mut self, now: Instant) -> Result<(), LockstepError> {
        let mut map = self
            .map
            .take()
            .ok_or(SyncError::UnexpectedMapPacket("map-done before welcome"))?;
        map.on_done()?;
        let (frame, data) = map.finish()?;
        self.sim
            .load_snapshot(&data)
            .map_err(SyncError::Snapshot)?;
        info!(frame, bytes = data.len(), "map loaded");

        self.sync = Some(FrameClient::new(frame, self.config.ack_interval));
        self.peer.last_frame = frame;
        for msg in std::mem::take(&mut self.held) {
            self.on_frame_message(msg)?;
        }
        self.peer.send(&Message::ClientMapOk)?;
        self.peer.advance(now)?;
        self.events.push_back(ClientEvent::Synchronized { frame });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    fn on_frame_message(&mut self, msg: Message) -> Result<(), LockstepError> {
        let sync = self.sync.as_mut().ok_or(LockstepError::NotSynchronized)?;
        match msg {
            Message::ServerCommand(cmd) => sync.on_command(cmd)?,
            Message::ServerSync { frame, seeds } => sync.on_sync(frame, seeds)?,
            Message::ServerFrame {
                frame,
                frame_max,
                seeds,
                token,
            } => {
                if let Some(ack) = sync.on_frame(frame, frame_max, seeds, token)? {
                    self.peer.send(&ack)?;
                }
            }
            other => debug!(kind = %other.kind(), "not a frame packet"),
        }
        Ok(())
    }

    /// Runs one frame, plus extra ones while behind the server, and checks
    /// the silence timeout.
    pub fn tick(&mut self, now: Instant) {
        if !self.peer.state().is_live() {
            return;
        }
        if let Some(limit) = self.config.timeout() {
            if now.saturating_duration_since(self.peer.last_packet) > limit {
                warn!(silent_secs = limit.as_secs(), "server went silent");
                self.fail(&LockstepError::timed_out(ErrorCode::ConnectionLost), now);
                return;
            }
        }
        if self.peer.state().is_synchronized() {
            if let Err(err) = self.run_frames() {
                self.fail(&err, now);
            }
        }
    }

    fn run_frames(&mut self) -> Result<(), LockstepError> {
        let Some(sync) = self.sync.as_mut() else {
            return Ok(());
        };
        let mut acks = Vec::new();
        acks.extend(sync.advance(&mut self.sim)?);
        while sync.frame() < sync.frame_server() && sync.can_advance() {
            acks.extend(sync.advance(&mut self.sim)?);
        }
        self.peer.last_frame = sync.frame();
        for ack in acks {
            self.peer.send(&ack)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    fn require_synchronized(&self) -> Result<(), LockstepError> {
        if self.peer.state().is_synchronized() {
            Ok(())
        } else {
            Err(LockstepError::NotSynchronized)
        }
    }

    /// Sends a command to the server, which replicates it to everyone.
    pub fn submit_command(&mut self, mut cmd: CommandPacket) -> Result<(), LockstepError> {
        self.require_synchronized()?;
        cmd.company = self.peer.company;
        self.peer.send(&Message::ClientCommand(cmd))?;
        Ok(())
    }

    pub fn send_chat(
        &mut self,
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: &str,
    ) -> Result<(), LockstepError> {
        self.require_synchronized()?;
        self.peer.send(&Message::ClientChat {
            action,
            dest_type,
            dest,
            message: message.to_string(),
            data: 0,
        })?;
        Ok(())
    }

    pub fn rcon(&mut self, password: &str, command: &str) -> Result<(), LockstepError> {
        self.require_synchronized()?;
        self.peer.send(&Message::ClientRcon {
            password: password.to_string(),
            command: command.to_string(),
        })?;
        Ok(())
    }

    pub fn move_to(&mut self, company: CompanyId) -> Result<(), LockstepError> {
        self.require_synchronized()?;
        self.peer.send(&Message::ClientMove { company })?;
        Ok(())
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), LockstepError> {
        self.require_synchronized()?;
        self.peer.send(&Message::ClientSetName {
            name: name.to_string(),
        })?;
        Ok(())
    }

    /// Says goodbye. Queued packets are still flushed.
    pub fn quit(&mut self, now: Instant) {
        self.close(CloseReason::Shutdown, None, Some(Message::ClientQuit), now);
    }

    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        self.peer.drain_outbound()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Closes because of a local failure, telling the server the code.
    fn fail(&mut self, err: &LockstepError, now: Instant) {
        let code = err.error_code();
        warn!(error = %err, %code, "leaving the game");
        self.close(
            err.close_reason(),
            Some(code),
            Some(Message::ClientError { code }),
            now,
        );
    }

    fn close(
        &mut self,
        reason: CloseReason,
        code: Option<ErrorCode>,
        final_packet: Option<Message>,
        now: Instant,
    ) {
        if !self.peer.state().is_live() {
            return;
        }
        self.peer.close(reason, final_packet, now);
        self.events.push_back(ClientEvent::Closed { reason, code });
    }
}

impl<S: Simulation + std::fmt::Debug> std::fmt::Debug for GameClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameClient")
            .field("state", &self.peer.state())
            .field("client_id", &self.peer.client_id)
            .field("frame", &self.frame())
            .field("sim", &self.sim)
            .finish_non_exhaustive()
    }
}
