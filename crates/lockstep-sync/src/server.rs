//! The server half of the frame synchronizer.
//!
//! The server owns the one true frame counter. Each tick it runs three
//! steps in a fixed order:
//!
//! ```text
//! distribute()  take queued commands, stamp them frame + command_delay,
//!               schedule locally and broadcast
//! advance()     frame += 1, execute what is due, step the simulation
//! announce()    tell every client how far it may run (and the checksum)
//! ```
//!
//! Between ticks, client acks come in through [`FrameServer::handle_ack`],
//! and [`FrameServer::check_lag`] decides who is too far behind.
//!
//! The server never touches sockets. It works on the connection registry
//! it is handed and queues packets on each [`PeerConnection`].

use lockstep_protocol::{
    ClientId, CommandPacket, CommandQueue, MAX_COMMAND_DATA_LEN, Message, SyncSeeds,
};
use lockstep_session::{ConnectionRegistry, ConnectionState, PeerConnection, PeerHandle};
use rand::Rng;

use crate::{FrameSchedule, PauseReason, Simulation, SyncConfig, SyncError};

/// How far a client is behind on its acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagStatus {
    Healthy,
    /// Past half the allowed lag.
    Lagging { lag_frames: u32 },
}

/// What one [`FrameServer::distribute`] call did.
#[derive(Debug, Default)]
pub struct Distribution {
    /// Commands stamped and scheduled.
    pub count: usize,
    /// Connections a command could not be queued on. They missed part of
    /// the command stream and must be dropped; everyone else got it.
    pub failed: Vec<(PeerHandle, SyncError)>,
}

/// Authoritative frame counter, command replication, and ack bookkeeping.
#[derive(Debug)]
pub struct FrameServer {
    config: SyncConfig,
    frame: u32,
    /// Highest `frame_max` sent to clients so far.
    announced_max: u32,
    local_queue: CommandQueue,
    schedule: FrameSchedule,
    /// Last recorded checksum and the frame it belongs to.
    seeds: Option<(u32, SyncSeeds)>,
    paused_for: Vec<PauseReason>,
}

impl FrameServer {
    /// A synchronizer whose simulation has executed `frame`.
    pub fn new(config: SyncConfig, frame: u32) -> Self {
        Self {
            config: config.validated(),
            frame,
            announced_max: frame,
            local_queue: CommandQueue::new(),
            schedule: FrameSchedule::new(),
            seeds: None,
            paused_for: Vec::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The last executed frame.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// The highest frame clients may execute right now.
    pub fn frame_max(&self) -> u32 {
        self.frame + self.config.frame_freq
    }

    pub fn last_seeds(&self) -> Option<(u32, SyncSeeds)> {
        self.seeds
    }

    /// Commands stamped but not yet executed.
    pub fn scheduled(&self) -> usize {
        self.schedule.len()
    }

    /// Whether the server currently holds a pause for `reason`.
    pub fn is_paused_for(&self, reason: PauseReason) -> bool {
        self.paused_for.contains(&reason)
    }

    // -----------------------------------------------------------------------
    // Queueing
    // -----------------------------------------------------------------------

    /// Queues a command issued by the server's own participant.
    ///
    /// # Errors
    /// [`SyncError::CommandTooLarge`] if the data would not fit a command
    /// packet.
    pub fn submit(&mut self, mut cmd: CommandPacket) -> Result<(), SyncError> {
        check_size(&cmd)?;
        cmd.client_id = ClientId::SERVER;
        cmd.frame = 0;
        self.local_queue.push(cmd);
        Ok(())
    }

    /// Checks and queues a command received from `peer`.
    ///
    /// The originator is always taken from the connection, whatever the
    /// packet claimed.
    ///
    /// # Errors
    /// - [`SyncError::CommandRejected`] if the simulation refuses it
    /// - [`SyncError::TooManyCommands`] if the peer's queue is full
    /// - [`SyncError::CommandTooLarge`] if the data would not fit a packet
    pub fn queue_command<S: Simulation>(
        &self,
        peer: &mut PeerConnection,
        mut cmd: CommandPacket,
        sim: &S,
    ) -> Result<(), SyncError> {
        check_size(&cmd)?;
        cmd.client_id = peer.client_id;
        cmd.frame = 0;
        cmd.my_cmd = false;
        sim.validate_command(peer.client_id, &cmd)
            .map_err(SyncError::CommandRejected)?;
        if peer.incoming_queue.len() >= self.config.max_commands_in_queue {
            return Err(SyncError::TooManyCommands {
                queued: peer.incoming_queue.len() + 1,
            });
        }
        peer.incoming_queue.push(cmd);
        Ok(())
    }

    /// Holds or releases a pause for `reason`.
    ///
    /// The pause itself is the simulation's own command, queued like any
    /// other so every peer pauses at the same frame. Returns `true` if a
    /// command was queued.
    pub fn pause_for<S: Simulation>(&mut self, reason: PauseReason, paused: bool, sim: &S) -> bool {
        let held = self.paused_for.contains(&reason);
        if held == paused {
            return false;
        }
        let Some(cmd) = sim.pause_command(reason, paused) else {
            return false;
        };
        if let Err(e) = self.submit(cmd) {
            tracing::warn!(?reason, error = %e, "pause command refused");
            return false;
        }
        if paused {
            self.paused_for.push(reason);
        } else {
            self.paused_for.retain(|r| *r != reason);
        }
        tracing::info!(?reason, paused, frame = self.frame, "queueing pause command");
        true
    }

    // -----------------------------------------------------------------------
    // Tick steps
    // -----------------------------------------------------------------------

    /// Takes queued commands, stamps them, schedules them locally, and
    /// broadcasts them.
    ///
    /// The server's own queue goes first, then every synchronized
    /// connection in registry order. Every taken command is scheduled even
    /// when some connection cannot be sent to; that connection is reported
    /// in [`Distribution::failed`] and skipped for the rest of the batch.
    pub fn distribute<S: Simulation>(
        &mut self,
        peers: &mut ConnectionRegistry<PeerConnection>,
        sim: &S,
    ) -> Distribution {
        let paused = sim.is_paused();
        let mut taken: Vec<(Option<PeerHandle>, CommandPacket)> =
            take_commands(&mut self.local_queue, self.config.commands_per_frame_server, paused, sim)
                .into_iter()
                .map(|c| (None, c))
                .collect();

        for handle in peers.handles() {
            let Some(peer) = peers.get_mut(handle) else {
                continue;
            };
            if !peer.state().is_synchronized() {
                continue;
            }
            let cmds = take_commands(
                &mut peer.incoming_queue,
                self.config.commands_per_frame,
                paused,
                sim,
            );
            taken.extend(cmds.into_iter().map(|c| (Some(handle), c)));
        }

        let stamp = self.frame + self.config.command_delay;
        let mut result = Distribution {
            count: taken.len(),
            failed: Vec::new(),
        };
        for (origin, mut cmd) in taken {
            cmd.frame = stamp;
            for (handle, peer) in peers.iter_mut() {
                if !receives_commands(peer, stamp)
                    || result.failed.iter().any(|(h, _)| *h == handle)
                {
                    continue;
                }
                let mut out = cmd.clone();
                out.my_cmd = origin == Some(handle);
                if let Err(e) = peer.send(&Message::ServerCommand(out)) {
                    tracing::warn!(%handle, cmd = cmd.cmd, error = %e, "could not forward command");
                    result.failed.push((handle, e.into()));
                }
            }
            tracing::trace!(
                client_id = %cmd.client_id,
                cmd = cmd.cmd,
                frame = stamp,
                "command distributed"
            );
            cmd.my_cmd = origin.is_none();
            self.schedule.insert(cmd);
        }
        result
    }

    /// Executes the next frame. Returns the new frame number.
    pub fn advance<S: Simulation>(&mut self, sim: &mut S) -> u32 {
        self.frame += 1;
        for cmd in self.schedule.take_due(self.frame) {
            sim.execute(self.frame, &cmd);
        }
        sim.advance(self.frame);
        if self.frame % self.config.sync_freq == 0 {
            self.seeds = Some((self.frame, sim.sync_seeds()));
        }
        self.frame
    }

    /// Sends the frame announcement (or a checksum-only sync packet) to
    /// every connection that follows the frame loop.
    ///
    /// A frame packet goes out once clients have been allowed to reach the
    /// current frame; in between, a checksum taken this frame travels in a
    /// sync packet instead.
    pub fn announce(
        &mut self,
        peers: &mut ConnectionRegistry<PeerConnection>,
    ) -> Result<(), SyncError> {
        let seeds = self
            .seeds
            .filter(|(frame, _)| *frame == self.frame)
            .map(|(_, seeds)| seeds);
        let send_frame = self.frame >= self.announced_max;
        if send_frame {
            self.announced_max = self.frame_max();
        }

        for (_, peer) in peers.iter_mut() {
            let synchronized = peer.state().is_synchronized();
            if !synchronized && !is_downloading(peer) {
                continue;
            }
            if send_frame {
                let token = if synchronized && self.token_due(peer) {
                    let token = rand::rng().random_range(1..=u8::MAX);
                    peer.pending_token = Some(token);
                    Some(token)
                } else {
                    None
                };
                peer.send(&Message::ServerFrame {
                    frame: self.frame,
                    frame_max: self.announced_max,
                    seeds,
                    token,
                })?;
                peer.last_frame_server = self.announced_max;
            } else if let Some(seeds) = seeds {
                peer.send(&Message::ServerSync {
                    frame: self.frame,
                    seeds,
                })?;
            }
        }
        Ok(())
    }

    fn token_due(&self, peer: &PeerConnection) -> bool {
        peer.pending_token.is_none()
            && self.frame.saturating_sub(peer.last_token_frame) >= self.config.token_interval
    }

    // -----------------------------------------------------------------------
    // Acks and lag
    // -----------------------------------------------------------------------

    /// Records a client's acknowledgment.
    ///
    /// # Errors
    /// - [`SyncError::AckOutOfOrder`] if `frame` went backwards
    /// - [`SyncError::AckAheadOfServer`] if `frame` passed what the server allowed
    /// - [`SyncError::UnknownToken`] for a non-zero token that is not outstanding
    pub fn handle_ack(
        &self,
        peer: &mut PeerConnection,
        frame: u32,
        token: u8,
    ) -> Result<(), SyncError> {
        if frame < peer.last_frame {
            return Err(SyncError::AckOutOfOrder {
                frame,
                last_frame: peer.last_frame,
            });
        }
        if frame > peer.last_frame_server {
            return Err(SyncError::AckAheadOfServer {
                frame,
                last_frame_server: peer.last_frame_server,
            });
        }
        if token != 0 {
            if peer.pending_token != Some(token) {
                return Err(SyncError::UnknownToken { token });
            }
            peer.pending_token = None;
            peer.last_token_frame = self.frame;
        }
        peer.last_frame = frame;
        Ok(())
    }

    /// Measures how long `peer` has gone without echoing a token.
    ///
    /// # Errors
    /// [`SyncError::Timeout`] once the lag passes `max_lag_frames`.
    pub fn check_lag(&self, peer: &PeerConnection) -> Result<LagStatus, SyncError> {
        let lag_frames = self.frame.saturating_sub(peer.last_token_frame);
        if lag_frames > self.config.max_lag_frames {
            return Err(SyncError::Timeout { lag_frames });
        }
        if lag_frames > self.config.max_lag_frames / 2 {
            return Ok(LagStatus::Lagging { lag_frames });
        }
        Ok(LagStatus::Healthy)
    }

    // -----------------------------------------------------------------------
    // Joining clients
    // -----------------------------------------------------------------------

    /// Marks the frame `peer`'s map snapshot is taken at and forwards every
    /// command already scheduled past it.
    ///
    /// Those commands were broadcast before the peer was listening, and the
    /// snapshot does not contain their effect yet.
    pub fn start_transfer(&self, peer: &mut PeerConnection) -> Result<(), SyncError> {
        peer.snapshot_frame = Some(self.frame);
        peer.last_frame = self.frame;
        peer.last_frame_server = self.frame;
        for cmd in self.schedule.iter() {
            let mut out = cmd.clone();
            out.my_cmd = false;
            peer.send(&Message::ServerCommand(out))?;
        }
        tracing::debug!(
            client_id = %peer.client_id,
            frame = self.frame,
            forwarded = self.schedule.len(),
            "map snapshot frame fixed"
        );
        Ok(())
    }

    /// Starts lag tracking for a peer that just loaded the map.
    pub fn admit(&self, peer: &mut PeerConnection) {
        peer.pending_token = None;
        peer.last_token_frame = self.frame;
    }
}

fn check_size(cmd: &CommandPacket) -> Result<(), SyncError> {
    if cmd.data.len() > MAX_COMMAND_DATA_LEN {
        return Err(SyncError::CommandTooLarge {
            len: cmd.data.len(),
            max: MAX_COMMAND_DATA_LEN,
        });
    }
    Ok(())
}

fn take_commands<S: Simulation>(
    queue: &mut CommandQueue,
    limit: usize,
    paused: bool,
    sim: &S,
) -> Vec<CommandPacket> {
    if paused {
        queue.take_where(limit, |c| sim.allowed_while_paused(c))
    } else {
        queue.take_where(limit, |_| true)
    }
}

fn is_downloading(peer: &PeerConnection) -> bool {
    peer.state() == ConnectionState::MapTransfer && peer.snapshot_frame.is_some()
}

fn receives_commands(peer: &PeerConnection, stamp: u32) -> bool {
    match peer.state() {
        ConnectionState::Synchronized => true,
        ConnectionState::MapTransfer => peer.snapshot_frame.is_some_and(|f| f < stamp),
        _ => false,
    }
}
