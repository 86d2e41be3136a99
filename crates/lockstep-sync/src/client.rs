//! The client half of the frame synchronizer.
//!
//! A client never decides anything about time. It buffers the commands
//! the server stamps, runs frames only as far as the server allows, and
//! checks its checksum against the server's whenever one arrives.
//!
//! ```text
//! server: command(frame 105)   frame(100, max 100) ... frame(105, max 105)
//! client: buffer               run to 100          ... run 101..=105, apply at 105
//! ```

use std::collections::VecDeque;

use lockstep_protocol::{CommandPacket, Message, SyncSeeds};

use crate::{FrameSchedule, Simulation, SyncError};

/// Frame loop state of one client.
#[derive(Debug)]
pub struct FrameClient {
    ack_interval: u32,
    /// Last executed frame.
    frame: u32,
    /// Highest frame the server allows.
    frame_max: u32,
    /// Last frame the server announced it executed.
    frame_server: u32,
    schedule: FrameSchedule,
    /// Server checksums for frames not yet executed here.
    expected: VecDeque<(u32, SyncSeeds)>,
    /// Own checksums for frames executed ahead of the server.
    recorded: VecDeque<(u32, SyncSeeds)>,
    /// Token to echo with the next ack.
    token: Option<u8>,
    last_ack_frame: u32,
}

impl FrameClient {
    /// A client whose simulation was loaded from a snapshot taken at
    /// `snapshot_frame`.
    pub fn new(snapshot_frame: u32, ack_interval: u32) -> Self {
        Self {
            ack_interval: ack_interval.max(1),
            frame: snapshot_frame,
            frame_max: snapshot_frame,
            frame_server: snapshot_frame,
            schedule: FrameSchedule::new(),
            expected: VecDeque::new(),
            recorded: VecDeque::new(),
            token: None,
            last_ack_frame: snapshot_frame,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    pub fn frame_server(&self) -> u32 {
        self.frame_server
    }

    /// Commands received but not yet executed.
    pub fn pending_commands(&self) -> usize {
        self.schedule.len()
    }

    /// Whether the server allows running another frame.
    pub fn can_advance(&self) -> bool {
        self.frame < self.frame_max
    }

    // -----------------------------------------------------------------------
    // Server packets
    // -----------------------------------------------------------------------

    /// Buffers a replicated command until its frame.
    ///
    /// # Errors
    /// [`SyncError::DesyncDetected`] if the frame already ran here.
    pub fn on_command(&mut self, cmd: CommandPacket) -> Result<(), SyncError> {
        if cmd.frame <= self.frame {
            return Err(SyncError::DesyncDetected {
                frame: cmd.frame,
                reason: "command for a frame already executed",
            });
        }
        self.schedule.insert(cmd);
        Ok(())
    }

    /// Takes a frame announcement. Returns an ack to send right away
    /// when the announcement carried a token.
    ///
    /// # Errors
    /// - [`SyncError::DesyncDetected`] if the announcement went backwards
    /// - [`SyncError::ChecksumMismatch`] if the seeds are for a frame
    ///   already executed here and differ
    pub fn on_frame(
        &mut self,
        frame: u32,
        frame_max: u32,
        seeds: Option<SyncSeeds>,
        token: Option<u8>,
    ) -> Result<Option<Message>, SyncError> {
        if frame < self.frame_server || frame_max < self.frame_max {
            return Err(SyncError::DesyncDetected {
                frame,
                reason: "server frame went backwards",
            });
        }
        self.frame_server = frame;
        self.frame_max = frame_max;
        if let Some(seeds) = seeds {
            self.on_seeds(frame, seeds)?;
        }
        self.recorded.retain(|(f, _)| *f > frame);

        match token {
            Some(token) => {
                self.token = Some(token);
                Ok(Some(self.ack()))
            }
            None => Ok(None),
        }
    }

    /// Takes a checksum-only announcement.
    pub fn on_sync(&mut self, frame: u32, seeds: SyncSeeds) -> Result<(), SyncError> {
        self.on_seeds(frame, seeds)
    }

    fn on_seeds(&mut self, frame: u32, seeds: SyncSeeds) -> Result<(), SyncError> {
        if frame > self.frame {
            self.expected.push_back((frame, seeds));
            return Ok(());
        }
        match self.recorded.iter().find(|(f, _)| *f == frame) {
            Some((_, actual)) => compare(frame, seeds, *actual),
            None => {
                tracing::debug!(frame, local = self.frame, "missed frame for checksum test");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    /// Executes one frame if the server allows it.
    ///
    /// Returns `Ok(None)` when blocked at `frame_max`, otherwise the
    /// optional ack to send.
    ///
    /// # Errors
    /// [`SyncError::ChecksumMismatch`] if the frame's checksum differs
    /// from the server's.
    pub fn advance<S: Simulation>(&mut self, sim: &mut S) -> Result<Option<Message>, SyncError> {
        if !self.can_advance() {
            return Ok(None);
        }
        self.frame += 1;
        for cmd in self.schedule.take_due(self.frame) {
            sim.execute(self.frame, &cmd);
        }
        sim.advance(self.frame);

        while let Some(&(frame, _)) = self.expected.front() {
            if frame > self.frame {
                break;
            }
            if let Some((frame, expected)) = self.expected.pop_front() {
                if frame == self.frame {
                    compare(frame, expected, sim.sync_seeds())?;
                }
            }
        }
        if self.frame > self.frame_server {
            self.recorded.push_back((self.frame, sim.sync_seeds()));
        }

        if self.frame - self.last_ack_frame >= self.ack_interval {
            return Ok(Some(self.ack()));
        }
        Ok(None)
    }

    /// Runs every frame the server currently allows, collecting the acks.
    pub fn catch_up<S: Simulation>(&mut self, sim: &mut S) -> Result<Vec<Message>, SyncError> {
        let mut acks = Vec::new();
        while self.can_advance() {
            if let Some(ack) = self.advance(sim)? {
                acks.push(ack);
            }
        }
        Ok(acks)
    }

    fn ack(&mut self) -> Message {
        self.last_ack_frame = self.frame;
        Message::ClientAck {
            frame: self.frame,
            token: self.token.take().unwrap_or(0),
        }
    }
}

fn compare(frame: u32, expected: SyncSeeds, actual: SyncSeeds) -> Result<(), SyncError> {
    if expected != actual {
        tracing::warn!(frame, %expected, %actual, "checksum mismatch");
        return Err(SyncError::ChecksumMismatch {
            frame,
            expected,
            actual,
        });
    }
    Ok(())
}
