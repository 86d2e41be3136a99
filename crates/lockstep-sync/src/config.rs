//! Synchronization and map transfer settings.

use lockstep_protocol::{ENCRYPTION_OVERHEAD, HEADER_SIZE, SEND_MTU};
use serde::{Deserialize, Serialize};

/// Largest map chunk that still fits one sealed packet.
pub const MAX_CHUNK_SIZE: usize = SEND_MTU - ENCRYPTION_OVERHEAD - HEADER_SIZE;

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// How the frame synchronizer paces commands, checksums, and acks.
///
/// Both sides read the same struct; the server uses most fields and the
/// client only `ack_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How far past its own frame the server lets clients run.
    /// 0 means clients may never be ahead of the server.
    pub frame_freq: u32,

    /// Frames between taking a command and executing it. Must be
    /// greater than `frame_freq`, otherwise a client could pass the
    /// execution frame before the command reaches it.
    pub command_delay: u32,

    /// Commands taken per connection per frame.
    pub commands_per_frame: usize,

    /// Commands taken from the server's own queue per frame.
    pub commands_per_frame_server: usize,

    /// Queued commands a client may have before it is dropped.
    pub max_commands_in_queue: usize,

    /// Frames between determinism checksums.
    pub sync_freq: u32,

    /// Frames between validation tokens to one client.
    pub token_interval: u32,

    /// Frames without an echoed token before a client is dropped.
    pub max_lag_frames: u32,

    /// Pause the simulation while a client downloads the map.
    pub pause_on_join: bool,

    /// Pause the simulation while a client lags past the warning mark.
    pub pause_on_lag: bool,

    /// Frames between unprompted client acks.
    pub ack_interval: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_freq: 0,
            command_delay: 1,
            commands_per_frame: 2,
            commands_per_frame_server: 16,
            max_commands_in_queue: 16,
            sync_freq: 100,
            token_interval: 32,
            max_lag_frames: 500,
            pause_on_join: true,
            pause_on_lag: false,
            ack_interval: 74,
        }
    }
}

impl SyncConfig {
    /// Clamps settings that would break the frame loop.
    pub fn validated(mut self) -> Self {
        if self.command_delay <= self.frame_freq {
            tracing::warn!(
                command_delay = self.command_delay,
                frame_freq = self.frame_freq,
                "command_delay must exceed frame_freq, raising it"
            );
            self.command_delay = self.frame_freq + 1;
        }
        if self.commands_per_frame == 0 {
            tracing::warn!("commands_per_frame is 0, using 1");
            self.commands_per_frame = 1;
        }
        if self.commands_per_frame_server == 0 {
            tracing::warn!("commands_per_frame_server is 0, using 1");
            self.commands_per_frame_server = 1;
        }
        if self.sync_freq == 0 {
            tracing::warn!("sync_freq is 0, using 1");
            self.sync_freq = 1;
        }
        if self.ack_interval == 0 {
            tracing::warn!("ack_interval is 0, using 1");
            self.ack_interval = 1;
        }
        if self.max_lag_frames <= self.token_interval {
            tracing::warn!(
                max_lag_frames = self.max_lag_frames,
                token_interval = self.token_interval,
                "max_lag_frames must exceed token_interval, raising it"
            );
            self.max_lag_frames = self.token_interval.saturating_mul(2).max(2);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// TransferConfig
// ---------------------------------------------------------------------------

/// Limits for sending the map to joining clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfers running at once. Later requesters wait in line.
    pub max_concurrent: usize,

    /// Bytes per map-data packet. Capped at [`MAX_CHUNK_SIZE`].
    pub chunk_size: usize,

    /// Chunks sent per transfer per tick.
    pub chunks_per_tick: usize,

    /// Largest map a client accepts.
    pub max_map_size: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            chunk_size: MAX_CHUNK_SIZE,
            chunks_per_tick: 4,
            max_map_size: 256 * 1024 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn validated(mut self) -> Self {
        if self.max_concurrent == 0 {
            tracing::warn!("max_concurrent is 0, using 1");
            self.max_concurrent = 1;
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            tracing::warn!(
                chunk_size = self.chunk_size,
                max = MAX_CHUNK_SIZE,
                "chunk_size out of range, clamping"
            );
            self.chunk_size = self.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        }
        if self.chunks_per_tick == 0 {
            tracing::warn!("chunks_per_tick is 0, using 1");
            self.chunks_per_tick = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_raises_command_delay_above_frame_freq() {
        let cfg = SyncConfig {
            frame_freq: 3,
            command_delay: 2,
            ..SyncConfig::default()
        }
        .validated();
        assert_eq!(cfg.command_delay, 4);
    }

    #[test]
    fn test_validated_keeps_sane_defaults() {
        assert_eq!(SyncConfig::default().validated(), SyncConfig::default());
        assert_eq!(TransferConfig::default().validated(), TransferConfig::default());
    }

    #[test]
    fn test_transfer_chunk_size_capped_at_packet_limit() {
        let cfg = TransferConfig {
            chunk_size: 1 << 20,
            ..TransferConfig::default()
        }
        .validated();
        assert_eq!(cfg.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: SyncConfig = serde_json::from_str(r#"{ "frame_freq": 2, "command_delay": 5 }"#).unwrap();
        assert_eq!(cfg.frame_freq, 2);
        assert_eq!(cfg.command_delay, 5);
        assert_eq!(cfg.sync_freq, SyncConfig::default().sync_freq);
    }
}
