//! Bulk map transfer: the server's send queue and the client's receiver.
//!
//! A joining client needs the whole simulation state before it can run
//! frames. The server takes a snapshot and streams it in chunks:
//!
//! ```text
//! server                                  client
//!   map-begin(frame)  ──────────────────▶   MapReceiver::on_begin
//!   map-size(bytes)   ──────────────────▶   MapReceiver::on_size
//!   map-data(chunk) × n ────────────────▶   MapReceiver::on_data
//!   map-done          ──────────────────▶   MapReceiver::on_done
//!                     ◀──────────────────   map-ok
//! ```
//!
//! Only `max_concurrent` transfers run at once. Everyone else waits in a
//! FIFO and is told its position.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use lockstep_protocol::{Message, ProtocolError};

use crate::{Simulation, SyncError, TransferConfig};
use crate::config::MAX_CHUNK_SIZE;

// ---------------------------------------------------------------------------
// MapTransferQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ActiveTransfer<K> {
    key: K,
    data: Bytes,
    sent: usize,
    done_sent: bool,
}

/// Server-side scheduler for map transfers, keyed by connection.
#[derive(Debug)]
pub struct MapTransferQueue<K> {
    config: TransferConfig,
    active: Vec<ActiveTransfer<K>>,
    waiting: VecDeque<K>,
}

impl<K: Copy + Eq> MapTransferQueue<K> {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: config.validated(),
            active: Vec::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Asks for a transfer to `key`.
    ///
    /// If a slot is free, the snapshot is taken now at `frame` and the
    /// begin and size packets are returned. Otherwise `key` joins the line.
    ///
    /// # Errors
    /// - [`SyncError::TransferQueueFull`] (recoverable) with the
    ///   requester's 1-based position in line
    /// - [`SyncError::Snapshot`] if the simulation cannot serialize
    pub fn request<S: Simulation>(
        &mut self,
        key: K,
        frame: u32,
        sim: &S,
    ) -> Result<Vec<Message>, SyncError> {
        if let Some(position) = self.position(key) {
            return Err(SyncError::TransferQueueFull { position });
        }
        if self.active.len() >= self.config.max_concurrent {
            self.waiting.push_back(key);
            return Err(SyncError::TransferQueueFull {
                position: self.waiting.len(),
            });
        }
        self.start(key, frame, sim)
    }

    fn start<S: Simulation>(
        &mut self,
        key: K,
        frame: u32,
        sim: &S,
    ) -> Result<Vec<Message>, SyncError> {
        let data = sim.snapshot().map_err(SyncError::Snapshot)?;
        let bytes = u32::try_from(data.len()).map_err(|_| ProtocolError::Oversized {
            len: data.len(),
            limit: u32::MAX as usize,
        })?;
        tracing::info!(frame, bytes, "map transfer started");
        self.active.push(ActiveTransfer {
            key,
            data,
            sent: 0,
            done_sent: false,
        });
        Ok(vec![
            Message::ServerMapBegin { frame },
            Message::ServerMapSize { bytes },
        ])
    }

    /// Emits the next chunks of every running transfer, and `map-done`
    /// once a transfer's data is all out.
    pub fn pump(&mut self) -> Vec<(K, Message)> {
        let chunk_size = self.config.chunk_size.min(MAX_CHUNK_SIZE);
        let mut out = Vec::new();
        for transfer in &mut self.active {
            for _ in 0..self.config.chunks_per_tick {
                if transfer.sent >= transfer.data.len() {
                    break;
                }
                let end = (transfer.sent + chunk_size).min(transfer.data.len());
                let chunk = transfer.data.slice(transfer.sent..end);
                transfer.sent = end;
                out.push((transfer.key, Message::ServerMapData { chunk }));
            }
            if transfer.sent >= transfer.data.len() && !transfer.done_sent {
                transfer.done_sent = true;
                out.push((transfer.key, Message::ServerMapDone));
            }
        }
        out
    }

    /// Frees `key`'s slot after the client confirmed the load.
    /// Returns `false` if `key` had no running transfer.
    pub fn finish(&mut self, key: K) -> bool {
        let before = self.active.len();
        self.active.retain(|t| t.key != key);
        before != self.active.len()
    }

    /// Drops `key` wherever it is, running or waiting.
    pub fn cancel(&mut self, key: K) -> bool {
        let before = self.active.len() + self.waiting.len();
        self.active.retain(|t| t.key != key);
        self.waiting.retain(|k| *k != key);
        before != self.active.len() + self.waiting.len()
    }

    /// Starts waiting transfers while slots are free.
    ///
    /// Returns each started key with its begin and size packets. A waiter
    /// whose snapshot fails is dropped from the line and reported as the
    /// error for that key.
    pub fn promote<S: Simulation>(
        &mut self,
        frame: u32,
        sim: &S,
    ) -> Vec<(K, Result<Vec<Message>, SyncError>)> {
        let mut started = Vec::new();
        while self.active.len() < self.config.max_concurrent {
            let Some(key) = self.waiting.pop_front() else {
                break;
            };
            started.push((key, self.start(key, frame, sim)));
        }
        started
    }

    /// A `wait(position)` notice for everyone in line.
    pub fn wait_notices(&self) -> Vec<(K, Message)> {
        self.waiting
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let waiting = u8::try_from(i + 1).unwrap_or(u8::MAX);
                (*key, Message::ServerWait { waiting })
            })
            .collect()
    }

    pub fn is_active(&self, key: K) -> bool {
        self.active.iter().any(|t| t.key == key)
    }

    /// 1-based position of `key` in line, if it is waiting.
    pub fn position(&self, key: K) -> Option<usize> {
        self.waiting.iter().position(|k| *k == key).map(|i| i + 1)
    }

    /// Bytes sent and total for `key`'s running transfer.
    pub fn progress(&self, key: K) -> Option<(usize, usize)> {
        self.active
            .iter()
            .find(|t| t.key == key)
            .map(|t| (t.sent, t.data.len()))
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}

// ---------------------------------------------------------------------------
// MapReceiver
// ---------------------------------------------------------------------------

/// Client-side reassembly of one map transfer.
#[derive(Debug)]
pub struct MapReceiver {
    max_map_size: u32,
    frame: Option<u32>,
    declared: Option<u32>,
    data: BytesMut,
    done: bool,
}

impl MapReceiver {
    pub fn new(max_map_size: u32) -> Self {
        Self {
            max_map_size,
            frame: None,
            declared: None,
            data: BytesMut::new(),
            done: false,
        }
    }

    pub fn on_begin(&mut self, frame: u32) -> Result<(), SyncError> {
        if self.frame.is_some() {
            return Err(SyncError::UnexpectedMapPacket("second map-begin"));
        }
        self.frame = Some(frame);
        Ok(())
    }

    /// # Errors
    /// [`ProtocolError::Oversized`] if `bytes` exceeds `max_map_size`.
    pub fn on_size(&mut self, bytes: u32) -> Result<(), SyncError> {
        if self.frame.is_none() {
            return Err(SyncError::UnexpectedMapPacket("map-size before map-begin"));
        }
        if self.declared.is_some() {
            return Err(SyncError::UnexpectedMapPacket("second map-size"));
        }
        if bytes > self.max_map_size {
            return Err(ProtocolError::Oversized {
                len: bytes as usize,
                limit: self.max_map_size as usize,
            }
            .into());
        }
        self.declared = Some(bytes);
        self.data.reserve(bytes as usize);
        Ok(())
    }

    /// # Errors
    /// [`ProtocolError::Oversized`] if the data runs past the declared size.
    pub fn on_data(&mut self, chunk: &[u8]) -> Result<(), SyncError> {
        let Some(declared) = self.declared else {
            return Err(SyncError::UnexpectedMapPacket("map-data before map-size"));
        };
        if self.done {
            return Err(SyncError::UnexpectedMapPacket("map-data after map-done"));
        }
        let len = self.data.len() + chunk.len();
        if len > declared as usize {
            return Err(ProtocolError::Oversized {
                len,
                limit: declared as usize,
            }
            .into());
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// # Errors
    /// [`SyncError::MapSizeMismatch`] unless exactly the declared bytes arrived.
    pub fn on_done(&mut self) -> Result<(), SyncError> {
        let Some(declared) = self.declared else {
            return Err(SyncError::UnexpectedMapPacket("map-done before map-size"));
        };
        let received = self.data.len() as u32;
        if received != declared {
            return Err(SyncError::MapSizeMismatch { declared, received });
        }
        self.done = true;
        Ok(())
    }

    /// Bytes received and declared so far.
    pub fn progress(&self) -> (usize, Option<u32>) {
        (self.data.len(), self.declared)
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    pub fn snapshot_frame(&self) -> Option<u32> {
        self.frame
    }

    /// Hands over the finished map and its snapshot frame.
    ///
    /// # Errors
    /// [`SyncError::UnexpectedMapPacket`] if the transfer is not complete.
    pub fn finish(self) -> Result<(u32, Bytes), SyncError> {
        match (self.done, self.frame) {
            (true, Some(frame)) => Ok((frame, self.data.freeze())),
            _ => Err(SyncError::UnexpectedMapPacket("map not complete")),
        }
    }
}
