//! Simulation commands and the per-connection queue that holds them.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::{ClientId, CompanyId};

/// Largest parameter blob a single command may carry.
pub const MAX_COMMAND_DATA_LEN: usize = 16 * 1024;

/// One request to mutate the simulation.
///
/// The parameter blob is opaque here; only the simulation knows how to
/// read it. A command is never changed after it is queued, except that
/// the server stamps the frame it must execute at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Who sent it. Set by the server from the connection, never read
    /// from a client's packet.
    pub client_id: ClientId,
    pub company: CompanyId,
    pub cmd: u32,
    pub data: Bytes,
    /// Tag the originator uses to find its continuation once the command
    /// has executed.
    pub callback: u8,
    /// Frame of execution. Zero until stamped.
    pub frame: u32,
    /// `true` on the peer that originated the command.
    pub my_cmd: bool,
}

impl CommandPacket {
    /// Builds an unstamped command.
    pub fn new(company: CompanyId, cmd: u32, data: impl Into<Bytes>, callback: u8) -> Self {
        Self {
            client_id: ClientId::INVALID,
            company,
            cmd,
            data: data.into(),
            callback,
            frame: 0,
            my_cmd: false,
        }
    }
}

/// Commands waiting to be handled, in arrival order.
///
/// This is not a plain FIFO. While the simulation is paused only some
/// commands may run, and the others have to stay where they are.
/// [`take_where`](Self::take_where) removes the matching ones and leaves
/// the rest queued in their original order.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    items: VecDeque<CommandPacket>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: CommandPacket) {
        self.items.push_back(cmd);
    }

    /// The oldest command, without removing it.
    pub fn peek(&self) -> Option<&CommandPacket> {
        self.items.front()
    }

    /// Removes and returns the oldest command.
    pub fn pop(&mut self) -> Option<CommandPacket> {
        self.items.pop_front()
    }

    /// Removes up to `limit` commands matching `pred`, oldest first.
    /// Commands that don't match (or exceed the limit) keep their place.
    pub fn take_where<F>(&mut self, limit: usize, mut pred: F) -> Vec<CommandPacket>
    where
        F: FnMut(&CommandPacket) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for cmd in self.items.drain(..) {
            if taken.len() < limit && pred(&cmd) {
                taken.push(cmd);
            } else {
                kept.push_back(cmd);
            }
        }
        self.items = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandPacket> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(id: u32) -> CommandPacket {
        CommandPacket::new(CompanyId(0), id, vec![id as u8], 0)
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut q = CommandQueue::new();
        q.push(cmd(1));
        assert_eq!(q.peek().map(|c| c.cmd), Some(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().map(|c| c.cmd), Some(1));
        assert!(q.is_empty());
    }

    #[test]
    fn test_take_where_leaves_non_matching_in_order() {
        let mut q = CommandQueue::new();
        for id in 1..=5 {
            q.push(cmd(id));
        }

        // Only even commands are allowed right now.
        let taken = q.take_where(usize::MAX, |c| c.cmd % 2 == 0);
        assert_eq!(taken.iter().map(|c| c.cmd).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(q.iter().map(|c| c.cmd).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_take_where_respects_limit() {
        let mut q = CommandQueue::new();
        for id in 1..=4 {
            q.push(cmd(id));
        }
        let taken = q.take_where(2, |_| true);
        assert_eq!(taken.len(), 2);
        assert_eq!(q.peek().map(|c| c.cmd), Some(3));
    }
}
