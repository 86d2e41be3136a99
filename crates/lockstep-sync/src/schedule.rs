//! Commands waiting for the frame they execute at.

use std::collections::BTreeMap;

use lockstep_protocol::CommandPacket;

/// Stamped commands keyed by execution frame.
///
/// Within one frame, commands keep the order they were inserted in, which
/// is the order the server replicated them.
#[derive(Debug, Clone, Default)]
pub struct FrameSchedule {
    frames: BTreeMap<u32, Vec<CommandPacket>>,
    len: usize,
}

impl FrameSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `cmd` at `cmd.frame`.
    pub fn insert(&mut self, cmd: CommandPacket) {
        self.frames.entry(cmd.frame).or_default().push(cmd);
        self.len += 1;
    }

    /// Removes every command due at or before `frame`, oldest frame first.
    pub fn take_due(&mut self, frame: u32) -> Vec<CommandPacket> {
        let mut due = Vec::new();
        while let Some(entry) = self.frames.first_entry() {
            if *entry.key() > frame {
                break;
            }
            due.extend(entry.remove());
        }
        self.len -= due.len();
        due
    }

    /// The earliest frame with a scheduled command.
    pub fn next_frame(&self) -> Option<u32> {
        self.frames.keys().next().copied()
    }

    /// Every scheduled command, in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &CommandPacket> {
        self.frames.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_protocol::CompanyId;

    fn cmd(id: u32, frame: u32) -> CommandPacket {
        let mut c = CommandPacket::new(CompanyId(0), id, Vec::new(), 0);
        c.frame = frame;
        c
    }

    #[test]
    fn test_take_due_returns_only_reached_frames_in_order() {
        let mut s = FrameSchedule::new();
        s.insert(cmd(1, 105));
        s.insert(cmd(2, 103));
        s.insert(cmd(3, 105));

        assert!(s.take_due(102).is_empty());
        let due: Vec<u32> = s.take_due(104).iter().map(|c| c.cmd).collect();
        assert_eq!(due, vec![2]);
        let due: Vec<u32> = s.take_due(105).iter().map(|c| c.cmd).collect();
        assert_eq!(due, vec![1, 3]);
        assert!(s.is_empty());
    }

    #[test]
    fn test_iter_walks_frames_in_ascending_order() {
        let mut s = FrameSchedule::new();
        s.insert(cmd(1, 9));
        s.insert(cmd(2, 7));
        assert_eq!(s.next_frame(), Some(7));
        let order: Vec<u32> = s.iter().map(|c| c.cmd).collect();
        assert_eq!(order, vec![2, 1]);
        assert_eq!(s.len(), 2);
    }
}
