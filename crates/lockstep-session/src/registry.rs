//! The connection registry: a generational slot table with deferred removal.
//!
//! Packet handlers often decide to tear down the very connection they are
//! working on (a quit packet, a failed check). Removing it on the spot
//! would pull the value out from under the handler. Instead a handler only
//! *marks* the connection, and the owner calls [`ConnectionRegistry::sweep`]
//! once per processing cycle, after every packet has been handled.
//!
//! ## Lifecycle
//!
//! ```text
//! insert() ──→ [live] ──→ defer_deletion() ──→ [pending] ──→ sweep() ──→ gone
//!                 ▲                                             │
//!                 └──────── slot reused, generation + 1 ◀───────┘
//! ```
//!
//! `sweep` takes `&mut self`, so the borrow checker guarantees no handler
//! still holds a reference into the registry while it runs. Handles carry
//! the slot's generation: a handle to a swept connection resolves to
//! `None` rather than to whichever connection reused the slot.

use std::fmt;

/// Values stored in a [`ConnectionRegistry`].
pub trait PendingDeletion {
    /// Whether the next sweep should remove this value.
    fn is_pending_deletion(&self) -> bool;

    /// Marks the value for removal on the next sweep.
    fn defer_deletion(&mut self);
}

/// Stable reference to one registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Owns every connection; inserts on accept, removes only in [`sweep`](Self::sweep).
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T: PendingDeletion> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new connection and returns its handle.
    pub fn insert(&mut self, value: T) -> PeerHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return PeerHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        PeerHandle {
            index,
            generation: 0,
        }
    }

    fn slot(&self, handle: PeerHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&T> {
        self.slot(handle).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, handle: PeerHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Marks a connection for removal. Returns `false` for a stale handle.
    pub fn defer_deletion(&mut self, handle: PeerHandle) -> bool {
        match self.get_mut(handle) {
            Some(value) => {
                value.defer_deletion();
                true
            }
            None => false,
        }
    }

    /// Handles of every stored connection, in slot order.
    ///
    /// Collecting the handles first lets a caller mutate connections one
    /// at a time while walking them.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    PeerHandle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| {
                (
                    PeerHandle {
                        index: i as u32,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    /// The first connection matching `pred`.
    pub fn find<F>(&self, mut pred: F) -> Option<PeerHandle>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }

    /// Removes every connection marked pending deletion and hands them
    /// back, so the caller can flush their last packets and report them.
    pub fn sweep(&mut self) -> Vec<(PeerHandle, T)> {
        let mut removed = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let pending = slot
                .value
                .as_ref()
                .is_some_and(|v| v.is_pending_deletion());
            if !pending {
                continue;
            }
            let handle = PeerHandle {
                index: i as u32,
                generation: slot.generation,
            };
            if let Some(value) = slot.value.take() {
                removed.push((handle, value));
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(i as u32);
        }
        self.len -= removed.len();
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
