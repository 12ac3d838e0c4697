//! Per-path coalescing of raw notifications.
//!
//! Every path with undelivered changes owns one slot in an arena keyed by
//! path. A slot becomes ready once the debounce window has elapsed since its
//! first notification, so a continuous storm still produces an event per
//! window instead of starving subscribers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::event::{ChangeEvent, ChangeKind};

/// Merge an incoming kind into a pending one.
///
/// `None` means the two cancel out and nothing should be delivered.
pub fn coalesce(pending: ChangeKind, incoming: ChangeKind) -> Option<ChangeKind> {
    use ChangeKind::*;

    match (pending, incoming) {
        (Created, Removed) => None,
        (Created, Modified) => Some(Created),
        (Removed, Created) | (Removed, Modified) => Some(Modified),
        (Renamed, Created) => Some(Modified),
        (_, Renamed) => Some(Renamed),
        (_, incoming) => Some(incoming),
    }
}

#[derive(Debug)]
struct Slot {
    event: ChangeEvent,
    seq: u64,
    deadline: Instant,
}

/// Arena of pending events, one slot per path.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    next_seq: u64,
    slots: HashMap<PathBuf, Slot>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_seq: 0,
            slots: HashMap::new(),
        }
    }

    /// Record a change observed at `now`.
    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        if !self.slots.contains_key(&event.path) {
            self.next_seq += 1;
            let slot = Slot {
                seq: self.next_seq,
                deadline: now + self.window,
                event,
            };
            self.slots.insert(slot.event.path.clone(), slot);
            return;
        }
        let Some(slot) = self.slots.get_mut(&event.path) else {
            return;
        };

        match coalesce(slot.event.kind, event.kind) {
            Some(kind) => {
                slot.event.kind = kind;
                if kind == ChangeKind::Renamed {
                    if event.new_path.is_some() {
                        slot.event.new_path = event.new_path;
                    }
                } else {
                    slot.event.new_path = None;
                }
            }
            None => {
                self.slots.remove(&event.path);
            }
        }
    }

    /// Remove and return every slot whose window has elapsed, in the order
    /// their first notification was observed.
    pub fn take_ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let ready: Vec<PathBuf> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut slots: Vec<Slot> = ready
            .iter()
            .filter_map(|path| self.slots.remove(path))
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.event).collect()
    }

    /// Earliest deadline among pending slots.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().map(|slot| slot.deadline).min()
    }

    /// Drop pending slots for `path` and everything below it.
    pub fn cancel(&mut self, path: &Path) -> usize {
        let before = self.slots.len();
        self.slots.retain(|p, _| !p.starts_with(path));
        before - self.slots.len()
    }

    /// Drop every pending slot, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.slots.len();
        self.slots.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
