//! Duplicate suppression: short-horizon ring of (source, msgId) already processed.

use crate::packet::NodeAddr;

/// Ring capacity. Older entries are overwritten first.
pub const DEDUPE_CAPACITY: usize = 32;

/// Default recency horizon in milliseconds.
pub const DEFAULT_DEDUPE_HORIZON_MS: u32 = 1_500;

#[derive(Debug, Clone, Copy)]
struct Seen {
    src: NodeAddr,
    msg_id: u32,
    at_ms: u32,
}

/// Fixed-size recency cache. Operates on every packet kind, before dispatch.
pub struct DedupeCache {
    entries: [Option<Seen>; DEDUPE_CAPACITY],
    head: usize,
    horizon_ms: u32,
}

impl DedupeCache {
    pub fn new(horizon_ms: u32) -> Self {
        Self {
            entries: [None; DEDUPE_CAPACITY],
            head: 0,
            horizon_ms,
        }
    }

    /// Returns true if `(src, msg_id)` has not been seen within the horizon, and
    /// records it. A hit returns false and leaves the cache untouched.
    pub fn check_and_insert(&mut self, src: NodeAddr, msg_id: u32, now_ms: u32) -> bool {
        let horizon = self.horizon_ms;
        let hit = self.entries.iter().flatten().any(|s| {
            s.src == src && s.msg_id == msg_id && now_ms.wrapping_sub(s.at_ms) < horizon
        });
        if hit {
            return false;
        }
        self.entries[self.head] = Some(Seen {
            src,
            msg_id,
            at_ms: now_ms,
        });
        self.head = (self.head + 1) % DEDUPE_CAPACITY;
        true
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_HORIZON_MS)
    }
}
