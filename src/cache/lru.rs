//! Cache-Line LRU
//!
//! Tracks evictable `(object, line offset)` entries in least-recently-used
//! order with a running byte budget. Shared across placement groups, so it
//! carries its own mutex; holders only touch it for list splices and
//! counter math.
//!
//! Eviction is wired but disabled by default, pending a separate decision
//! on eviction policy. A disabled LRU admits nothing, and the cache frees
//! lines eagerly on last unpin instead.

use parking_lot::Mutex;

use crate::ObjectId;

/// Key of one cache line.
pub type LineKey = (ObjectId, u64);

#[derive(Default)]
struct LruState {
    // Front is oldest. Small by construction; linear splices are fine.
    entries: Vec<(LineKey, u64)>,
    size: u64,
}

/// Least-recently-used list of unpinned cache lines.
pub struct Lru {
    max_size: u64,
    enabled: bool,
    state: Mutex<LruState>,
}

impl Lru {
    /// LRU with eviction disabled (the default configuration).
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            enabled: false,
            state: Mutex::new(LruState::default()),
        }
    }

    /// LRU that actually admits and evicts lines.
    pub fn new_enabled(max_size: u64) -> Self {
        Self {
            enabled: true,
            ..Self::new(max_size)
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn contains(&self, key: &LineKey) -> bool {
        self.state.lock().entries.iter().any(|(k, _)| k == key)
    }

    /// Park a line as most-recently-used; re-parking refreshes its
    /// position and size.
    pub fn touch(&self, key: LineKey, bytes: u64) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        if let Some(pos) = state.entries.iter().position(|(k, _)| *k == key) {
            let (_, old) = state.entries.remove(pos);
            state.size -= old;
        }
        state.entries.push((key, bytes));
        state.size += bytes;
    }

    /// Remove a line that is being re-pinned. Returns false if it was not
    /// parked.
    pub fn remove(&self, key: &LineKey) -> bool {
        let mut state = self.state.lock();
        match state.entries.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                let (_, bytes) = state.entries.remove(pos);
                state.size -= bytes;
                true
            }
            None => false,
        }
    }

    /// Grow the accounted size of a parked line.
    pub fn inc_size(&self, key: &LineKey, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 += bytes;
            state.size += bytes;
        }
    }

    /// Shrink the accounted size of a parked line.
    pub fn dec_size(&self, key: &LineKey, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|(k, _)| k == key) {
            assert!(entry.1 >= bytes, "line shrunk below zero");
            entry.1 -= bytes;
            state.size -= bytes;
        }
    }

    /// Pop oldest entries until the accounted size is at most `target`.
    /// Returns the victims for the owner to free.
    pub fn free_to_size(&self, target: u64) -> Vec<LineKey> {
        let mut state = self.state.lock();
        let mut victims = Vec::new();
        while state.size > target && !state.entries.is_empty() {
            let (key, bytes) = state.entries.remove(0);
            state.size -= bytes;
            victims.push(key);
        }
        victims
    }

    /// Evict down to the configured budget.
    pub fn free_maybe(&self) -> Vec<LineKey> {
        self.free_to_size(self.max_size)
    }

    /// Evict everything.
    pub fn discard(&self) -> Vec<LineKey> {
        self.free_to_size(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
