//! Increasing clock for presence last-write-wins
//!
//! Presence records do not need vector clocks: they are ephemeral and a
//! per-user monotonically increasing counter is enough to order cursor
//! updates, which arrive at high frequency.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe monotonically increasing clock
#[derive(Debug)]
pub struct PresenceClock {
    value: AtomicU64,
}

impl PresenceClock {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment and return the new value
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Raise to at least `other`; keeps local ticks ahead of anything
    /// already seen from remotes
    pub fn observe(&self, other: u64) {
        self.value.fetch_max(other, Ordering::SeqCst);
    }
}

impl Default for PresenceClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PresenceClock {
    fn clone(&self) -> Self {
        Self {
            value: AtomicU64::new(self.get()),
        }
    }
}
