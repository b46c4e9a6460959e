//! Inactivity watchdog shared by the keep-alive loops.

use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive silent keep-alive intervals tolerated before a link is dead.
pub const DEFAULT_MISSES: u32 = 3;

/// Counts keep-alive intervals that passed without inbound traffic.
///
/// `feed` is called by the receive loop on every read, `tick` by the
/// keep-alive timer. `tick` reports expiry once the allowance is used up.
#[derive(Debug)]
pub struct Watchdog {
    remaining: AtomicU32,
    allowance: u32,
}

impl Watchdog {
    pub fn new(allowance: u32) -> Self {
        let allowance = allowance.max(1);
        Self {
            remaining: AtomicU32::new(allowance),
            allowance,
        }
    }

    pub fn feed(&self) {
        self.remaining.store(self.allowance, Ordering::SeqCst);
    }

    /// Returns `true` when this tick exhausted the allowance.
    pub fn tick(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous <= 1
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_MISSES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_misses_expire() {
        let dog = Watchdog::default();
        assert!(!dog.tick());
        assert!(!dog.tick());
        assert!(dog.tick());
    }

    #[test]
    fn test_feed_resets() {
        let dog = Watchdog::default();
        dog.tick();
        dog.tick();
        dog.feed();
        assert_eq!(dog.remaining(), DEFAULT_MISSES);
        assert!(!dog.tick());
    }
}
