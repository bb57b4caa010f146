//! Safepoint counting for stress scheduling.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Fires once every `interval` safepoints, counted across all mutators.
#[derive(Debug)]
pub struct SafePointTracker {
    interval: usize,
    seen: AtomicUsize,
}

impl SafePointTracker {
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    #[must_use]
    pub const fn new(interval: usize) -> Self {
        assert!(interval > 0, "safepoint interval must be positive");
        Self {
            interval,
            seen: AtomicUsize::new(0),
        }
    }

    /// Counts one safepoint. Returns `true` on every `interval`-th call.
    pub fn register_safe_point(&self) -> bool {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        seen % self.interval == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_every_interval() {
        let tracker = SafePointTracker::new(3);
        let fired: Vec<bool> = (0..7).map(|_| tracker.register_safe_point()).collect();
        assert_eq!(fired, [false, false, true, false, false, true, false]);
    }
}
