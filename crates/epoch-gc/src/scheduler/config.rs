//! Scheduler tuning knobs.

use std::time::Duration;

/// Live-tunable scheduler configuration.
///
/// The scheduler keeps one copy behind a mutex; policies pick up a snapshot
/// at the start of every collection, so changes apply from the next cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Recompute the target from the live set after each collection.
    pub auto_tune: bool,
    /// Collect at least this often, regardless of allocation.
    pub regular_gc_interval: Duration,
    /// Heap size the scheduler aims for.
    pub target_heap_bytes: u64,
    /// Fraction of the target the live set should occupy when tuning.
    pub target_heap_utilization: f64,
    /// Lower bound for the tuned target.
    pub min_heap_bytes: u64,
    /// Upper bound for the tuned target.
    pub max_heap_bytes: u64,
    /// Fraction of the target at which an asynchronous collection is requested.
    pub heap_trigger_coefficient: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_tune: true,
            regular_gc_interval: Duration::from_secs(10),
            target_heap_bytes: 10 * 1024 * 1024,
            target_heap_utilization: 0.5,
            min_heap_bytes: 5 * 1024 * 1024,
            max_heap_bytes: u64::MAX,
            heap_trigger_coefficient: 0.9,
        }
    }
}

impl SchedulerConfig {
    /// Configuration used by the aggressive policy: a small fixed target.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            auto_tune: false,
            target_heap_bytes: 1024 * 1024,
            min_heap_bytes: 1024 * 1024,
            ..Self::default()
        }
    }

    /// Heap size at which the budget is first crossed.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn weak_target_heap_bytes(&self) -> i64 {
        (self.target_heap_bytes as f64 * self.heap_trigger_coefficient) as i64
    }

    /// Copies the fields a policy tunes on its own.
    pub const fn merge_autotuned(&mut self, tuned: &Self) {
        if self.auto_tune {
            self.target_heap_bytes = tuned.target_heap_bytes;
        }
    }

    #[must_use]
    pub const fn with_target_heap_bytes(mut self, bytes: u64) -> Self {
        self.target_heap_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_min_heap_bytes(mut self, bytes: u64) -> Self {
        self.min_heap_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_heap_bytes(mut self, bytes: u64) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_target_heap_utilization(mut self, utilization: f64) -> Self {
        self.target_heap_utilization = utilization;
        self
    }

    #[must_use]
    pub const fn with_auto_tune(mut self, enabled: bool) -> Self {
        self.auto_tune = enabled;
        self
    }

    #[must_use]
    pub const fn with_regular_gc_interval(mut self, interval: Duration) -> Self {
        self.regular_gc_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_heap_trigger_coefficient(mut self, coefficient: f64) -> Self {
        self.heap_trigger_coefficient = coefficient;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_target() {
        let config = SchedulerConfig::default().with_target_heap_bytes(1000);
        assert_eq!(config.weak_target_heap_bytes(), 900);
    }

    #[test]
    fn test_merge_respects_auto_tune() {
        let tuned = SchedulerConfig::default().with_target_heap_bytes(42);
        let mut on = SchedulerConfig::default();
        on.merge_autotuned(&tuned);
        assert_eq!(on.target_heap_bytes, 42);

        let mut off = SchedulerConfig::default().with_auto_tune(false);
        off.merge_autotuned(&tuned);
        assert_eq!(off.target_heap_bytes, SchedulerConfig::default().target_heap_bytes);
    }
}
