//! Allocation budget between collections.
//!
//! Mutators count down a shared budget that starts at the weak target. Once
//! it goes negative the weak boundary is crossed; once it drops below
//! `weak_target - target` the heap has grown past the target itself and the
//! strong boundary is crossed.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use super::config::SchedulerConfig;

/// Classification of a negative remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Budget not exhausted.
    None,
    /// Past the trigger point but below the target.
    Weak,
    /// Past the target.
    Strong,
}

#[derive(Debug)]
pub struct HeapGrowthController {
    config: Mutex<SchedulerConfig>,
    bytes_left: AtomicI64,
    strong_boundary: AtomicI64,
}

impl HeapGrowthController {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let weak_target = config.weak_target_heap_bytes();
        Self {
            bytes_left: AtomicI64::new(weak_target),
            strong_boundary: AtomicI64::new(weak_target - target_bytes(&config)),
            config: Mutex::new(config),
        }
    }

    /// Charges `bytes` to the budget. Returns what is left afterwards.
    #[allow(clippy::cast_possible_wrap)]
    pub fn on_allocated(&self, bytes: usize) -> i64 {
        let bytes = bytes as i64;
        self.bytes_left.fetch_sub(bytes, Ordering::Relaxed) - bytes
    }

    /// Classifies a value returned by [`on_allocated`](Self::on_allocated).
    #[must_use]
    pub fn compute_boundary(&self, remaining: i64) -> Boundary {
        if remaining >= 0 {
            Boundary::None
        } else if remaining >= self.strong_boundary.load(Ordering::Relaxed) {
            Boundary::Weak
        } else {
            Boundary::Strong
        }
    }

    /// Retunes the target from the live set and replenishes the budget.
    ///
    /// Called on the collector thread after sweep.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn on_gc_done(&self, alive_bytes: usize) {
        let mut config = self.config.lock();
        if config.auto_tune {
            let target = alive_bytes as f64 / config.target_heap_utilization;
            if !target.is_finite() {
                tracing::warn!(alive_bytes, utilization = config.target_heap_utilization, "heap target not finite, keeping previous");
                return;
            }
            let target = target.clamp(config.min_heap_bytes as f64, config.max_heap_bytes as f64);
            config.target_heap_bytes = target as u64;
        }
        let weak_target = config.weak_target_heap_bytes();
        self.strong_boundary
            .store(weak_target - target_bytes(&config), Ordering::Relaxed);
        self.bytes_left.fetch_add(weak_target, Ordering::Relaxed);
        tracing::debug!(
            alive_bytes,
            target = config.target_heap_bytes,
            bytes_left = self.bytes_left.load(Ordering::Relaxed),
            "heap_target_updated"
        );
    }

    /// Replaces the configuration. Called during the pause.
    pub fn set_config(&self, config: SchedulerConfig) {
        *self.config.lock() = config;
    }

    /// Snapshot of the configuration, including any tuned target.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        *self.config.lock()
    }

    /// Remaining budget.
    #[must_use]
    pub fn bytes_left(&self) -> i64 {
        self.bytes_left.load(Ordering::Relaxed)
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn target_bytes(config: &SchedulerConfig) -> i64 {
    if config.target_heap_bytes > i64::MAX as u64 {
        i64::MAX
    } else {
        config.target_heap_bytes as i64
    }
}
