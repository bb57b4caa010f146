//! Budget- and timer-driven policy for production use.

use std::sync::Arc;

use parking_lot::Mutex;

use super::config::SchedulerConfig;
use super::heap_growth::{Boundary, HeapGrowthController};
use super::pacer::{RegularIntervalPacer, RepeatedTimer};
use super::{SchedulerPolicy, Trigger};
use crate::error::GcError;
use crate::gc::state::GcState;

/// Two-tier allocation trigger plus a regular-interval timer.
///
/// Crossing the weak boundary requests a collection and lets the mutator
/// continue. Crossing the strong boundary means the heap already exceeds its
/// target, so the allocating mutator waits for the cycle to finish.
#[derive(Debug)]
pub struct AdaptivePolicy {
    state: Arc<GcState>,
    growth: HeapGrowthController,
    pacer: Arc<Mutex<RegularIntervalPacer>>,
    timer: RepeatedTimer,
}

impl AdaptivePolicy {
    /// Creates the policy and starts its timer thread.
    ///
    /// # Errors
    ///
    /// Fails if the timer thread cannot be spawned.
    pub fn new(config: SchedulerConfig, state: Arc<GcState>) -> Result<Self, GcError> {
        let pacer = Arc::new(Mutex::new(RegularIntervalPacer::new(config.regular_gc_interval)));
        let timer = {
            let pacer = Arc::clone(&pacer);
            let state = Arc::clone(&state);
            RepeatedTimer::start("epoch-gc timer", config.regular_gc_interval, move || {
                if pacer.lock().needs_gc() {
                    let epoch = state.schedule();
                    tracing::debug!(epoch = epoch.0, "gc_scheduled_by_timer");
                }
            })?
        };
        Ok(Self {
            state,
            growth: HeapGrowthController::new(config),
            pacer,
            timer,
        })
    }
}

impl SchedulerPolicy for AdaptivePolicy {
    fn on_allocation(&self, bytes: usize) -> Trigger {
        let remaining = self.growth.on_allocated(bytes);
        match self.growth.compute_boundary(remaining) {
            Boundary::None => Trigger::None,
            Boundary::Weak => {
                let epoch = self.state.ensure_active();
                tracing::debug!(epoch = epoch.0, remaining, "gc_scheduled_by_allocation");
                Trigger::Scheduled(epoch)
            }
            Boundary::Strong => {
                let epoch = self.state.ensure_active();
                tracing::debug!(epoch = epoch.0, remaining, "gc_scheduled_by_severe_allocation");
                Trigger::WaitFinished(epoch)
            }
        }
    }

    fn on_oom(&self, requested: usize) -> Trigger {
        let epoch = self.state.schedule();
        tracing::debug!(epoch = epoch.0, requested, "gc_forced_by_oom");
        Trigger::WaitFinished(epoch)
    }

    fn on_gc_started(&self, config: &SchedulerConfig) {
        self.growth.set_config(*config);
        self.pacer.lock().set_interval(config.regular_gc_interval);
    }

    fn on_gc_finished(&self, alive_bytes: usize, config: &mut SchedulerConfig) {
        self.growth.on_gc_done(alive_bytes);
        self.pacer.lock().on_gc_done();
        config.merge_autotuned(&self.growth.config());
        self.timer.restart(config.regular_gc_interval);
    }

    fn heap_growth(&self) -> Option<&HeapGrowthController> {
        Some(&self.growth)
    }

    fn shutdown(&self) {
        self.timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::state::Epoch;
    use std::time::Duration;

    fn policy(target: u64) -> (Arc<GcState>, AdaptivePolicy) {
        let state = Arc::new(GcState::new());
        let config = SchedulerConfig::default()
            .with_target_heap_bytes(target)
            .with_min_heap_bytes(0)
            .with_regular_gc_interval(Duration::from_secs(3600));
        let policy = AdaptivePolicy::new(config, Arc::clone(&state)).unwrap();
        (state, policy)
    }

    #[test]
    fn test_weak_then_strong_boundary() {
        let (state, policy) = policy(1000);
        assert_eq!(policy.on_allocation(900), Trigger::None);
        assert_eq!(policy.on_allocation(50), Trigger::Scheduled(Epoch(1)));
        assert_eq!(policy.on_allocation(100), Trigger::WaitFinished(Epoch(1)));
        assert_eq!(state.scheduled_epoch(), Epoch(1));
        policy.shutdown();
    }

    #[test]
    fn test_gc_finished_merges_tuned_target() {
        let (_state, policy) = policy(1000);
        let mut config = SchedulerConfig::default()
            .with_target_heap_bytes(1000)
            .with_min_heap_bytes(0);
        policy.on_gc_started(&config);
        policy.on_gc_finished(200, &mut config);
        assert_eq!(config.target_heap_bytes, 400);
        policy.shutdown();
    }

    #[test]
    fn test_timer_schedules_when_interval_elapses() {
        let state = Arc::new(GcState::new());
        let config = SchedulerConfig::default().with_regular_gc_interval(Duration::from_millis(5));
        let policy = AdaptivePolicy::new(config, Arc::clone(&state)).unwrap();
        while state.scheduled_epoch() == Epoch(0) {
            std::thread::sleep(Duration::from_millis(1));
        }
        policy.shutdown();
    }
}
