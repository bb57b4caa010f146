//! Stress policy that collects as often as it can.

use std::sync::Arc;

use super::config::SchedulerConfig;
use super::heap_growth::HeapGrowthController;
use super::safepoint::SafePointTracker;
use super::{SchedulerPolicy, Trigger};
use crate::gc::state::GcState;

/// Collects whenever the budget runs out or every N safepoints, and always
/// makes the triggering mutator wait for the cycle to finish.
///
/// Waiting stops at `Finished`; waiting for finalizers could recurse into
/// the collector from a finalizer.
#[derive(Debug)]
pub struct AggressivePolicy {
    state: Arc<GcState>,
    growth: HeapGrowthController,
    safepoints: SafePointTracker,
}

impl AggressivePolicy {
    #[must_use]
    pub fn new(config: SchedulerConfig, state: Arc<GcState>, safepoint_interval: usize) -> Self {
        Self {
            state,
            growth: HeapGrowthController::new(config),
            safepoints: SafePointTracker::new(safepoint_interval),
        }
    }

    fn schedule_and_wait(&self, reason: &'static str) -> Trigger {
        let epoch = self.state.schedule();
        tracing::trace!(epoch = epoch.0, reason, "gc_forced_by_aggressive_policy");
        Trigger::WaitFinished(epoch)
    }
}

impl SchedulerPolicy for AggressivePolicy {
    fn on_allocation(&self, bytes: usize) -> Trigger {
        if self.growth.on_allocated(bytes) < 0 {
            self.schedule_and_wait("allocation")
        } else if self.safepoints.register_safe_point() {
            self.schedule_and_wait("safepoint")
        } else {
            Trigger::None
        }
    }

    fn on_safe_point(&self) -> Trigger {
        if self.safepoints.register_safe_point() {
            self.schedule_and_wait("safepoint")
        } else {
            Trigger::None
        }
    }

    fn on_oom(&self, requested: usize) -> Trigger {
        tracing::debug!(requested, "gc_forced_by_oom");
        self.schedule_and_wait("oom")
    }

    fn on_gc_started(&self, config: &SchedulerConfig) {
        self.growth.set_config(*config);
    }

    fn on_gc_finished(&self, alive_bytes: usize, config: &mut SchedulerConfig) {
        self.growth.on_gc_done(alive_bytes);
        config.merge_autotuned(&self.growth.config());
    }

    fn heap_growth(&self) -> Option<&HeapGrowthController> {
        Some(&self.growth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::state::Epoch;

    #[test]
    fn test_every_nth_safepoint_waits() {
        let state = Arc::new(GcState::new());
        let policy = AggressivePolicy::new(SchedulerConfig::aggressive(), Arc::clone(&state), 2);
        assert_eq!(policy.on_safe_point(), Trigger::None);
        assert_eq!(policy.on_safe_point(), Trigger::WaitFinished(Epoch(1)));
    }

    #[test]
    fn test_budget_exhaustion_waits() {
        let state = Arc::new(GcState::new());
        let policy = AggressivePolicy::new(
            SchedulerConfig::aggressive().with_target_heap_bytes(100),
            Arc::clone(&state),
            usize::MAX,
        );
        assert_eq!(policy.on_allocation(80), Trigger::None);
        assert_eq!(policy.on_allocation(80), Trigger::WaitFinished(Epoch(1)));
    }
}
