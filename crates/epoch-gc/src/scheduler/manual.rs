//! Policy that only collects when asked to.

use super::{SchedulerPolicy, Trigger};
use crate::scheduler::config::SchedulerConfig;

/// Never triggers on its own. Allocation, safepoints and out-of-memory are
/// ignored; collections happen only through explicit scheduling.
#[derive(Debug, Default)]
pub struct ManualPolicy;

impl SchedulerPolicy for ManualPolicy {
    fn on_allocation(&self, _bytes: usize) -> Trigger {
        Trigger::None
    }

    fn on_oom(&self, requested: usize) -> Trigger {
        tracing::debug!(requested, "out of memory under manual scheduling, not collecting");
        Trigger::None
    }

    fn on_gc_started(&self, _config: &SchedulerConfig) {}

    fn on_gc_finished(&self, _alive_bytes: usize, _config: &mut SchedulerConfig) {}
}
