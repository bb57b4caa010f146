//! Collection scheduling.
//!
//! A [`GcScheduler`] owns the live [`SchedulerConfig`] and one
//! [`SchedulerPolicy`] chosen at startup. Mutators report allocations,
//! safepoints and allocation failures to it; the policy answers with a
//! [`Trigger`] telling the mutator whether to carry on or to wait for an
//! epoch. Waiting itself is done by the caller in the native state.

pub mod adaptive;
pub mod aggressive;
pub mod config;
pub mod heap_growth;
pub mod manual;
pub mod pacer;
pub mod safepoint;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use self::adaptive::AdaptivePolicy;
use self::aggressive::AggressivePolicy;
use self::config::SchedulerConfig;
use self::heap_growth::HeapGrowthController;
use self::manual::ManualPolicy;
use crate::error::GcError;
use crate::gc::state::{Epoch, GcState};

/// Which policy drives collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Only explicit requests.
    Manual,
    /// Allocation budget plus a regular-interval timer.
    #[default]
    Adaptive,
    /// Tight budget plus every N safepoints, always blocking.
    Aggressive,
}

/// A policy's answer to a mutator event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing to do.
    None,
    /// An epoch was requested; the mutator may continue.
    Scheduled(Epoch),
    /// The mutator must wait until the epoch has finished.
    WaitFinished(Epoch),
}

/// Decides when to collect.
///
/// Mutator-facing hooks must not block: they request epochs through
/// [`GcState`] and return a [`Trigger`]. The GC hooks run on the collector
/// thread during and right after the pause.
pub trait SchedulerPolicy: Send + Sync + std::fmt::Debug {
    /// Called after every allocation with its size in bytes.
    fn on_allocation(&self, bytes: usize) -> Trigger;

    /// Called at function prologues and loop back-edges.
    fn on_safe_point(&self) -> Trigger {
        Trigger::None
    }

    /// Called when an allocation of `requested` bytes could not be served.
    fn on_oom(&self, requested: usize) -> Trigger;

    /// Called during the pause with a snapshot of the live configuration.
    fn on_gc_started(&self, config: &SchedulerConfig);

    /// Called after sweep with the marked bytes; may tune `config`.
    fn on_gc_finished(&self, alive_bytes: usize, config: &mut SchedulerConfig);

    /// The allocation budget, for policies that keep one.
    fn heap_growth(&self) -> Option<&HeapGrowthController> {
        None
    }

    /// Stops any helper threads.
    fn shutdown(&self) {}
}

/// Live configuration plus the selected policy.
#[derive(Debug)]
pub struct GcScheduler {
    kind: SchedulerKind,
    config: Mutex<SchedulerConfig>,
    state: Arc<GcState>,
    policy: Box<dyn SchedulerPolicy>,
}

impl GcScheduler {
    /// Builds the scheduler for `kind`.
    ///
    /// The aggressive policy replaces `config` with
    /// [`SchedulerConfig::aggressive`].
    ///
    /// # Errors
    ///
    /// Fails if the adaptive policy's timer thread cannot be spawned.
    pub fn new(
        kind: SchedulerKind,
        config: SchedulerConfig,
        state: Arc<GcState>,
        safepoint_interval: usize,
    ) -> Result<Self, GcError> {
        let (config, policy): (SchedulerConfig, Box<dyn SchedulerPolicy>) = match kind {
            SchedulerKind::Manual => (config, Box::new(ManualPolicy)),
            SchedulerKind::Adaptive => (
                config,
                Box::new(AdaptivePolicy::new(config, Arc::clone(&state))?),
            ),
            SchedulerKind::Aggressive => {
                let config = SchedulerConfig::aggressive();
                (
                    config,
                    Box::new(AggressivePolicy::new(config, Arc::clone(&state), safepoint_interval)),
                )
            }
        };
        tracing::debug!(?kind, "gc_scheduler_initialized");
        Ok(Self {
            kind,
            config: Mutex::new(config),
            state,
            policy,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> SchedulerKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> &Arc<GcState> {
        &self.state
    }

    #[must_use]
    pub fn policy(&self) -> &dyn SchedulerPolicy {
        self.policy.as_ref()
    }

    /// Snapshot of the live configuration.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        *self.config.lock()
    }

    /// Applies `f` to the live configuration under its lock.
    ///
    /// Policies pick the change up at the start of the next collection.
    pub fn modify_config<R>(&self, f: impl FnOnce(&mut SchedulerConfig) -> R) -> R {
        f(&mut self.config.lock())
    }

    pub fn set_target_heap_bytes(&self, bytes: u64) {
        self.modify_config(|c| c.target_heap_bytes = bytes);
    }

    pub fn set_min_heap_bytes(&self, bytes: u64) {
        self.modify_config(|c| c.min_heap_bytes = bytes);
    }

    pub fn set_max_heap_bytes(&self, bytes: u64) {
        self.modify_config(|c| c.max_heap_bytes = bytes);
    }

    pub fn set_target_heap_utilization(&self, utilization: f64) {
        self.modify_config(|c| c.target_heap_utilization = utilization);
    }

    pub fn set_regular_gc_interval(&self, interval: Duration) {
        self.modify_config(|c| c.regular_gc_interval = interval);
    }

    pub fn set_auto_tune(&self, enabled: bool) {
        self.modify_config(|c| c.auto_tune = enabled);
    }

    pub fn set_heap_trigger_coefficient(&self, coefficient: f64) {
        self.modify_config(|c| c.heap_trigger_coefficient = coefficient);
    }

    /// Requests a collection without waiting.
    pub fn schedule(&self) -> Epoch {
        self.state.schedule()
    }

    pub(crate) fn on_allocation(&self, bytes: usize) -> Trigger {
        self.policy.on_allocation(bytes)
    }

    pub(crate) fn on_safe_point(&self) -> Trigger {
        self.policy.on_safe_point()
    }

    pub(crate) fn on_oom(&self, requested: usize) -> Trigger {
        self.policy.on_oom(requested)
    }

    pub(crate) fn on_gc_started(&self) {
        let config = self.config();
        self.policy.on_gc_started(&config);
    }

    pub(crate) fn on_gc_finished(&self, alive_bytes: usize) {
        let mut config = self.config.lock();
        self.policy.on_gc_finished(alive_bytes, &mut config);
    }

    pub(crate) fn shutdown(&self) {
        self.policy.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_config_applies_on_next_cycle() {
        let state = Arc::new(GcState::new());
        let scheduler = GcScheduler::new(
            SchedulerKind::Aggressive,
            SchedulerConfig::default(),
            state,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(scheduler.config().target_heap_bytes, 1024 * 1024);

        scheduler.set_target_heap_bytes(2000);
        scheduler.on_gc_started();
        let growth = scheduler.policy().heap_growth().unwrap();
        assert_eq!(growth.config().target_heap_bytes, 2000);

        scheduler.on_gc_finished(0);
        // Auto-tune is off for the aggressive policy, so the manual target stays.
        assert_eq!(scheduler.config().target_heap_bytes, 2000);
    }

    #[test]
    fn test_manual_never_triggers() {
        let state = Arc::new(GcState::new());
        let scheduler =
            GcScheduler::new(SchedulerKind::Manual, SchedulerConfig::default(), Arc::clone(&state), 1).unwrap();
        assert_eq!(scheduler.on_allocation(usize::MAX / 2), Trigger::None);
        assert_eq!(scheduler.on_safe_point(), Trigger::None);
        assert_eq!(scheduler.on_oom(1 << 20), Trigger::None);
        assert_eq!(state.scheduled_epoch(), Epoch(0));
        assert_eq!(scheduler.schedule(), Epoch(1));
    }
}
