//! Runtime construction options.

use crate::gc::MarkingBehavior;
use crate::scheduler::config::SchedulerConfig;
use crate::scheduler::SchedulerKind;

/// Options fixed when a [`Runtime`](crate::Runtime) is built.
///
/// Scheduler tuning can still change afterwards through
/// [`GcScheduler`](crate::GcScheduler).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Policy deciding when to collect.
    pub scheduler: SchedulerKind,
    /// Initial scheduler tuning. Ignored by the aggressive policy.
    pub scheduler_config: SchedulerConfig,
    /// Whether mutators mark their own stacks.
    pub marking: MarkingBehavior,
    /// Hard cap on committed page bytes.
    pub heap_limit: Option<usize>,
    /// The aggressive policy collects every this many safepoints.
    pub aggressive_safepoint_interval: usize,
    /// Name of the GC thread.
    pub gc_thread_name: String,
    /// Name of the finalizer thread.
    pub finalizer_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            scheduler_config: SchedulerConfig::default(),
            marking: MarkingBehavior::default(),
            heap_limit: None,
            aggressive_safepoint_interval: 10_000,
            gc_thread_name: "epoch-gc".to_string(),
            finalizer_thread_name: "epoch-gc finalizer".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Default options with the given scheduler.
    #[must_use]
    pub fn new(scheduler: SchedulerKind) -> Self {
        Self {
            scheduler,
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub const fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    #[must_use]
    pub const fn with_marking(mut self, marking: MarkingBehavior) -> Self {
        self.marking = marking;
        self
    }

    #[must_use]
    pub const fn with_heap_limit(mut self, bytes: usize) -> Self {
        self.heap_limit = Some(bytes);
        self
    }

    /// Sets the aggressive policy's safepoint interval; zero is treated as one.
    #[must_use]
    pub fn with_aggressive_safepoint_interval(mut self, interval: usize) -> Self {
        self.aggressive_safepoint_interval = interval.max(1);
        self
    }

    #[must_use]
    pub fn with_gc_thread_name(mut self, name: impl Into<String>) -> Self {
        self.gc_thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_finalizer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.finalizer_thread_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::new(SchedulerKind::Manual)
            .with_heap_limit(1 << 20)
            .with_marking(MarkingBehavior::DoNotMark)
            .with_aggressive_safepoint_interval(0)
            .with_gc_thread_name("gc");
        assert_eq!(config.scheduler, SchedulerKind::Manual);
        assert_eq!(config.heap_limit, Some(1 << 20));
        assert_eq!(config.aggressive_safepoint_interval, 1);
        assert_eq!(config.gc_thread_name, "gc");
        assert_eq!(config.finalizer_thread_name, "epoch-gc finalizer");
    }
}
