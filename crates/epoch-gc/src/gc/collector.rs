//! One full stop-the-world collection.
//!
//! The cycle runs on the GC thread:
//!
//! 1. request suspension and wait until every mutator is parked, native, or
//!    marking its own stack
//! 2. prepare the heap (pools to unswept, caches invalidated) and start the
//!    epoch
//! 3. collect global roots and the shadow stacks of non-marking mutators
//! 4. mark, serially or together with self-marking mutators
//! 5. wait for every mutator to park, then sweep side records
//! 6. resume mutators and sweep heap pages
//! 7. finish the epoch, feed the scheduler and hand finalizers off
//!
//! Cycles never overlap: the GC thread runs them one after another.

use std::sync::Arc;
use std::time::Instant;

use super::mark::{mark, MarkQueue, MarkSession, MarkStats};
use super::state::{Epoch, GcState};
use crate::alloc::Heap;
use crate::extra::FinalizerQueue;
use crate::finalizer::FinalizerProcessor;
use crate::metrics::{self, GcHistory, GcStats, GlobalMetrics, PhaseTimer};
use crate::object::ObjRef;
use crate::roots::GlobalRoots;
use crate::scheduler::GcScheduler;
use crate::thread::ThreadRegistry;
use crate::tracing::{log_phase_end, log_phase_start, trace_gc_collection, trace_phase, GcPhase};

/// Who marks from a mutator's shadow stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarkingBehavior {
    /// Runnable mutators mark their own stacks in parallel with the GC thread.
    #[default]
    MarkOwnStack,
    /// The GC thread scans every stack and marks alone.
    DoNotMark,
}

/// Everything a cycle touches.
pub(crate) struct Collector {
    heap: Arc<Heap>,
    registry: ThreadRegistry,
    globals: GlobalRoots,
    state: Arc<GcState>,
    finalizers: FinalizerProcessor<FinalizerQueue>,
    metrics: GlobalMetrics,
    history: GcHistory,
    behavior: MarkingBehavior,
}

impl Collector {
    pub(crate) fn new(
        heap: Arc<Heap>,
        state: Arc<GcState>,
        behavior: MarkingBehavior,
        finalizer_thread_name: String,
    ) -> Self {
        let finalizers = {
            let state = Arc::clone(&state);
            FinalizerProcessor::new(finalizer_thread_name, move |epoch| state.finalized(epoch))
        };
        Self {
            heap,
            registry: ThreadRegistry::default(),
            globals: GlobalRoots::new(),
            state,
            finalizers,
            metrics: GlobalMetrics::new(),
            history: GcHistory::new(),
            behavior,
        }
    }

    pub(crate) const fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub(crate) const fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub(crate) const fn globals(&self) -> &GlobalRoots {
        &self.globals
    }

    pub(crate) const fn state(&self) -> &Arc<GcState> {
        &self.state
    }

    pub(crate) const fn finalizers(&self) -> &FinalizerProcessor<FinalizerQueue> {
        &self.finalizers
    }

    pub(crate) const fn metrics(&self) -> &GlobalMetrics {
        &self.metrics
    }

    pub(crate) const fn history(&self) -> &GcHistory {
        &self.history
    }

    /// Runs collection `epoch` to completion.
    pub(crate) fn perform_full_gc(&self, epoch: Epoch, scheduler: &GcScheduler) -> GcStats {
        let _gc_span = trace_gc_collection(epoch);
        let cycle_start = Instant::now();
        let self_marking = self.behavior == MarkingBehavior::MarkOwnStack;
        let mut timer = PhaseTimer::new();

        {
            let _span = trace_phase(GcPhase::Suspend);
            log_phase_start(GcPhase::Suspend, self.heap.total_bytes());
            timer.start();
            self.registry.request_suspension(self_marking);
            self.registry.wait_ready_to_mark();
            timer.end_suspend();
            log_phase_end(GcPhase::Suspend, 0);
        }
        let pause_start = Instant::now();
        // Nobody allocates from here until resume.
        let heap_bytes_before = self.heap.total_bytes();

        self.heap.prepare_for_gc();
        self.state.start(epoch);
        scheduler.on_gc_started();

        let mark_stats = Arc::new(MarkStats::default());
        timer.start();
        let (roots, markers) = {
            let _span = trace_phase(GcPhase::RootSet);
            log_phase_start(GcPhase::RootSet, heap_bytes_before);
            let collected = self.collect_roots(&mark_stats);
            log_phase_end(GcPhase::RootSet, 0);
            collected
        };
        {
            let _span = trace_phase(GcPhase::Mark);
            log_phase_start(GcPhase::Mark, heap_bytes_before);
            if self_marking && markers > 0 {
                let session = Arc::new(MarkSession::new(1 + markers, Arc::clone(&mark_stats)));
                self.registry.publish_session(Arc::clone(&session));
                session.participate(&roots);
            } else {
                mark(&mut MarkQueue::new(), roots, &mark_stats);
            }
            self.registry.wait_suspended();
            timer.end_mark();
            log_phase_end(GcPhase::Mark, 0);
            tracing::debug!(
                objects = mark_stats.objects(),
                bytes = mark_stats.bytes(),
                markers,
                "mark_complete"
            );
        }

        timer.start();
        let extra = {
            let _span = trace_phase(GcPhase::SweepExtra);
            log_phase_start(GcPhase::SweepExtra, heap_bytes_before);
            let scope = self.heap.sweep_extra_objects();
            log_phase_end(GcPhase::SweepExtra, scope.swept_bytes);
            scope
        };
        timer.end_sweep();

        self.registry.resume();
        let pause = pause_start.elapsed();

        timer.start();
        let swept = {
            let _span = trace_phase(GcPhase::Sweep);
            log_phase_start(GcPhase::Sweep, heap_bytes_before);
            let scope = self.heap.sweep();
            log_phase_end(GcPhase::Sweep, scope.swept_bytes);
            scope
        };
        timer.end_sweep();

        let stats = GcStats {
            epoch: epoch.0,
            duration: cycle_start.elapsed(),
            pause,
            suspend_duration: timer.suspend,
            mark_duration: timer.mark,
            sweep_duration: timer.sweep,
            stack_roots: mark_stats.stack_roots(),
            global_roots: mark_stats.global_roots(),
            marked_objects: mark_stats.objects(),
            marked_bytes: mark_stats.bytes(),
            swept_objects: swept.swept_objects,
            swept_bytes: swept.swept_bytes,
            kept_objects: swept.kept_objects,
            kept_bytes: swept.kept_bytes,
            finalizers_queued: extra.finalizer_queue.len(),
            heap_bytes_before,
            heap_bytes_after: self.heap.total_bytes(),
        };
        metrics::record(&self.metrics, &self.history, stats);

        self.state.finish(epoch);
        scheduler.on_gc_finished(mark_stats.bytes());
        tracing::info!(
            epoch = epoch.0,
            pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX),
            swept_bytes = stats.swept_bytes,
            kept_bytes = stats.kept_bytes,
            finalizers = stats.finalizers_queued,
            "gc_complete"
        );

        self.finalizers.schedule_tasks(extra.finalizer_queue, epoch);
        stats
    }

    /// Gathers global roots and the stacks nobody else will mark.
    ///
    /// Returns the roots and the number of mutators marking themselves.
    fn collect_roots(&self, stats: &MarkStats) -> (Vec<ObjRef>, usize) {
        let mut roots = self.globals.snapshot();
        stats.add_global_roots(roots.len());

        let mut markers = 0;
        for thread in self.registry.snapshot() {
            if thread.is_marking() {
                markers += 1;
                continue;
            }
            let before = roots.len();
            roots.extend(thread.roots.lock().iter());
            stats.add_stack_roots(roots.len() - before);
        }
        tracing::trace!(
            global = stats.global_roots(),
            stack = stats.stack_roots(),
            markers,
            "roots_collected"
        );
        (roots, markers)
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("heap", &self.heap)
            .field("mutators", &self.registry.len())
            .field("global_roots", &self.globals.len())
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ThreadAllocator;
    use crate::object::{TypeInfo, CELL_SIZE};
    use crate::scheduler::config::SchedulerConfig;
    use crate::scheduler::SchedulerKind;

    static PAIR: TypeInfo = TypeInfo::object("Pair", 2 * CELL_SIZE, 2);

    fn collector(behavior: MarkingBehavior) -> (Collector, GcScheduler) {
        let state = Arc::new(GcState::new());
        let scheduler =
            GcScheduler::new(SchedulerKind::Manual, SchedulerConfig::default(), Arc::clone(&state), 1).unwrap();
        let collector = Collector::new(Arc::new(Heap::new(None)), state, behavior, "test-finalizer".into());
        (collector, scheduler)
    }

    #[test]
    fn test_global_roots_keep_their_graph() {
        let (collector, scheduler) = collector(MarkingBehavior::DoNotMark);
        let mut allocator = ThreadAllocator::new(Arc::clone(collector.heap()));
        let head = allocator.allocate(&PAIR, 0).unwrap();
        let tail = allocator.allocate(&PAIR, 0).unwrap();
        head.store_ref(0, Some(tail));
        for _ in 0..10 {
            allocator.allocate(&PAIR, 0).unwrap();
        }
        let root = collector.globals().add(head);

        let epoch = collector.state().schedule();
        let stats = collector.perform_full_gc(epoch, &scheduler);
        assert_eq!(stats.global_roots, 1);
        assert_eq!(stats.marked_objects, 2);
        assert_eq!(stats.swept_objects, 10);
        assert_eq!(collector.heap().object_count(), 2);
        assert_eq!(collector.state().finished_epoch(), epoch);
        assert_eq!(head.load_ref(0), Some(tail));

        collector.globals().remove(root);
        let epoch = collector.state().schedule();
        let stats = collector.perform_full_gc(epoch, &scheduler);
        assert_eq!(stats.swept_objects, 2);
        assert_eq!(collector.heap().object_count(), 0);
        assert_eq!(collector.metrics().total_collections(), 2);
        assert_eq!(collector.history().last().map(|s| s.epoch), Some(epoch.0));
    }

    #[test]
    fn test_native_mutator_stack_is_scanned_by_collector() {
        let (collector, scheduler) = collector(MarkingBehavior::MarkOwnStack);
        let mut allocator = ThreadAllocator::new(Arc::clone(collector.heap()));
        let kept = allocator.allocate(&PAIR, 0).unwrap();
        allocator.allocate(&PAIR, 0).unwrap();

        let data = collector.registry().register();
        data.roots.lock().push(Some(kept));
        let epoch = collector.state().schedule();
        let stats = collector.perform_full_gc(epoch, &scheduler);
        assert_eq!(stats.stack_roots, 1);
        assert_eq!(stats.swept_objects, 1);
        assert!(!kept.gc_data().is_marked());
        collector.registry().unregister(&data);
    }
}
