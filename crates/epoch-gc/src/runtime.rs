//! The runtime: one heap, one GC thread, one scheduler.
//!
//! Several runtimes can coexist in a process; nothing is global.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::alloc::Heap;
use crate::config::RuntimeConfig;
use crate::error::GcError;
use crate::gc::collector::Collector;
use crate::gc::state::{Epoch, GcState};
use crate::metrics::{GcHistory, GlobalMetrics};
use crate::mutator::Mutator;
use crate::object::ObjRef;
use crate::roots::GlobalRootId;
use crate::scheduler::GcScheduler;

/// State shared by the runtime handle, its mutators and the GC thread.
#[derive(Debug)]
pub(crate) struct RuntimeInner {
    pub(crate) scheduler: GcScheduler,
    pub(crate) collector: Collector,
}

/// A garbage-collected runtime.
///
/// Dropping the runtime shuts it down. Mutators hold the shared state alive,
/// but no collection runs once the runtime is gone.
#[derive(Debug)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Builds the runtime and starts its GC thread.
    ///
    /// # Errors
    ///
    /// Fails if the GC or timer thread cannot be spawned.
    pub fn new(config: RuntimeConfig) -> Result<Self, GcError> {
        let state = Arc::new(GcState::new());
        let scheduler = GcScheduler::new(
            config.scheduler,
            config.scheduler_config,
            Arc::clone(&state),
            config.aggressive_safepoint_interval.max(1),
        )?;
        let collector = Collector::new(
            Arc::new(Heap::new(config.heap_limit)),
            state,
            config.marking,
            config.finalizer_thread_name,
        );
        let inner = Arc::new(RuntimeInner { scheduler, collector });

        let gc_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(config.gc_thread_name)
                .spawn(move || gc_thread_main(&inner))
                .map_err(GcError::ThreadSpawn)?
        };
        tracing::debug!(
            scheduler = ?inner.scheduler.kind(),
            heap_limit = ?config.heap_limit,
            "runtime_started"
        );
        Ok(Self {
            inner,
            gc_thread: Mutex::new(Some(gc_thread)),
        })
    }

    /// Attaches the calling thread as a mutator.
    ///
    /// The returned handle is bound to this thread and starts runnable.
    #[must_use]
    pub fn attach_mutator(&self) -> Mutator {
        Mutator::attach(Arc::clone(&self.inner))
    }

    /// Number of attached mutators.
    #[must_use]
    pub fn mutator_count(&self) -> usize {
        self.inner.collector.registry().len()
    }

    #[must_use]
    pub fn scheduler(&self) -> &GcScheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn state(&self) -> &GcState {
        self.inner.collector.state()
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.inner.collector.heap()
    }

    /// Requests a collection without waiting.
    pub fn schedule_gc(&self) -> Epoch {
        self.inner.scheduler.schedule()
    }

    /// Requests a collection and waits for it to finish.
    ///
    /// Must not be called from an attached thread; use
    /// [`Mutator::schedule_and_wait_full_gc`] there.
    pub fn schedule_and_wait_full_gc(&self) -> Epoch {
        let epoch = self.schedule_gc();
        self.state().wait_epoch_finished(epoch);
        epoch
    }

    /// Requests a collection and waits for its finalizers.
    ///
    /// Must not be called from an attached thread.
    pub fn schedule_and_wait_full_gc_with_finalizers(&self) -> Epoch {
        let epoch = self.schedule_gc();
        self.state().wait_epoch_finalized(epoch);
        epoch
    }

    /// Registers a root that outlives any mutator frame.
    pub fn add_global_root(&self, root: ObjRef) -> GlobalRootId {
        self.inner.collector.globals().add(root)
    }

    /// Unregisters a global root, returning the object it held.
    pub fn remove_global_root(&self, id: GlobalRootId) -> Option<ObjRef> {
        self.inner.collector.globals().remove(id)
    }

    #[must_use]
    pub fn global_root(&self, id: GlobalRootId) -> Option<ObjRef> {
        self.inner.collector.globals().get(id)
    }

    /// Cumulative counters across all collections.
    #[must_use]
    pub fn metrics(&self) -> &GlobalMetrics {
        self.inner.collector.metrics()
    }

    /// The most recent collections.
    #[must_use]
    pub fn history(&self) -> &GcHistory {
        self.inner.collector.history()
    }

    /// Live objects as of the last sweep plus everything allocated since.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.heap().object_count()
    }

    /// Bytes of [`object_count`](Self::object_count) objects.
    #[must_use]
    pub fn total_heap_bytes(&self) -> usize {
        self.heap().total_bytes()
    }

    /// Side records of finalizable objects.
    #[must_use]
    pub fn extra_object_count(&self) -> usize {
        self.heap().extra_object_count()
    }

    /// Bytes mapped for heap pages.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.heap().committed_bytes()
    }

    /// Stops the timer, lets a running epoch finish, stops the GC thread and
    /// drains pending finalizers. Idempotent.
    ///
    /// Mutators still attached must be parked, native, or reaching
    /// safepoints, or a running epoch never finishes.
    pub fn shutdown(&self) {
        let Some(handle) = self.gc_thread.lock().take() else {
            return;
        };
        self.inner.scheduler.shutdown();
        self.state().shutdown();
        if handle.join().is_err() {
            tracing::error!("gc thread panicked");
        }
        self.inner.collector.finalizers().stop();
        tracing::debug!(
            finished = self.state().finished_epoch().0,
            finalized = self.state().finalized_epoch().0,
            "runtime_stopped"
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn gc_thread_main(inner: &RuntimeInner) {
    tracing::debug!("gc_thread_started");
    let state = inner.collector.state();
    while let Some(epoch) = state.wait_scheduled() {
        inner.collector.perform_full_gc(epoch, &inner.scheduler);
    }
    tracing::debug!("gc_thread_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{TypeInfo, CELL_SIZE};
    use crate::scheduler::SchedulerKind;

    static CELL: TypeInfo = TypeInfo::object("Cell", CELL_SIZE, 1);

    #[test]
    fn test_rooted_objects_survive_explicit_gc() {
        let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Manual)).unwrap();
        let mut mutator = runtime.attach_mutator();
        let kept = mutator.allocate_object(&CELL);
        mutator.push_root(Some(kept));
        for _ in 0..100 {
            mutator.allocate_object(&CELL);
        }

        let epoch = mutator.schedule_and_wait_full_gc();
        assert_eq!(epoch, Epoch(1));
        assert_eq!(runtime.object_count(), 1);
        let stats = runtime.history().last().unwrap();
        assert_eq!(stats.stack_roots, 1);
        assert_eq!(stats.swept_objects, 100);

        mutator.pop_root();
        mutator.schedule_and_wait_full_gc();
        assert_eq!(runtime.object_count(), 0);
        drop(mutator);
        runtime.shutdown();
        assert!(runtime.state().is_shutdown());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        runtime.shutdown();
        runtime.shutdown();
        assert_eq!(runtime.mutator_count(), 0);
    }
}
