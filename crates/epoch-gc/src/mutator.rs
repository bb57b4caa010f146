//! Per-thread handle for running managed code.
//!
//! A [`Mutator`] is created by [`Runtime::attach_mutator`](crate::Runtime::attach_mutator)
//! and is pinned to the thread that made it. It owns the thread's allocation
//! caches and shadow stack, polls for suspension at safepoints, and performs
//! the blocking waits the scheduler asks for in the native state.
//!
//! Allocation reports its size to the scheduler *before* memory is handed
//! out, so a collection triggered by an allocation never sees the new object
//! unrooted.

use std::alloc::{handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::alloc::ThreadAllocator;
use crate::error::GcError;
use crate::gc::state::{Epoch, GcState};
use crate::object::{ObjRef, TypeInfo, CELL_SIZE};
use crate::runtime::RuntimeInner;
use crate::scheduler::Trigger;
use crate::thread::{MutatorData, ThreadState};

/// A thread attached to a runtime.
///
/// The mutator is runnable while it exists, except inside
/// [`enter_native`](Self::enter_native). Dropping it detaches the thread.
pub struct Mutator {
    runtime: Arc<RuntimeInner>,
    data: Arc<MutatorData>,
    allocator: ThreadAllocator,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn attach(runtime: Arc<RuntimeInner>) -> Self {
        let data = runtime.collector.registry().register();
        let allocator = ThreadAllocator::new(Arc::clone(runtime.collector.heap()));
        runtime
            .collector
            .registry()
            .switch_state(&data, ThreadState::Runnable);
        Self {
            runtime,
            data,
            allocator,
            _not_send: PhantomData,
        }
    }

    /// Registry id of this mutator.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.data.id()
    }

    /// Current thread state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.data.state()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates an instance of a non-array type.
    ///
    /// Out-of-memory after a collection is fatal; see
    /// [`try_allocate_object`](Self::try_allocate_object).
    pub fn allocate_object(&mut self, ty: &'static TypeInfo) -> ObjRef {
        debug_assert!(!ty.is_array(), "array type allocated as an object");
        self.allocate_or_abort(ty, 0)
    }

    /// Allocates an array of `len` elements.
    pub fn allocate_array(&mut self, ty: &'static TypeInfo, len: usize) -> ObjRef {
        debug_assert!(ty.is_array(), "object type allocated as an array");
        self.allocate_or_abort(ty, len)
    }

    /// Allocates an instance of a non-array type.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] if memory stays exhausted after the
    /// policy's collection, or [`GcError::InvalidAllocation`] for a malformed
    /// request.
    pub fn try_allocate_object(&mut self, ty: &'static TypeInfo) -> Result<ObjRef, GcError> {
        if ty.is_array() {
            return Err(GcError::InvalidAllocation("array type allocated as an object"));
        }
        self.try_allocate(ty, 0)
    }

    /// Allocates an array of `len` elements.
    ///
    /// # Errors
    ///
    /// As for [`try_allocate_object`](Self::try_allocate_object).
    pub fn try_allocate_array(&mut self, ty: &'static TypeInfo, len: usize) -> Result<ObjRef, GcError> {
        if !ty.is_array() {
            return Err(GcError::InvalidAllocation("object type allocated as an array"));
        }
        self.try_allocate(ty, len)
    }

    fn allocate_or_abort(&mut self, ty: &'static TypeInfo, count: usize) -> ObjRef {
        match self.try_allocate(ty, count) {
            Ok(obj) => obj,
            Err(err) => {
                tracing::error!(error = %err, ty = ty.name(), count, "fatal allocation failure");
                let size = ty.allocated_size(count).unwrap_or(usize::MAX);
                handle_alloc_error(
                    Layout::from_size_align(size, CELL_SIZE).unwrap_or_else(|_| Layout::new::<usize>()),
                )
            }
        }
    }

    fn try_allocate(&mut self, ty: &'static TypeInfo, count: usize) -> Result<ObjRef, GcError> {
        let requested = ty
            .allocated_size(count)
            .ok_or(GcError::InvalidAllocation("object size overflows"))?;
        self.poll_suspension(true);
        let trigger = self.runtime.scheduler.on_allocation(requested);
        self.handle_trigger(trigger);

        match self.allocator.allocate(ty, count) {
            Ok(obj) => Ok(obj),
            Err(err) if err.is_out_of_memory() => {
                tracing::debug!(error = %err, requested, "allocation_failed_collecting");
                let trigger = self.runtime.scheduler.on_oom(requested);
                self.handle_trigger(trigger);
                self.allocator.allocate(ty, count).map_err(|err| {
                    if err.is_out_of_memory() {
                        tracing::warn!(error = %err, requested, "allocation_failed_after_gc");
                        GcError::OutOfMemory { requested }
                    } else {
                        err
                    }
                })
            }
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Safepoints
    // ------------------------------------------------------------------

    /// Parks if a collection is waiting for this thread, then consults the
    /// scheduler.
    pub fn safepoint(&mut self) {
        self.poll_suspension(true);
        let trigger = self.runtime.scheduler.on_safe_point();
        self.handle_trigger(trigger);
    }

    /// Safepoint at a function entry.
    #[inline]
    pub fn safepoint_function_prologue(&mut self) {
        self.safepoint();
    }

    /// Safepoint at a loop back-edge.
    #[inline]
    pub fn safepoint_loop_body(&mut self) {
        self.safepoint();
    }

    #[inline]
    fn poll_suspension(&self, may_mark: bool) {
        let registry = self.runtime.collector.registry();
        if registry.is_suspension_requested() {
            registry.suspend_if_requested(&self.data, may_mark);
        }
    }

    fn handle_trigger(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::None => {}
            Trigger::Scheduled(epoch) => {
                tracing::trace!(mutator = self.id(), epoch = epoch.0, "gc_requested");
            }
            Trigger::WaitFinished(epoch) => {
                tracing::trace!(mutator = self.id(), epoch = epoch.0, "waiting_for_gc");
                self.wait_native(|state| state.wait_epoch_finished(epoch));
            }
        }
    }

    /// Runs `wait` in the native state so collections can proceed meanwhile.
    fn wait_native(&mut self, wait: impl FnOnce(&GcState)) {
        let state = Arc::clone(self.runtime.collector.state());
        let _native = self.enter_native();
        wait(&state);
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Pushes a shadow-stack slot and returns its index.
    pub fn push_root(&mut self, root: Option<ObjRef>) -> usize {
        self.data.roots.lock().push(root)
    }

    /// Pops the topmost shadow-stack slot.
    pub fn pop_root(&mut self) -> Option<ObjRef> {
        self.data.roots.lock().pop().flatten()
    }

    /// Reads a shadow-stack slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist.
    #[must_use]
    pub fn root(&self, index: usize) -> Option<ObjRef> {
        self.data.roots.lock().get(index)
    }

    /// Overwrites a shadow-stack slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist.
    pub fn set_root(&mut self, index: usize, root: Option<ObjRef>) {
        self.data.roots.lock().set(index, root);
    }

    /// Opens a root scope.
    pub fn push_frame(&mut self) {
        self.data.roots.lock().push_frame();
    }

    /// Drops every root pushed since the matching [`push_frame`](Self::push_frame).
    ///
    /// # Panics
    ///
    /// Panics if no frame is open.
    pub fn pop_frame(&mut self) {
        self.data.roots.lock().pop_frame();
    }

    /// Number of shadow-stack slots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.data.roots.lock().len()
    }

    // ------------------------------------------------------------------
    // Explicit collections
    // ------------------------------------------------------------------

    /// Requests a collection without waiting.
    pub fn schedule_gc(&self) -> Epoch {
        self.runtime.scheduler.schedule()
    }

    /// Requests a collection and waits until it has finished.
    pub fn schedule_and_wait_full_gc(&mut self) -> Epoch {
        let epoch = self.schedule_gc();
        self.wait_native(|state| state.wait_epoch_finished(epoch));
        epoch
    }

    /// Requests a collection and waits until its finalizers have run.
    pub fn schedule_and_wait_full_gc_with_finalizers(&mut self) -> Epoch {
        let epoch = self.schedule_gc();
        self.wait_native(|state| state.wait_epoch_finalized(epoch));
        epoch
    }

    /// Switches to the native state until the guard drops.
    ///
    /// The collector never waits for a native thread, so long blocking calls
    /// belong inside this guard. The guard borrows the mutator mutably, which
    /// keeps the heap and roots out of reach meanwhile.
    pub fn enter_native(&mut self) -> NativeGuard<'_> {
        let previous = self
            .runtime
            .collector
            .registry()
            .switch_state(&self.data, ThreadState::Native);
        NativeGuard {
            mutator: self,
            previous,
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.allocator.clear_caches();
        let registry = self.runtime.collector.registry();
        registry.switch_state(&self.data, ThreadState::Native);
        registry.unregister(&self.data);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("roots", &self.root_count())
            .finish_non_exhaustive()
    }
}

/// Keeps a mutator in the native state. Switching back polls for suspension.
#[must_use = "the mutator returns to the runnable state when the guard drops"]
pub struct NativeGuard<'a> {
    mutator: &'a mut Mutator,
    previous: ThreadState,
}

impl NativeGuard<'_> {
    /// The state restored on drop.
    #[must_use]
    pub const fn previous(&self) -> ThreadState {
        self.previous
    }
}

impl Drop for NativeGuard<'_> {
    fn drop(&mut self) {
        self.mutator
            .runtime
            .collector
            .registry()
            .switch_state(&self.mutator.data, self.previous);
    }
}

impl std::fmt::Debug for NativeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeGuard")
            .field("mutator", &self.mutator.id())
            .field("previous", &self.previous)
            .finish()
    }
}
