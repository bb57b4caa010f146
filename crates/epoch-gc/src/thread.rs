//! Mutator registry and the cooperative suspension protocol.
//!
//! The collector raises a suspension request and then waits for every
//! registered mutator to become *ready*: parked at a safepoint, running native
//! code, or marking its own stack. Mutators notice the request at their next
//! safepoint. Transitions out of the native state check the request as well,
//! so a thread returning from native code during a pause parks at once.
//!
//! The request flag and each mutator's state are accessed with `SeqCst` so
//! that either the collector sees the mutator runnable, or the mutator sees
//! the request.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::gc::mark::MarkSession;
use crate::roots::ShadowStack;

/// Whether a mutator may touch the managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Running managed code; must reach safepoints.
    Runnable = 0,
    /// Running code that does not touch the heap; never waited for.
    Native = 1,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        if value == Self::Native as u8 {
            Self::Native
        } else {
            Self::Runnable
        }
    }
}

/// Per-mutator state visible to the collector.
#[derive(Debug)]
pub(crate) struct MutatorData {
    id: u64,
    state: AtomicU8,
    suspended: AtomicBool,
    marking: AtomicBool,
    pub(crate) roots: Mutex<ShadowStack>,
}

impl MutatorData {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_marking(&self) -> bool {
        self.marking.load(Ordering::SeqCst)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn ready_for_mark(&self) -> bool {
        self.state() == ThreadState::Native || self.is_suspended() || self.is_marking()
    }

    fn parked(&self) -> bool {
        self.state() == ThreadState::Native || self.is_suspended()
    }
}

#[derive(Debug, Default)]
struct Parking {
    /// Bumped on every resume; parked threads wait for it to change.
    generation: u64,
    session: Option<Arc<MarkSession>>,
}

/// All attached mutators plus the suspension handshake.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    threads: Mutex<Vec<Arc<MutatorData>>>,
    next_id: AtomicU64,
    suspension_requested: AtomicBool,
    marking_requested: AtomicBool,
    parking: Mutex<Parking>,
    parked: Condvar,
}

impl ThreadRegistry {
    /// Adds a mutator in the native state.
    pub(crate) fn register(&self) -> Arc<MutatorData> {
        let data = Arc::new(MutatorData {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(ThreadState::Native as u8),
            suspended: AtomicBool::new(false),
            marking: AtomicBool::new(false),
            roots: Mutex::new(ShadowStack::new()),
        });
        self.threads.lock().push(Arc::clone(&data));
        tracing::debug!(mutator = data.id, "mutator_attached");
        data
    }

    /// Removes a mutator. It must be in the native state.
    pub(crate) fn unregister(&self, data: &Arc<MutatorData>) {
        assert_eq!(data.state(), ThreadState::Native, "detaching a runnable mutator");
        self.threads.lock().retain(|t| !Arc::ptr_eq(t, data));
        tracing::debug!(mutator = data.id, "mutator_detached");
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<MutatorData>> {
        self.threads.lock().clone()
    }

    #[inline]
    pub(crate) fn is_suspension_requested(&self) -> bool {
        self.suspension_requested.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Collector side
    // ------------------------------------------------------------------

    pub(crate) fn request_suspension(&self, self_marking: bool) {
        self.marking_requested.store(self_marking, Ordering::SeqCst);
        self.suspension_requested.store(true, Ordering::SeqCst);
    }

    /// Spins until every mutator is parked, native or self-marking.
    pub(crate) fn wait_ready_to_mark(&self) {
        self.wait_for(MutatorData::ready_for_mark);
    }

    /// Spins until every mutator is parked or native.
    pub(crate) fn wait_suspended(&self) {
        self.wait_for(MutatorData::parked);
    }

    fn wait_for(&self, ready: impl Fn(&MutatorData) -> bool) {
        for thread in self.snapshot() {
            let backoff = Backoff::new();
            while !ready(&thread) {
                backoff.snooze();
            }
        }
    }

    /// Hands the mark session to self-marking mutators.
    pub(crate) fn publish_session(&self, session: Arc<MarkSession>) {
        self.parking.lock().session = Some(session);
        self.parked.notify_all();
    }

    /// Lifts the suspension request and wakes parked mutators.
    pub(crate) fn resume(&self) {
        let mut parking = self.parking.lock();
        self.suspension_requested.store(false, Ordering::SeqCst);
        self.marking_requested.store(false, Ordering::SeqCst);
        parking.session = None;
        parking.generation += 1;
        self.parked.notify_all();
    }

    // ------------------------------------------------------------------
    // Mutator side
    // ------------------------------------------------------------------

    /// Parks `data` until resume if a suspension is pending. Marks the
    /// mutator's own stack first when self-marking was requested and `may_mark`.
    pub(crate) fn suspend_if_requested(&self, data: &MutatorData, may_mark: bool) {
        if !self.is_suspension_requested() {
            return;
        }
        let mut parking = self.parking.lock();
        if !self.is_suspension_requested() {
            return;
        }
        let generation = parking.generation;

        if may_mark && self.marking_requested.load(Ordering::SeqCst) {
            data.marking.store(true, Ordering::SeqCst);
            while parking.session.is_none() && parking.generation == generation {
                self.parked.wait(&mut parking);
            }
            if let Some(session) = parking.session.clone() {
                drop(parking);
                let roots: Vec<_> = data.roots.lock().iter().collect();
                if session.participate(&roots) {
                    session.stats().add_stack_roots(roots.len());
                    tracing::trace!(mutator = data.id, roots = roots.len(), "mutator_marked_own_stack");
                }
                parking = self.parking.lock();
            }
            data.suspended.store(true, Ordering::SeqCst);
            data.marking.store(false, Ordering::SeqCst);
        } else {
            data.suspended.store(true, Ordering::SeqCst);
        }

        while parking.generation == generation {
            self.parked.wait(&mut parking);
        }
        data.suspended.store(false, Ordering::SeqCst);
    }

    /// Switches `data` to `state`, parking first when becoming runnable
    /// during a pause.
    pub(crate) fn switch_state(&self, data: &MutatorData, state: ThreadState) -> ThreadState {
        let previous = ThreadState::from_u8(data.state.swap(state as u8, Ordering::SeqCst));
        if state == ThreadState::Runnable && previous == ThreadState::Native {
            // The collector may already have scanned this stack; do not mark it again.
            self.suspend_if_requested(data, false);
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_native_threads_count_as_suspended() {
        let registry = ThreadRegistry::default();
        let data = registry.register();
        assert_eq!(data.state(), ThreadState::Native);
        registry.request_suspension(false);
        registry.wait_suspended();
        registry.resume();
        registry.unregister(&data);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_runnable_thread_parks_until_resume() {
        let registry = Arc::new(ThreadRegistry::default());
        let data = registry.register();
        registry.switch_state(&data, ThreadState::Runnable);
        registry.request_suspension(false);

        let mutator = {
            let registry = Arc::clone(&registry);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                registry.suspend_if_requested(&data, true);
                assert!(!registry.is_suspension_requested());
            })
        };
        registry.wait_suspended();
        assert!(data.is_suspended());
        thread::sleep(Duration::from_millis(5));
        assert!(!mutator.is_finished());
        registry.resume();
        mutator.join().unwrap();
        assert!(!data.is_suspended());
    }
}
