//! Work balancing between parallel markers.
//!
//! Every worker owns a private `Vec` for the hot push/pop path and a shared
//! [`StealQueue`] that peers steal from. When the private list grows past
//! [`MIN_SIZE_TO_SHARE`], half of it is published to the shared queue. An idle
//! worker looks for work in this order:
//!
//! 1. its own shared queue
//! 2. [`STEALING_ATTEMPT_CYCLES`] rounds over every registered peer, taking up
//!    to [`MAX_SIZE_TO_STEAL`] items per steal
//! 3. parking on a condition variable
//!
//! Marking is over when every expected worker has registered and parked. The
//! last worker to park sets `all_done` and wakes the others.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use super::worklist::{StealQueue, WorkItem};

/// Private list size above which work is published.
pub const MIN_SIZE_TO_SHARE: usize = 256;
/// Most items taken from a peer in one steal.
pub const MAX_SIZE_TO_STEAL: usize = 128;
/// Rounds over all peers before parking.
pub const STEALING_ATTEMPT_CYCLES: usize = 4;
/// Slots in each shared queue.
pub const SHARED_QUEUE_CAPACITY: usize = 1024;

type SharedQueue<T> = StealQueue<T, SHARED_QUEUE_CAPACITY>;

#[derive(Debug)]
struct Coordination {
    waiting: usize,
    registered: usize,
    expected: usize,
    all_done: bool,
}

impl Coordination {
    const fn complete(&self) -> bool {
        self.waiting == self.registered && self.registered == self.expected
    }
}

/// Coordinator shared by every worker of one mark phase.
#[derive(Debug)]
pub struct ParallelProcessor<T: WorkItem> {
    queues: RwLock<Vec<Arc<SharedQueue<T>>>>,
    coordination: Mutex<Coordination>,
    wake: Condvar,
}

impl<T: WorkItem> ParallelProcessor<T> {
    /// Creates a coordinator that waits for `expected_workers` to register.
    #[must_use]
    pub fn new(expected_workers: usize) -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
            coordination: Mutex::new(Coordination {
                waiting: 0,
                registered: 0,
                expected: expected_workers,
                all_done: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Joins the phase as a new worker.
    ///
    /// Returns `None` if the phase is over or every expected worker has
    /// already joined.
    pub fn register(self: &Arc<Self>) -> Option<Worker<T>> {
        let mut c = self.coordination.lock();
        if c.all_done || c.registered >= c.expected {
            return None;
        }
        c.registered += 1;
        let shared = Arc::new(SharedQueue::new());
        self.queues.write().push(Arc::clone(&shared));
        drop(c);
        Some(Worker {
            processor: Arc::clone(self),
            local: Vec::new(),
            shared,
        })
    }

    /// Stops waiting for workers that will never join.
    ///
    /// # Panics
    ///
    /// Panics if fewer workers are expected than have registered.
    pub fn lower_expectations(&self, expected_workers: usize) {
        let mut c = self.coordination.lock();
        assert!(
            expected_workers >= c.registered,
            "{} workers registered, cannot expect {expected_workers}",
            c.registered
        );
        c.expected = expected_workers;
        if c.registered > 0 && c.complete() && !c.all_done {
            c.all_done = true;
            self.wake.notify_all();
        }
    }

    #[must_use]
    pub fn expected_workers(&self) -> usize {
        self.coordination.lock().expected
    }

    #[must_use]
    pub fn registered_workers(&self) -> usize {
        self.coordination.lock().registered
    }

    /// Returns `true` once marking has terminated.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.coordination.lock().all_done
    }

    fn any_shared_work(&self) -> bool {
        self.queues.read().iter().any(|q| !q.is_empty())
    }

    fn notify_work_shared(&self) {
        let c = self.coordination.lock();
        if c.waiting > 0 {
            self.wake.notify_all();
        }
    }

    /// Parks until work shows up or marking ends. Returns `false` when done.
    fn wait_for_more_work(&self) -> bool {
        let mut c = self.coordination.lock();
        if c.all_done {
            return false;
        }
        c.waiting += 1;
        if c.complete() {
            // Every worker is parked with nothing left anywhere.
            if !self.any_shared_work() {
                c.all_done = true;
                self.wake.notify_all();
                return false;
            }
        } else if !self.any_shared_work() {
            self.wake.wait(&mut c);
        }
        c.waiting -= 1;
        !c.all_done
    }
}

/// One marker's view of the phase.
#[derive(Debug)]
pub struct Worker<T: WorkItem> {
    processor: Arc<ParallelProcessor<T>>,
    local: Vec<T>,
    shared: Arc<SharedQueue<T>>,
}

impl<T: WorkItem> Worker<T> {
    /// Adds an item, publishing surplus work for idle peers.
    pub fn push(&mut self, item: T) {
        self.local.push(item);
        if self.local.len() > MIN_SIZE_TO_SHARE {
            self.share();
        }
    }

    /// Takes the next item, stealing or parking as needed.
    ///
    /// Returns `None` only once marking has terminated for every worker.
    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.local.pop() {
            return Some(item);
        }
        loop {
            if self.take_own_shared() || self.steal_from_peers() {
                return self.local.pop();
            }
            if !self.processor.wait_for_more_work() {
                return None;
            }
        }
    }

    /// Items in the private list.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    fn share(&mut self) {
        let keep = self.local.len() / 2;
        let mut shared = 0;
        while self.local.len() > keep {
            let Some(&item) = self.local.first() else { break };
            if !self.shared.push(item) {
                break;
            }
            self.local.swap_remove(0);
            shared += 1;
        }
        if shared > 0 {
            self.processor.notify_work_shared();
        }
    }

    fn take_own_shared(&mut self) -> bool {
        let mut taken = false;
        while let Some(item) = self.shared.pop() {
            self.local.push(item);
            taken = true;
        }
        taken
    }

    fn steal_from_peers(&mut self) -> bool {
        for _ in 0..STEALING_ATTEMPT_CYCLES {
            let peers = self.processor.queues.read().clone();
            for peer in peers.iter().filter(|q| !Arc::ptr_eq(q, &self.shared)) {
                let mut stolen = 0;
                while stolen < MAX_SIZE_TO_STEAL {
                    match peer.steal() {
                        Some(item) => {
                            self.local.push(item);
                            stolen += 1;
                        }
                        None => break,
                    }
                }
                if stolen > 0 {
                    return true;
                }
            }
        }
        false
    }
}
