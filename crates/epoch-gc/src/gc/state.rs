//! Epoch state machine.
//!
//! Four counters describe the collector's progress:
//!
//! ```text
//! finalized <= finished <= started <= scheduled <= started + 1
//! ```
//!
//! An epoch is *pending* while `scheduled > started` and *running* while
//! `started > finished`. Requests made while an epoch is pending coalesce
//! into it. None of the operations fail; they only block, and every
//! transition asserts monotonicity.

use std::fmt;

use parking_lot::{Condvar, Mutex};

/// Identifier of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: u64,
    started: u64,
    finished: u64,
    finalized: u64,
    shutdown: bool,
}

/// Shared epoch counters and the condition variable that publishes them.
#[derive(Debug, Default)]
pub struct GcState {
    counters: Mutex<Counters>,
    changed: Condvar,
}

impl GcState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a collection that starts after any running one.
    ///
    /// Returns the epoch that will satisfy the request.
    pub fn schedule(&self) -> Epoch {
        let mut c = self.counters.lock();
        if c.scheduled <= c.started {
            c.scheduled = c.started + 1;
            tracing::trace!(epoch = c.scheduled, "epoch_scheduled");
            self.changed.notify_all();
        }
        Epoch(c.scheduled)
    }

    /// Returns the pending or running epoch, scheduling one if idle.
    pub fn ensure_active(&self) -> Epoch {
        {
            let c = self.counters.lock();
            if c.scheduled > c.finished {
                return Epoch(c.scheduled);
            }
        }
        self.schedule()
    }

    /// Blocks the collector thread until an epoch is pending.
    ///
    /// Returns `None` once shutdown has been requested.
    pub fn wait_scheduled(&self) -> Option<Epoch> {
        let mut c = self.counters.lock();
        loop {
            if c.shutdown {
                return None;
            }
            if c.scheduled > c.started {
                return Some(Epoch(c.scheduled));
            }
            self.changed.wait(&mut c);
        }
    }

    /// Marks `epoch` as running.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` does not advance past the last started epoch, or if
    /// the previous epoch has not finished.
    pub fn start(&self, epoch: Epoch) {
        let mut c = self.counters.lock();
        assert!(epoch.0 > c.started, "{epoch} started after epoch {}", c.started);
        assert_eq!(c.started, c.finished, "{epoch} overlaps a running epoch");
        c.started = epoch.0;
        c.scheduled = c.scheduled.max(epoch.0);
        self.changed.notify_all();
    }

    /// Marks `epoch` as finished.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` is not the running epoch.
    pub fn finish(&self, epoch: Epoch) {
        let mut c = self.counters.lock();
        assert!(
            epoch.0 > c.finished && epoch.0 <= c.started,
            "{epoch} finished out of order (started {}, finished {})",
            c.started,
            c.finished
        );
        c.finished = epoch.0;
        self.changed.notify_all();
    }

    /// Marks `epoch`'s finalizers as drained.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` regresses or has not finished.
    pub fn finalized(&self, epoch: Epoch) {
        let mut c = self.counters.lock();
        assert!(
            epoch.0 > c.finalized && epoch.0 <= c.finished,
            "{epoch} finalized out of order (finished {}, finalized {})",
            c.finished,
            c.finalized
        );
        c.finalized = epoch.0;
        self.changed.notify_all();
    }

    /// Blocks until `epoch` or a later one has finished, or shutdown.
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        let mut c = self.counters.lock();
        while c.finished < epoch.0 && !c.shutdown {
            self.changed.wait(&mut c);
        }
    }

    /// Blocks until `epoch` or a later one has been finalized, or shutdown.
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        let mut c = self.counters.lock();
        while c.finalized < epoch.0 && !c.shutdown {
            self.changed.wait(&mut c);
        }
    }

    /// Stops the state machine and wakes every waiter.
    ///
    /// Waits for a running epoch to finish first. A pending epoch that has
    /// not started is dropped.
    pub fn shutdown(&self) {
        let mut c = self.counters.lock();
        while c.started > c.finished {
            self.changed.wait(&mut c);
        }
        c.shutdown = true;
        self.changed.notify_all();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.counters.lock().shutdown
    }

    #[must_use]
    pub fn scheduled_epoch(&self) -> Epoch {
        Epoch(self.counters.lock().scheduled)
    }

    #[must_use]
    pub fn started_epoch(&self) -> Epoch {
        Epoch(self.counters.lock().started)
    }

    #[must_use]
    pub fn finished_epoch(&self) -> Epoch {
        Epoch(self.counters.lock().finished)
    }

    #[must_use]
    pub fn finalized_epoch(&self) -> Epoch {
        Epoch(self.counters.lock().finalized)
    }

    /// Returns `true` while an epoch is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let c = self.counters.lock();
        c.started > c.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_schedule_coalesces_while_pending() {
        let state = GcState::new();
        assert_eq!(state.schedule(), Epoch(1));
        assert_eq!(state.schedule(), Epoch(1));
        assert_eq!(state.ensure_active(), Epoch(1));
    }

    #[test]
    fn test_schedule_while_running_queues_next() {
        let state = GcState::new();
        let e = state.schedule();
        state.start(e);
        assert_eq!(state.ensure_active(), Epoch(1));
        assert_eq!(state.schedule(), Epoch(2));
        state.finish(e);
        assert_eq!(state.ensure_active(), Epoch(2));
        assert_eq!(state.wait_scheduled(), Some(Epoch(2)));
    }

    #[test]
    #[should_panic(expected = "finished out of order")]
    fn test_finish_without_start_panics() {
        let state = GcState::new();
        state.finish(Epoch(1));
    }

    #[test]
    fn test_waiters_unblock_on_finish_and_finalize() {
        let state = Arc::new(GcState::new());
        let epoch = state.schedule();
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                state.wait_epoch_finished(epoch);
                let finished = state.finished_epoch();
                state.wait_epoch_finalized(epoch);
                finished
            })
        };
        state.start(epoch);
        state.finish(epoch);
        state.finalized(epoch);
        assert!(waiter.join().unwrap() >= epoch);
    }

    #[test]
    fn test_shutdown_releases_collector_and_waiters() {
        let state = Arc::new(GcState::new());
        let collector = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_scheduled())
        };
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_epoch_finalized(Epoch(10)))
        };
        state.shutdown();
        assert_eq!(collector.join().unwrap(), None);
        waiter.join().unwrap();
        assert!(state.is_shutdown());
    }

    #[test]
    fn test_shutdown_waits_for_running_epoch() {
        let state = Arc::new(GcState::new());
        let epoch = state.schedule();
        state.start(epoch);
        let stopper = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.shutdown())
        };
        thread::sleep(std::time::Duration::from_millis(5));
        assert!(!state.is_shutdown());
        state.finish(epoch);
        stopper.join().unwrap();
        assert!(state.is_shutdown());
        assert_eq!(state.wait_scheduled(), None);
    }
}
