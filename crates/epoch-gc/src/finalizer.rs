//! Background finalizer thread.
//!
//! The collector hands each epoch's [`FinalizerQueue`](crate::FinalizerQueue)
//! to a [`FinalizerProcessor`]. Batches are drained strictly one epoch at a
//! time, in the order they were scheduled, and the completion callback for an
//! epoch fires only after its whole batch has run.
//!
//! The thread is started lazily on the first non-empty batch and lives until
//! [`FinalizerProcessor::stop`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::gc::state::Epoch;
use crate::tracing::{trace_phase, GcPhase};

/// A batch of finalization work for one epoch.
pub trait FinalizerTasks: Send + 'static {
    /// Number of finalizers in the batch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every finalizer in the batch.
    fn finalize(self);
}

type EpochCallback = Box<dyn Fn(Epoch) + Send + Sync>;

struct Pending<Q> {
    batches: VecDeque<(Epoch, Q)>,
    shutdown: bool,
}

struct Inner<Q> {
    pending: Mutex<Pending<Q>>,
    wake: Condvar,
    on_epoch_done: EpochCallback,
}

/// Drains per-epoch finalizer batches on a dedicated thread.
pub struct FinalizerProcessor<Q: FinalizerTasks> {
    inner: Arc<Inner<Q>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
}

impl<Q: FinalizerTasks> FinalizerProcessor<Q> {
    /// Creates a processor that reports each drained epoch to `on_epoch_done`.
    pub fn new(thread_name: impl Into<String>, on_epoch_done: impl Fn(Epoch) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Pending {
                    batches: VecDeque::new(),
                    shutdown: false,
                }),
                wake: Condvar::new(),
                on_epoch_done: Box::new(on_epoch_done),
            }),
            thread: Mutex::new(None),
            thread_name: thread_name.into(),
        }
    }

    /// Hands `tasks` over for `epoch`.
    ///
    /// An empty batch with no thread running completes immediately on the
    /// calling thread. Otherwise the batch is queued behind any earlier epochs
    /// so that completions are reported in order.
    pub fn schedule_tasks(&self, tasks: Q, epoch: Epoch) {
        let mut thread = self.thread.lock();
        if tasks.is_empty() && thread.is_none() {
            drop(thread);
            (self.inner.on_epoch_done)(epoch);
            return;
        }

        if thread.is_none() {
            match self.spawn() {
                Ok(handle) => {
                    tracing::debug!(name = %self.thread_name, "finalizer_thread_started");
                    *thread = Some(handle);
                }
                Err(err) => {
                    drop(thread);
                    tracing::error!(error = %err, epoch = epoch.0, "cannot start finalizer thread, finalizing inline");
                    tasks.finalize();
                    (self.inner.on_epoch_done)(epoch);
                    return;
                }
            }
        }

        tracing::trace!(epoch = epoch.0, count = tasks.len(), "finalizers_scheduled");
        self.inner.pending.lock().batches.push_back((epoch, tasks));
        self.inner.wake.notify_all();
    }

    /// Returns `true` while the finalizer thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Number of batches waiting to be drained.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.inner.pending.lock().batches.len()
    }

    /// Drains every pending batch, then joins the thread.
    ///
    /// The processor can be scheduled again afterwards; a new thread is
    /// started on demand.
    pub fn stop(&self) {
        let mut thread = self.thread.lock();
        let Some(handle) = thread.take() else {
            return;
        };
        self.inner.pending.lock().shutdown = true;
        self.inner.wake.notify_all();
        if handle.join().is_err() {
            tracing::error!("finalizer thread panicked");
        }

        let mut pending = self.inner.pending.lock();
        assert!(
            pending.batches.is_empty(),
            "finalizer batches left behind after stop"
        );
        pending.shutdown = false;
        tracing::debug!(name = %self.thread_name, "finalizer_thread_stopped");
    }

    fn spawn(&self) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run(&inner))
    }
}

fn run<Q: FinalizerTasks>(inner: &Inner<Q>) {
    loop {
        let (epoch, tasks) = {
            let mut pending = inner.pending.lock();
            loop {
                if let Some(batch) = pending.batches.pop_front() {
                    break batch;
                }
                if pending.shutdown {
                    return;
                }
                inner.wake.wait(&mut pending);
            }
        };

        if !tasks.is_empty() {
            let _span = trace_phase(GcPhase::Finalize);
            let count = tasks.len();
            tasks.finalize();
            tracing::debug!(epoch = epoch.0, count, "finalizers_done");
        }
        (inner.on_epoch_done)(epoch);
    }
}

impl<Q: FinalizerTasks> Drop for FinalizerProcessor<Q> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<Q: FinalizerTasks> std::fmt::Debug for FinalizerProcessor<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerProcessor")
            .field("thread_name", &self.thread_name)
            .field("running", &self.is_running())
            .field("pending_batches", &self.pending_batches())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Batch that records into a shared log when finalized.
    struct Recorder {
        epoch: u64,
        count: usize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FinalizerTasks for Recorder {
        fn len(&self) -> usize {
            self.count
        }

        fn finalize(self) {
            for i in 0..self.count {
                self.log.lock().push(format!("finalize {}#{i}", self.epoch));
            }
        }
    }

    fn processor(log: &Arc<Mutex<Vec<String>>>) -> FinalizerProcessor<Recorder> {
        let log = Arc::clone(log);
        FinalizerProcessor::new("test-finalizer", move |epoch| {
            log.lock().push(format!("done {}", epoch.0));
        })
    }

    fn batch(epoch: u64, count: usize, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            epoch,
            count,
            log: Arc::clone(log),
        }
    }

    #[test]
    fn test_empty_batch_without_thread_completes_inline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let processor = processor(&log);
        processor.schedule_tasks(batch(1, 0, &log), Epoch(1));
        assert!(!processor.is_running());
        assert_eq!(*log.lock(), vec!["done 1".to_string()]);
    }

    #[test]
    fn test_batches_drain_in_epoch_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let processor = processor(&log);
        processor.schedule_tasks(batch(1, 2, &log), Epoch(1));
        // Empty, but a thread is running: must still complete after epoch 1.
        processor.schedule_tasks(batch(2, 0, &log), Epoch(2));
        processor.schedule_tasks(batch(3, 1, &log), Epoch(3));
        processor.stop();

        assert_eq!(
            *log.lock(),
            vec![
                "finalize 1#0",
                "finalize 1#1",
                "done 1",
                "done 2",
                "finalize 3#0",
                "done 3",
            ]
        );
        assert!(!processor.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let done = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let processor = {
            let done = Arc::clone(&done);
            FinalizerProcessor::new("test-finalizer", move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })
        };
        processor.schedule_tasks(batch(1, 1, &log), Epoch(1));
        processor.stop();
        processor.schedule_tasks(batch(2, 1, &log), Epoch(2));
        assert!(processor.is_running());
        drop(processor);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(log.lock().len(), 2);
    }
}
