//! Collection statistics.
//!
//! Every cycle produces one [`GcStats`] record. The runtime keeps cumulative
//! counters in [`GlobalMetrics`] and the last 64 records in [`GcHistory`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Statistics of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Epoch of the collection.
    pub epoch: u64,
    /// Wall time from suspension request to the end of sweep.
    pub duration: Duration,
    /// Time mutators were stopped.
    pub pause: Duration,
    /// Time spent waiting for mutators to reach safepoints.
    pub suspend_duration: Duration,
    /// Duration of root collection and mark.
    pub mark_duration: Duration,
    /// Duration of both sweeps.
    pub sweep_duration: Duration,
    /// Roots found on mutator shadow stacks.
    pub stack_roots: usize,
    /// Roots found in the global root table.
    pub global_roots: usize,
    /// Objects marked live.
    pub marked_objects: usize,
    /// Bytes of objects marked live.
    pub marked_bytes: usize,
    /// Objects reclaimed by sweep.
    pub swept_objects: usize,
    /// Bytes reclaimed by sweep.
    pub swept_bytes: usize,
    /// Objects that survived sweep.
    pub kept_objects: usize,
    /// Bytes that survived sweep.
    pub kept_bytes: usize,
    /// Objects handed to the finalizer thread.
    pub finalizers_queued: usize,
    /// Heap bytes in use when the cycle started.
    pub heap_bytes_before: usize,
    /// Heap bytes in use when the cycle ended.
    pub heap_bytes_after: usize,
}

/// Captures phase durations of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    pub suspend: Duration,
    pub mark: Duration,
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            suspend: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn lap(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    pub fn end_suspend(&mut self) {
        self.suspend = self.lap();
    }

    pub fn end_mark(&mut self) {
        self.mark = self.lap();
    }

    /// Adds to the sweep duration; sweep runs in two parts.
    pub fn end_sweep(&mut self) {
        let lap = self.lap();
        self.sweep += lap;
    }
}

/// Cumulative counters for one runtime.
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    finalizers_queued: AtomicUsize,
    pause_ns: AtomicU64,
}

impl GlobalMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            finalizers_queued: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_finalizers_queued(&self) -> usize {
        self.finalizers_queued.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    fn record(&self, stats: &GcStats) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(stats.swept_bytes, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(stats.swept_objects, Ordering::Relaxed);
        self.finalizers_queued
            .fetch_add(stats.finalizers_queued, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            stats.pause.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }
}

const HISTORY_SIZE: usize = 64;

/// Ring buffer of the most recent [`GcStats`].
///
/// Only the collector thread writes, one cycle at a time.
#[derive(Debug)]
pub struct GcHistory {
    buffer: UnsafeCell<[GcStats; HISTORY_SIZE]>,
    write_idx: AtomicUsize,
}

// SAFETY: the collector thread is the only writer, and readers tolerate a
// torn record since `GcStats` is plain `Copy` data.
unsafe impl Sync for GcHistory {}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: UnsafeCell::new([GcStats::default(); HISTORY_SIZE]),
            write_idx: AtomicUsize::new(0),
        }
    }

    fn push(&self, stats: GcStats) {
        let idx = self.write_idx.load(Ordering::Relaxed);
        // SAFETY: single writer; the slot is published by the store below.
        unsafe {
            (*self.buffer.get())[idx % HISTORY_SIZE] = stats;
        }
        self.write_idx.store(idx + 1, Ordering::Release);
    }

    /// Number of records ever pushed.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.write_idx.load(Ordering::Acquire)
    }

    /// Up to `n` most recent records, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcStats> {
        let total = self.total_recorded();
        let n = n.min(HISTORY_SIZE).min(total);
        // SAFETY: see the `Sync` impl.
        let buffer = unsafe { &*self.buffer.get() };
        (total - n..total).map(|i| buffer[i % HISTORY_SIZE]).collect()
    }

    /// The most recent record.
    #[must_use]
    pub fn last(&self) -> Option<GcStats> {
        self.recent(1).pop()
    }

    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|s| s.pause).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|s| s.pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Records one collection into the runtime's counters and history.
pub(crate) fn record(global: &GlobalMetrics, history: &GcHistory, stats: GcStats) {
    global.record(&stats);
    history.push(stats);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_accumulates_sweep() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_sweep();
        let first = timer.sweep;
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_sweep();
        assert!(timer.sweep > first);
        timer.end_mark();
        assert_eq!(timer.mark, Duration::ZERO);
    }

    #[test]
    fn test_history_wraps() {
        let global = GlobalMetrics::new();
        let history = GcHistory::new();
        for epoch in 1..=100 {
            record(
                &global,
                &history,
                GcStats {
                    epoch,
                    pause: Duration::from_micros(epoch),
                    swept_bytes: 10,
                    ..GcStats::default()
                },
            );
        }
        assert_eq!(history.total_recorded(), 100);
        let recent = history.recent(usize::MAX);
        assert_eq!(recent.len(), HISTORY_SIZE);
        assert_eq!(recent.first().map(|s| s.epoch), Some(37));
        assert_eq!(history.last().map(|s| s.epoch), Some(100));
        assert_eq!(history.max_pause_time(10), Duration::from_micros(100));
        assert_eq!(global.total_collections(), 100);
        assert_eq!(global.total_bytes_reclaimed(), 1000);
    }

    #[test]
    fn test_empty_history() {
        let history = GcHistory::new();
        assert!(history.recent(10).is_empty());
        assert!(history.last().is_none());
        assert_eq!(history.average_pause_time(10), Duration::ZERO);
    }
}
