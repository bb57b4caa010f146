//! Lock-free page pools.
//!
//! A [`PageStore`] keeps the pages of one size class in four MPMC stacks:
//!
//! - `empty`: swept pages with no live objects
//! - `ready`: swept pages with some free space and some live objects
//! - `used`: pages handed to a mutator for allocation
//! - `unswept`: pages that lived through the last mark and await sweeping
//!
//! Pages only move between stacks; whoever pops a page owns it until it is
//! pushed again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;

use super::memory::HeapAccounting;
use super::PageKind;
use crate::error::GcError;
use crate::extra::FinalizerQueue;

/// A heap page that the stores can create and sweep.
pub(crate) trait Page: Send + Sync + Sized + 'static {
    const KIND: PageKind;

    fn create(cell_count: usize, accounting: &Arc<HeapAccounting>) -> Result<Self, GcError>;

    /// Resets marks, frees dead blocks and returns `true` if anything survives.
    fn sweep(&self, scope: &mut SweepScope) -> bool;
}

/// Accumulates the outcome of sweeping one or more pages.
#[derive(Debug, Default)]
pub(crate) struct SweepScope {
    pub kept_objects: usize,
    pub kept_bytes: usize,
    pub swept_objects: usize,
    pub swept_bytes: usize,
    /// Pages taken off an `unswept` pool.
    pub pages: usize,
    pub finalizer_queue: FinalizerQueue,
}

impl SweepScope {
    #[inline]
    pub(crate) fn keep(&mut self, bytes: usize) {
        self.kept_objects += 1;
        self.kept_bytes += bytes;
    }

    #[inline]
    pub(crate) fn sweep(&mut self, bytes: usize) {
        self.swept_objects += 1;
        self.swept_bytes += bytes;
    }
}

/// Sweep results of one cycle, whether the collector or a mutator swept
/// the page.
///
/// Mutators sweep lazily while the collector sweeps the rest, so the
/// collector waits for every page queued at [`begin`](Self::begin) to be
/// accounted before it reads the totals.
#[derive(Debug, Default)]
pub(crate) struct SweepTotals {
    kept_objects: AtomicUsize,
    kept_bytes: AtomicUsize,
    swept_objects: AtomicUsize,
    swept_bytes: AtomicUsize,
    pending_pages: AtomicUsize,
}

impl SweepTotals {
    /// Starts a cycle with `pages` pages awaiting sweep. Runs in the pause.
    pub(crate) fn begin(&self, pages: usize) {
        self.kept_objects.store(0, Ordering::Relaxed);
        self.kept_bytes.store(0, Ordering::Relaxed);
        self.swept_objects.store(0, Ordering::Relaxed);
        self.swept_bytes.store(0, Ordering::Relaxed);
        self.pending_pages.store(pages, Ordering::Release);
    }

    pub(crate) fn add(&self, scope: &SweepScope) {
        self.kept_objects
            .fetch_add(scope.kept_objects, Ordering::Relaxed);
        self.kept_bytes.fetch_add(scope.kept_bytes, Ordering::Relaxed);
        self.swept_objects
            .fetch_add(scope.swept_objects, Ordering::Relaxed);
        self.swept_bytes
            .fetch_add(scope.swept_bytes, Ordering::Relaxed);
        self.pending_pages.fetch_sub(scope.pages, Ordering::AcqRel);
    }

    /// Spins until no page of the cycle is left unaccounted.
    pub(crate) fn wait_settled(&self) {
        let backoff = Backoff::new();
        while self.pending_pages.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    pub(crate) fn snapshot(&self) -> SweepScope {
        SweepScope {
            kept_objects: self.kept_objects.load(Ordering::Relaxed),
            kept_bytes: self.kept_bytes.load(Ordering::Relaxed),
            swept_objects: self.swept_objects.load(Ordering::Relaxed),
            swept_bytes: self.swept_bytes.load(Ordering::Relaxed),
            ..SweepScope::default()
        }
    }
}

/// Snapshot of one store's pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub empty: usize,
    pub ready: usize,
    pub used: usize,
    pub unswept: usize,
    /// Pages created since the store was built.
    pub created: usize,
    /// Pages destroyed since the store was built.
    pub destroyed: usize,
}

impl PoolStats {
    /// Pages currently owned by the store.
    #[must_use]
    pub const fn live_pages(&self) -> usize {
        self.created - self.destroyed
    }
}

impl std::ops::Add for PoolStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            empty: self.empty + rhs.empty,
            ready: self.ready + rhs.ready,
            used: self.used + rhs.used,
            unswept: self.unswept + rhs.unswept,
            created: self.created + rhs.created,
            destroyed: self.destroyed + rhs.destroyed,
        }
    }
}

pub(crate) struct PageStore<P> {
    empty: SegQueue<Arc<P>>,
    ready: SegQueue<Arc<P>>,
    used: SegQueue<Arc<P>>,
    unswept: SegQueue<Arc<P>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl<P: Page> PageStore<P> {
    pub(crate) const fn new() -> Self {
        Self {
            empty: SegQueue::new(),
            ready: SegQueue::new(),
            used: SegQueue::new(),
            unswept: SegQueue::new(),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Moves every allocated page to `unswept` and releases empty pages.
    /// Returns the number of pages now awaiting sweep.
    ///
    /// Must run while mutators are suspended.
    pub(crate) fn prepare_for_gc(&self) -> usize {
        while let Some(page) = self.ready.pop() {
            self.unswept.push(page);
        }
        while let Some(page) = self.used.pop() {
            self.unswept.push(page);
        }
        self.release_empty();
        self.unswept.len()
    }

    /// Destroys every page in the empty pool and returns how many there were.
    pub(crate) fn release_empty(&self) -> usize {
        let mut released = 0;
        while let Some(page) = self.empty.pop() {
            self.destroy(page);
            released += 1;
        }
        released
    }

    /// Sweeps every unswept page into `ready` or `empty`.
    pub(crate) fn sweep(&self, scope: &mut SweepScope) {
        while self.sweep_single(scope, &self.ready).is_some() {}
    }

    /// Sweeps every unswept page, destroying pages with nothing alive.
    pub(crate) fn sweep_and_free(&self, scope: &mut SweepScope) {
        while let Some(page) = self.unswept.pop() {
            scope.pages += 1;
            if page.sweep(scope) {
                self.ready.push(page);
            } else {
                self.destroy(page);
            }
        }
    }

    /// Sweeps unswept pages until one keeps live objects, pushing it to `to`.
    /// Pages that come out empty go to the empty pool.
    fn sweep_single(&self, scope: &mut SweepScope, to: &SegQueue<Arc<P>>) -> Option<Arc<P>> {
        while let Some(page) = self.unswept.pop() {
            scope.pages += 1;
            if page.sweep(scope) {
                to.push(Arc::clone(&page));
                return Some(page);
            }
            self.empty.push(page);
        }
        None
    }

    /// Hands out a page for allocation, sweeping lazily when possible.
    ///
    /// Preference order: an unswept page swept on the spot, a ready page, an
    /// empty page, then a freshly mapped one.
    pub(crate) fn get_page(
        &self,
        cell_count: usize,
        accounting: &Arc<HeapAccounting>,
        scope: &mut SweepScope,
    ) -> Result<Arc<P>, GcError> {
        if let Some(page) = self.sweep_single(scope, &self.used) {
            return Ok(page);
        }
        if let Some(page) = self.ready.pop().or_else(|| self.empty.pop()) {
            self.used.push(Arc::clone(&page));
            return Ok(page);
        }
        self.new_page(cell_count, accounting)
    }

    /// Maps a brand new page and registers it as used.
    pub(crate) fn new_page(
        &self,
        cell_count: usize,
        accounting: &Arc<HeapAccounting>,
    ) -> Result<Arc<P>, GcError> {
        let page = Arc::new(P::create(cell_count, accounting)?);
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(kind = ?P::KIND, cell_count, created, "page_created");
        self.used.push(Arc::clone(&page));
        Ok(page)
    }

    fn destroy(&self, page: Arc<P>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        drop(page);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            empty: self.empty.len(),
            ready: self.ready.len(),
            used: self.used.len(),
            unswept: self.unswept.len(),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}
