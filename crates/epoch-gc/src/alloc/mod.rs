//! Segregated-size-class paged heap.
//!
//! Requests are routed by size in cells:
//!
//! - up to [`SMALL_PAGE_MAX_BLOCK_SIZE`]: a small page dedicated to that exact
//!   cell count, served from a free list
//! - up to [`MEDIUM_PAGE_MAX_BLOCK_SIZE`]: the shared medium page class,
//!   served by cursor with first-fit fallback
//! - anything larger: a large page holding just that object
//!
//! Each mutator owns a [`ThreadAllocator`] that caches its current page per
//! class. The caches are dropped whenever the heap generation changes, which
//! happens once per collection while mutators are suspended.

mod large;
pub(crate) mod memory;
mod medium;
mod small;
pub(crate) mod store;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub use memory::PageInfo;
pub use store::PoolStats;

use self::large::LargePage;
use self::medium::MediumPage;
use self::memory::HeapAccounting;
use self::small::SmallPage;
use self::store::{PageStore, SweepScope, SweepTotals};
use crate::error::GcError;
use crate::extra::ExtraObjectPage;
use crate::object::{Cell, ObjRef, TypeInfo, CELL_SIZE};

/// Mapping size of a small page.
pub const SMALL_PAGE_SIZE: usize = 256 * 1024;
/// Cells in a small page.
pub const SMALL_PAGE_CELLS: usize = SMALL_PAGE_SIZE / CELL_SIZE;
/// Largest request, in cells, served by small pages.
pub const SMALL_PAGE_MAX_BLOCK_SIZE: usize = 128;
/// Mapping size of a medium page.
pub const MEDIUM_PAGE_SIZE: usize = 256 * 1024;
/// Cells in a medium page.
pub const MEDIUM_PAGE_CELLS: usize = MEDIUM_PAGE_SIZE / CELL_SIZE;
/// Largest request, in cells, served by medium pages.
pub const MEDIUM_PAGE_MAX_BLOCK_SIZE: usize = MEDIUM_PAGE_CELLS / 2;
/// Mapping size of a side-record page.
pub const EXTRA_OBJECT_PAGE_SIZE: usize = 64 * 1024;

/// Heap page variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Small,
    Medium,
    Large,
    /// Side records for objects that need finalization.
    Extra,
}

impl PageKind {
    /// The page class serving a request of `cells` cells.
    #[must_use]
    pub const fn for_cells(cells: usize) -> Self {
        if cells <= SMALL_PAGE_MAX_BLOCK_SIZE {
            Self::Small
        } else if cells <= MEDIUM_PAGE_MAX_BLOCK_SIZE {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// The shared heap: page stores for every class plus live counters.
pub struct Heap {
    accounting: Arc<HeapAccounting>,
    small: Box<[PageStore<SmallPage>]>,
    medium: PageStore<MediumPage>,
    large: PageStore<LargePage>,
    extra: PageStore<ExtraObjectPage>,
    cycle_sweep: SweepTotals,
    generation: AtomicU64,
    objects: AtomicUsize,
    bytes: AtomicUsize,
    extra_objects: AtomicUsize,
}

impl Heap {
    /// Creates an empty heap, optionally capping committed page bytes.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            accounting: Arc::new(HeapAccounting::new(limit)),
            small: (0..=SMALL_PAGE_MAX_BLOCK_SIZE)
                .map(|_| PageStore::new())
                .collect(),
            medium: PageStore::new(),
            large: PageStore::new(),
            extra: PageStore::new(),
            cycle_sweep: SweepTotals::default(),
            generation: AtomicU64::new(0),
            objects: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            extra_objects: AtomicUsize::new(0),
        }
    }

    /// Number of allocated objects not yet reclaimed.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    /// Bytes of allocated objects not yet reclaimed, headers included.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of live side records.
    #[must_use]
    pub fn extra_object_count(&self) -> usize {
        self.extra_objects.load(Ordering::Relaxed)
    }

    /// Bytes currently mapped for pages of every class.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.accounting.committed()
    }

    /// Configured cap on committed bytes.
    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.accounting.limit()
    }

    /// Number of pages currently mapped.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.accounting.page_count()
    }

    /// Describes the page that holds `obj`.
    #[must_use]
    pub fn page_info(&self, obj: ObjRef) -> Option<PageInfo> {
        self.accounting.lookup(obj.addr())
    }

    /// Pool counters for one page class; small classes are summed.
    #[must_use]
    pub fn pool_stats(&self, kind: PageKind) -> PoolStats {
        match kind {
            PageKind::Small => self
                .small
                .iter()
                .map(PageStore::stats)
                .fold(PoolStats::default(), |acc, s| acc + s),
            PageKind::Medium => self.medium.stats(),
            PageKind::Large => self.large.stats(),
            PageKind::Extra => self.extra.stats(),
        }
    }

    /// Pool counters for the small class of exactly `cells` cells.
    ///
    /// # Panics
    ///
    /// Panics if `cells` exceeds [`SMALL_PAGE_MAX_BLOCK_SIZE`].
    #[must_use]
    pub fn small_pool_stats(&self, cells: usize) -> PoolStats {
        self.small[cells].stats()
    }

    /// Unmaps every swept-empty page of every class.
    ///
    /// Empty pages normally wait for the next cycle; a mutator at the heap
    /// limit releases them early so that another class can map a page.
    pub fn release_empty_pages(&self) -> usize {
        let released = self.small.iter().map(PageStore::release_empty).sum::<usize>()
            + self.medium.release_empty()
            + self.extra.release_empty();
        if released > 0 {
            tracing::debug!(released, committed = self.committed_bytes(), "empty_pages_released");
        }
        released
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Readies the stores for a new cycle. Must run while mutators are suspended.
    pub(crate) fn prepare_for_gc(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let pages = self.small.iter().map(PageStore::prepare_for_gc).sum::<usize>()
            + self.medium.prepare_for_gc()
            + self.large.prepare_for_gc();
        self.extra.prepare_for_gc();
        self.cycle_sweep.begin(pages);
    }

    /// Sweeps side records, collecting the objects that need finalization.
    pub(crate) fn sweep_extra_objects(&self) -> SweepScope {
        let mut scope = SweepScope::default();
        self.extra.sweep(&mut scope);
        self.extra_objects
            .fetch_sub(scope.swept_objects, Ordering::Relaxed);
        scope
    }

    /// Sweeps every page mutators have not swept yet and returns the cycle's
    /// totals, lazy sweeps included.
    ///
    /// Waits for mutators still sweeping a page of this cycle.
    pub(crate) fn sweep(&self) -> SweepScope {
        let mut scope = SweepScope::default();
        for store in self.small.iter() {
            store.sweep(&mut scope);
        }
        self.medium.sweep(&mut scope);
        self.large.sweep_and_free(&mut scope);
        self.account_swept(&scope);
        self.cycle_sweep.wait_settled();
        self.cycle_sweep.snapshot()
    }

    fn account_swept(&self, scope: &SweepScope) {
        self.objects
            .fetch_sub(scope.swept_objects, Ordering::Relaxed);
        self.bytes.fetch_sub(scope.swept_bytes, Ordering::Relaxed);
        self.cycle_sweep.add(scope);
    }

    fn record_allocation(&self, bytes: usize) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("bytes", &self.total_bytes())
            .field("extra_objects", &self.extra_object_count())
            .field("committed", &self.committed_bytes())
            .finish_non_exhaustive()
    }
}

/// A mutator's view of the heap: one cached page per class.
pub struct ThreadAllocator {
    heap: Arc<Heap>,
    generation: u64,
    small: Box<[Option<Arc<SmallPage>>]>,
    medium: Option<Arc<MediumPage>>,
    extra: Option<Arc<ExtraObjectPage>>,
}

impl ThreadAllocator {
    #[must_use]
    pub fn new(heap: Arc<Heap>) -> Self {
        let generation = heap.generation();
        Self {
            heap,
            generation,
            small: (0..=SMALL_PAGE_MAX_BLOCK_SIZE).map(|_| None).collect(),
            medium: None,
            extra: None,
        }
    }

    /// Allocates and initializes an instance of `ty` with `count` elements.
    ///
    /// # Errors
    ///
    /// Fails if the size overflows or a new page cannot be mapped.
    pub fn allocate(&mut self, ty: &'static TypeInfo, count: usize) -> Result<ObjRef, GcError> {
        let cells = ty
            .allocated_cells(count)
            .ok_or(GcError::InvalidAllocation("object size overflows"))?;
        self.refresh();

        let block = match self.allocate_block(cells) {
            Err(GcError::HeapLimitExceeded { .. }) if self.heap.release_empty_pages() > 0 => {
                self.allocate_block(cells)?
            }
            result => result?,
        };
        // SAFETY: the block holds `cells` zeroed cells owned by this thread.
        let obj = unsafe { ObjRef::initialize(block, ty, count) };
        self.heap.record_allocation(obj.allocated_size());

        if ty.has_finalizer() {
            let record = match self.allocate_extra() {
                Err(GcError::HeapLimitExceeded { .. }) if self.heap.release_empty_pages() > 0 => {
                    self.allocate_extra()?
                }
                result => result?,
            };
            // SAFETY: freshly allocated records are exclusively ours.
            unsafe { record.as_ref() }.install(obj);
            self.heap.extra_objects.fetch_add(1, Ordering::Relaxed);
        }
        Ok(obj)
    }

    /// Drops every cached page, e.g. before the thread detaches.
    pub fn clear_caches(&mut self) {
        self.small.iter_mut().for_each(|page| *page = None);
        self.medium = None;
        self.extra = None;
    }

    fn refresh(&mut self) {
        let generation = self.heap.generation();
        if generation != self.generation {
            self.clear_caches();
            self.generation = generation;
        }
    }

    fn allocate_block(&mut self, cells: usize) -> Result<NonNull<Cell>, GcError> {
        match PageKind::for_cells(cells) {
            PageKind::Small => self.allocate_small(cells),
            PageKind::Medium => self.allocate_medium(cells),
            PageKind::Large | PageKind::Extra => self.allocate_large(cells),
        }
    }

    fn finish_lazy_sweep(&self, scope: &SweepScope) {
        debug_assert!(scope.finalizer_queue.is_empty());
        self.heap.account_swept(scope);
    }

    fn allocate_small(&mut self, cells: usize) -> Result<NonNull<Cell>, GcError> {
        if let Some(block) = self.small[cells].as_ref().and_then(|p| p.try_allocate()) {
            return Ok(block);
        }
        let mut scope = SweepScope::default();
        let result = loop {
            let page = match self.heap.small[cells].get_page(cells, &self.heap.accounting, &mut scope) {
                Ok(page) => page,
                Err(err) => break Err(err),
            };
            debug_assert_eq!(page.block_cells(), cells);
            if let Some(block) = page.try_allocate() {
                self.small[cells] = Some(page);
                break Ok(block);
            }
        };
        self.finish_lazy_sweep(&scope);
        result
    }

    fn allocate_medium(&mut self, cells: usize) -> Result<NonNull<Cell>, GcError> {
        if let Some(block) = self.medium.as_ref().and_then(|p| p.try_allocate(cells)) {
            return Ok(block);
        }
        let mut scope = SweepScope::default();
        let result = loop {
            let page = match self.heap.medium.get_page(cells, &self.heap.accounting, &mut scope) {
                Ok(page) => page,
                Err(err) => break Err(err),
            };
            if let Some(block) = page.try_allocate(cells) {
                self.medium = Some(page);
                break Ok(block);
            }
        };
        self.finish_lazy_sweep(&scope);
        result
    }

    fn allocate_large(&self, cells: usize) -> Result<NonNull<Cell>, GcError> {
        let page = self.heap.large.new_page(cells, &self.heap.accounting)?;
        page.try_allocate()
            .ok_or(GcError::InvalidAllocation("fresh large page already allocated"))
    }

    fn allocate_extra(&mut self) -> Result<NonNull<crate::extra::ExtraObjectData>, GcError> {
        if let Some(record) = self.extra.as_ref().and_then(|p| p.try_allocate()) {
            return Ok(record);
        }
        let mut scope = SweepScope::default();
        let result = loop {
            let page = match self.heap.extra.get_page(0, &self.heap.accounting, &mut scope) {
                Ok(page) => page,
                Err(err) => break Err(err),
            };
            if let Some(record) = page.try_allocate() {
                self.extra = Some(page);
                break Ok(record);
            }
        };
        debug_assert!(scope.finalizer_queue.is_empty());
        self.heap
            .extra_objects
            .fetch_sub(scope.swept_objects, Ordering::Relaxed);
        result
    }
}

impl std::fmt::Debug for ThreadAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadAllocator")
            .field("generation", &self.generation)
            .field("cached_small", &self.small.iter().flatten().count())
            .field("has_medium", &self.medium.is_some())
            .finish_non_exhaustive()
    }
}
