//! Page memory and committed-byte accounting.

use std::collections::BTreeMap;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sys_alloc::{Mmap, MmapOptions};

use super::PageKind;
use crate::error::GcError;
use crate::object::Cell;

/// Types that may be viewed directly over zeroed page memory.
///
/// # Safety
///
/// Implementors must consist only of atomics, be valid when all-zero, and
/// have a size that is a multiple of the cell size.
pub(crate) unsafe trait CellLayout: Sized {}

// SAFETY: a single AtomicUsize.
unsafe impl CellLayout for Cell {}

/// Where a page lives and what it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Page variant.
    pub kind: PageKind,
    /// Address of the first byte.
    pub start: usize,
    /// Mapped length in bytes.
    pub bytes: usize,
    /// Block size in cells for small pages, zero otherwise.
    pub block_cells: usize,
}

/// Committed bytes, the optional heap limit and the page directory.
#[derive(Debug)]
pub(crate) struct HeapAccounting {
    committed: AtomicUsize,
    limit: usize,
    directory: RwLock<BTreeMap<usize, PageInfo>>,
}

impl HeapAccounting {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            committed: AtomicUsize::new(0),
            limit: limit.unwrap_or(usize::MAX),
            directory: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        (self.limit != usize::MAX).then_some(self.limit)
    }

    fn reserve(&self, bytes: usize) -> Result<(), GcError> {
        let mut current = self.committed.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|&next| next <= self.limit)
                .ok_or(GcError::HeapLimitExceeded {
                    requested: bytes,
                    limit: self.limit,
                })?;
            match self.committed.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let previous = self.committed.fetch_sub(bytes, Ordering::Relaxed);
        assert!(previous >= bytes, "committed byte counter underflow");
    }

    /// Finds the page containing `addr`.
    pub(crate) fn lookup(&self, addr: usize) -> Option<PageInfo> {
        let directory = self.directory.read();
        directory
            .range(..=addr)
            .next_back()
            .map(|(_, info)| *info)
            .filter(|info| addr < info.start + info.bytes)
    }

    pub(crate) fn page_count(&self) -> usize {
        self.directory.read().len()
    }
}

/// One mapped page, unmapped and unaccounted on drop.
pub(crate) struct PageMemory {
    map: Mmap,
    accounting: Arc<HeapAccounting>,
}

impl PageMemory {
    pub(crate) fn map(
        bytes: usize,
        kind: PageKind,
        block_cells: usize,
        accounting: &Arc<HeapAccounting>,
    ) -> Result<Self, GcError> {
        let bytes = sys_alloc::round_to_page(bytes);
        accounting.reserve(bytes)?;
        let map = match MmapOptions::new().len(bytes).map_anon() {
            Ok(map) => map,
            Err(err) => {
                accounting.release(bytes);
                return Err(GcError::PageMapping(err));
            }
        };
        let start = map.ptr().as_ptr() as usize;
        accounting.directory.write().insert(
            start,
            PageInfo {
                kind,
                start,
                bytes: map.len(),
                block_cells,
            },
        );
        tracing::trace!(?kind, start, bytes, "page_mapped");
        Ok(Self {
            map,
            accounting: Arc::clone(accounting),
        })
    }

    /// Views the page as a slice of `T`.
    pub(crate) fn view<T: CellLayout>(&self) -> &[T] {
        debug_assert!(align_of::<T>() <= sys_alloc::page_size());
        let len = self.map.len() / size_of::<T>();
        // SAFETY: the mapping is zero-initialized, page aligned and lives as long
        // as `self`; `CellLayout` types are valid when zeroed and only use atomics.
        unsafe { std::slice::from_raw_parts(self.map.ptr().as_ptr().cast::<T>(), len) }
    }

    pub(crate) fn cells(&self) -> &[Cell] {
        self.view::<Cell>()
    }

    pub(crate) fn start(&self) -> usize {
        self.map.ptr().as_ptr() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

impl Drop for PageMemory {
    fn drop(&mut self) {
        self.accounting.directory.write().remove(&self.start());
        self.accounting.release(self.map.len());
    }
}
