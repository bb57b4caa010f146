//! Small pages: fixed-size blocks of one exact cell count.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::memory::{HeapAccounting, PageMemory};
use super::store::{Page, SweepScope};
use super::{PageKind, SMALL_PAGE_CELLS, SMALL_PAGE_SIZE};
use crate::error::GcError;
use crate::object::{block_is_occupied, clear_cells, Cell, HEADER_CELLS};

const NO_BLOCK: usize = usize::MAX;

/// A page carved into equally sized blocks.
///
/// Blocks below `fresh` have been handed out at least once; free ones among
/// them form a list threaded through their first cell. Blocks at or above
/// `fresh` are untouched. Only the owning mutator or the GC mutates the page.
pub(crate) struct SmallPage {
    memory: PageMemory,
    block_cells: usize,
    block_count: usize,
    free_head: AtomicUsize,
    fresh: AtomicUsize,
}

impl SmallPage {
    pub(crate) const fn block_cells(&self) -> usize {
        self.block_cells
    }

    fn block(&self, index: usize) -> &[Cell] {
        let start = index * self.block_cells;
        &self.memory.cells()[start..start + self.block_cells]
    }

    /// Pops a zeroed block, or `None` if the page is full.
    pub(crate) fn try_allocate(&self) -> Option<NonNull<Cell>> {
        let head = self.free_head.load(Ordering::Relaxed);
        let index = if head == NO_BLOCK {
            let fresh = self.fresh.load(Ordering::Relaxed);
            if fresh == self.block_count {
                return None;
            }
            self.fresh.store(fresh + 1, Ordering::Relaxed);
            fresh
        } else {
            self.free_head
                .store(self.block(head)[0].load(), Ordering::Relaxed);
            head
        };
        let block = self.block(index);
        clear_cells(block);
        Some(NonNull::from(&block[0]))
    }

    /// Number of blocks currently holding objects.
    #[cfg(test)]
    fn occupied_blocks(&self) -> usize {
        (0..self.fresh.load(Ordering::Relaxed))
            .filter(|&i| block_is_occupied(self.block(i)))
            .count()
    }
}

impl Page for SmallPage {
    const KIND: PageKind = PageKind::Small;

    fn create(block_cells: usize, accounting: &Arc<HeapAccounting>) -> Result<Self, GcError> {
        assert!(
            block_cells >= HEADER_CELLS && block_cells <= super::SMALL_PAGE_MAX_BLOCK_SIZE,
            "invalid small block size {block_cells}"
        );
        let memory = PageMemory::map(SMALL_PAGE_SIZE, PageKind::Small, block_cells, accounting)?;
        Ok(Self {
            memory,
            block_cells,
            block_count: SMALL_PAGE_CELLS / block_cells,
            free_head: AtomicUsize::new(NO_BLOCK),
            fresh: AtomicUsize::new(0),
        })
    }

    fn sweep(&self, scope: &mut SweepScope) -> bool {
        let fresh = self.fresh.load(Ordering::Relaxed);
        let mut alive = false;
        let mut head = NO_BLOCK;
        // Walk backwards so the rebuilt free list hands out low blocks first.
        for index in (0..fresh).rev() {
            let block = self.block(index);
            if block_is_occupied(block) {
                // SAFETY: occupied blocks start with an initialized header.
                let obj = unsafe { crate::object::ObjRef::from_block(NonNull::from(&block[0])) };
                if obj.gc_data().try_reset_mark() {
                    scope.keep(obj.allocated_size());
                    alive = true;
                    continue;
                }
                scope.sweep(obj.allocated_size());
                clear_cells(&block[..HEADER_CELLS]);
            }
            block[0].store(head);
            head = index;
        }
        if alive {
            self.free_head.store(head, Ordering::Relaxed);
        } else {
            self.free_head.store(NO_BLOCK, Ordering::Relaxed);
            self.fresh.store(0, Ordering::Relaxed);
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjRef, TypeInfo, CELL_SIZE};

    static SMALL: TypeInfo = TypeInfo::object("Small", 2 * CELL_SIZE, 0);

    fn page() -> SmallPage {
        SmallPage::create(6, &Arc::new(HeapAccounting::new(None))).unwrap()
    }

    fn allocate(page: &SmallPage) -> ObjRef {
        let block = page.try_allocate().unwrap();
        unsafe { ObjRef::initialize(block, &SMALL, 0) }
    }

    #[test]
    fn test_fills_up_then_refuses() {
        let page = page();
        let mut count = 0;
        while let Some(block) = page.try_allocate() {
            unsafe { ObjRef::initialize(block, &SMALL, 0) };
            count += 1;
        }
        assert_eq!(count, SMALL_PAGE_CELLS / 6);
        assert_eq!(page.occupied_blocks(), count);
    }

    #[test]
    fn test_sweep_frees_unmarked_blocks() {
        let page = page();
        let objs: Vec<_> = (0..10).map(|_| allocate(&page)).collect();
        for obj in objs.iter().step_by(2) {
            assert!(obj.gc_data().try_mark());
        }

        let mut scope = SweepScope::default();
        assert!(page.sweep(&mut scope));
        assert_eq!(scope.kept_objects, 5);
        assert_eq!(scope.swept_objects, 5);
        assert_eq!(scope.kept_bytes, 5 * 6 * CELL_SIZE);
        assert_eq!(page.occupied_blocks(), 5);
        assert!(objs.iter().step_by(2).all(|o| !o.gc_data().is_marked()));

        // Freed blocks are reused before fresh ones, lowest first.
        let reused = allocate(&page);
        assert_eq!(reused, objs[1]);
    }

    #[test]
    fn test_fully_dead_page_resets() {
        let page = page();
        for _ in 0..3 {
            allocate(&page);
        }
        let mut scope = SweepScope::default();
        assert!(!page.sweep(&mut scope));
        assert_eq!(scope.swept_objects, 3);
        assert_eq!(page.occupied_blocks(), 0);
        let first = page.try_allocate().unwrap();
        assert_eq!(first, NonNull::from(&page.block(0)[0]));
    }
}
