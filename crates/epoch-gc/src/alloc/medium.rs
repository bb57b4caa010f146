//! Medium pages: variable-size blocks carved from a cursor.
//!
//! Each block starts with a tag cell holding `size << 1 | allocated`, where
//! the size counts the tag itself. Allocation carves from the free block at
//! the cursor and falls back to a first-fit scan; sweep coalesces adjacent
//! free blocks and moves the cursor to the largest one.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::memory::{HeapAccounting, PageMemory};
use super::store::{Page, SweepScope};
use super::{PageKind, MEDIUM_PAGE_CELLS, MEDIUM_PAGE_SIZE};
use crate::error::GcError;
use crate::object::{clear_cells, Cell, ObjRef};

const ALLOCATED: usize = 1;

#[inline]
const fn tag(size: usize, allocated: bool) -> usize {
    (size << 1) | allocated as usize
}

pub(crate) struct MediumPage {
    memory: PageMemory,
    cursor: AtomicUsize,
}

impl MediumPage {
    fn cells(&self) -> &[Cell] {
        self.memory.cells()
    }

    /// Reads the tag at `index` as `(size, allocated)`.
    fn block_at(&self, index: usize) -> (usize, bool) {
        let value = self.cells()[index].load();
        let size = value >> 1;
        assert!(size > 0, "corrupted medium page tag at {index}");
        (size, value & ALLOCATED != 0)
    }

    fn fits(&self, index: usize, need: usize) -> bool {
        if index >= MEDIUM_PAGE_CELLS {
            return false;
        }
        let (size, allocated) = self.block_at(index);
        !allocated && size >= need
    }

    fn first_fit(&self, need: usize) -> Option<usize> {
        let mut index = 0;
        while index < MEDIUM_PAGE_CELLS {
            let (size, allocated) = self.block_at(index);
            if !allocated && size >= need {
                return Some(index);
            }
            index += size;
        }
        None
    }

    /// Allocates `cell_count` zeroed cells, or returns `None` if no free block fits.
    pub(crate) fn try_allocate(&self, cell_count: usize) -> Option<NonNull<Cell>> {
        let need = cell_count + 1;
        let cursor = self.cursor.load(Ordering::Relaxed);
        let at = if self.fits(cursor, need) {
            cursor
        } else {
            self.first_fit(need)?
        };

        let (size, _) = self.block_at(at);
        let cells = self.cells();
        if size > need {
            cells[at + need].store(tag(size - need, false));
        }
        cells[at].store(tag(need, true));
        self.cursor.store(at + need, Ordering::Relaxed);

        let body = &cells[at + 1..at + need];
        clear_cells(body);
        Some(NonNull::from(&body[0]))
    }

    #[cfg(test)]
    fn free_cells(&self) -> usize {
        let mut index = 0;
        let mut free = 0;
        while index < MEDIUM_PAGE_CELLS {
            let (size, allocated) = self.block_at(index);
            if !allocated {
                free += size;
            }
            index += size;
        }
        free
    }
}

impl Page for MediumPage {
    const KIND: PageKind = PageKind::Medium;

    fn create(_cell_count: usize, accounting: &Arc<HeapAccounting>) -> Result<Self, GcError> {
        let memory = PageMemory::map(MEDIUM_PAGE_SIZE, PageKind::Medium, 0, accounting)?;
        memory.cells()[0].store(tag(MEDIUM_PAGE_CELLS, false));
        Ok(Self {
            memory,
            cursor: AtomicUsize::new(0),
        })
    }

    fn sweep(&self, scope: &mut SweepScope) -> bool {
        let cells = self.cells();
        let mut alive = false;
        let mut index = 0;
        let mut free_run: Option<(usize, usize)> = None;
        let mut largest = (0, 0);

        while index < MEDIUM_PAGE_CELLS {
            let (size, allocated) = self.block_at(index);
            let mut free = !allocated;
            if allocated {
                // SAFETY: allocated blocks hold an object right after the tag.
                let obj = unsafe { ObjRef::from_block(NonNull::from(&cells[index + 1])) };
                if obj.gc_data().try_reset_mark() {
                    scope.keep(obj.allocated_size());
                    alive = true;
                } else {
                    scope.sweep(obj.allocated_size());
                    free = true;
                }
            }

            if free {
                let run = match free_run {
                    Some((start, len)) => (start, len + size),
                    None => (index, size),
                };
                cells[run.0].store(tag(run.1, false));
                if run.1 > largest.1 {
                    largest = run;
                }
                free_run = Some(run);
            } else {
                free_run = None;
            }
            index += size;
        }

        self.cursor.store(largest.0, Ordering::Relaxed);
        alive
    }
}
