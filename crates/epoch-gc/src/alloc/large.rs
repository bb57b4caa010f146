//! Large pages: one object per mapping.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::memory::{HeapAccounting, PageMemory};
use super::store::{Page, SweepScope};
use super::PageKind;
use crate::error::GcError;
use crate::object::{Cell, ObjRef, CELL_SIZE};

pub(crate) struct LargePage {
    memory: PageMemory,
    allocated: AtomicBool,
}

impl LargePage {
    /// Hands out the page's only block, once.
    pub(crate) fn try_allocate(&self) -> Option<NonNull<Cell>> {
        if self.allocated.swap(true, Ordering::Relaxed) {
            return None;
        }
        Some(NonNull::from(&self.memory.cells()[0]))
    }
}

impl Page for LargePage {
    const KIND: PageKind = PageKind::Large;

    fn create(cell_count: usize, accounting: &Arc<HeapAccounting>) -> Result<Self, GcError> {
        let bytes = cell_count
            .checked_mul(CELL_SIZE)
            .ok_or(GcError::InvalidAllocation("large object size overflow"))?;
        Ok(Self {
            memory: PageMemory::map(bytes, PageKind::Large, 0, accounting)?,
            allocated: AtomicBool::new(false),
        })
    }

    fn sweep(&self, scope: &mut SweepScope) -> bool {
        if !self.allocated.load(Ordering::Relaxed) {
            return false;
        }
        // SAFETY: an allocated large page starts with its object.
        let obj = unsafe { ObjRef::from_block(NonNull::from(&self.memory.cells()[0])) };
        if obj.gc_data().try_reset_mark() {
            scope.keep(obj.allocated_size());
            true
        } else {
            scope.sweep(obj.allocated_size());
            false
        }
    }
}
