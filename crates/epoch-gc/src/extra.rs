//! Per-object side records and their sweep contract.
//!
//! An object whose type has a finalizer gets an [`ExtraObjectData`] record at
//! allocation. Records live in their own pages and are swept during the pause,
//! before heap pages, so that a dead finalizable object can be kept alive and
//! queued instead of reclaimed:
//!
//! | record state          | base object | outcome                                  |
//! |-----------------------|-------------|------------------------------------------|
//! | finalized             | any         | record freed, base detached              |
//! | in finalizer queue    | any         | base kept alive, record kept             |
//! | live                  | marked      | record kept                              |
//! | live, has finalizer   | unmarked    | queued for finalization, base kept alive |
//! | live, no finalizer    | unmarked    | record freed                             |

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::alloc::memory::{CellLayout, HeapAccounting, PageMemory};
use crate::alloc::store::{Page, SweepScope};
use crate::alloc::{PageKind, EXTRA_OBJECT_PAGE_SIZE};
use crate::error::GcError;
use crate::finalizer::FinalizerTasks;
use crate::object::ObjRef;

const FLAG_IN_FINALIZER_QUEUE: usize = 1 << 0;
const FLAG_FINALIZED: usize = 1 << 1;

const NO_SLOT: usize = usize::MAX;

/// Side record attached to an object.
#[repr(C)]
pub struct ExtraObjectData {
    base: AtomicUsize,
    flags: AtomicUsize,
    next_free: AtomicUsize,
}

// SAFETY: three atomic words, valid when zeroed.
unsafe impl CellLayout for ExtraObjectData {}

impl ExtraObjectData {
    fn base(&self) -> Option<ObjRef> {
        ObjRef::from_addr(self.base.load(Ordering::Acquire))
    }

    fn has_flag(&self, flag: usize) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: usize) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    /// Binds this record to `base`.
    pub(crate) fn install(&self, base: ObjRef) {
        self.flags.store(0, Ordering::Relaxed);
        self.base.store(base.addr(), Ordering::Release);
        base.install_meta(NonNull::from(self));
    }

    fn release(&self) {
        if let Some(base) = self.base() {
            if base.meta() == Some(NonNull::from(self)) {
                base.clear_meta();
            }
        }
        self.flags.store(0, Ordering::Relaxed);
        self.base.store(0, Ordering::Release);
    }

    /// Applies the sweep contract. Returns `true` if the record stays.
    fn sweep(&self, queue: &mut FinalizerQueue) -> bool {
        let Some(base) = self.base() else {
            return false;
        };
        if self.has_flag(FLAG_FINALIZED) {
            self.release();
            return false;
        }
        if self.has_flag(FLAG_IN_FINALIZER_QUEUE) {
            base.gc_data().try_mark();
            return true;
        }
        if base.gc_data().is_marked() {
            return true;
        }
        if base.type_info().has_finalizer() {
            self.set_flag(FLAG_IN_FINALIZER_QUEUE);
            queue.push(ExtraRef(NonNull::from(self)));
            base.gc_data().try_mark();
            return true;
        }
        self.release();
        false
    }
}

/// Handle to a record queued for finalization.
#[derive(Debug)]
pub(crate) struct ExtraRef(NonNull<ExtraObjectData>);

// SAFETY: records are all-atomic and outlive their queue entry.
unsafe impl Send for ExtraRef {}

impl ExtraRef {
    fn record(&self) -> &ExtraObjectData {
        // SAFETY: a queued record is not freed before it is flagged finalized.
        unsafe { self.0.as_ref() }
    }
}

/// Objects whose finalizers one epoch must run, in sweep order.
#[derive(Debug, Default)]
pub struct FinalizerQueue {
    items: Vec<ExtraRef>,
}

impl FinalizerQueue {
    pub(crate) fn push(&mut self, item: ExtraRef) {
        self.items.push(item);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FinalizerTasks for FinalizerQueue {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn finalize(self) {
        for item in self.items {
            let record = item.record();
            if let Some(base) = record.base() {
                if let Some(finalizer) = base.type_info().finalizer() {
                    if catch_unwind(AssertUnwindSafe(|| finalizer(base))).is_err() {
                        tracing::error!(object = ?base, "finalizer panicked");
                    }
                }
            }
            record.set_flag(FLAG_FINALIZED);
        }
    }
}

/// A page of fixed-size side records.
pub(crate) struct ExtraObjectPage {
    memory: PageMemory,
    slot_count: usize,
    free_head: AtomicUsize,
    fresh: AtomicUsize,
}

impl ExtraObjectPage {
    fn slots(&self) -> &[ExtraObjectData] {
        &self.memory.view::<ExtraObjectData>()[..self.slot_count]
    }

    pub(crate) fn try_allocate(&self) -> Option<NonNull<ExtraObjectData>> {
        let slots = self.slots();
        let head = self.free_head.load(Ordering::Relaxed);
        let index = if head == NO_SLOT {
            let fresh = self.fresh.load(Ordering::Relaxed);
            if fresh == self.slot_count {
                return None;
            }
            self.fresh.store(fresh + 1, Ordering::Relaxed);
            fresh
        } else {
            self.free_head
                .store(slots[head].next_free.load(Ordering::Relaxed), Ordering::Relaxed);
            head
        };
        Some(NonNull::from(&slots[index]))
    }
}

impl Page for ExtraObjectPage {
    const KIND: PageKind = PageKind::Extra;

    fn create(_cell_count: usize, accounting: &Arc<HeapAccounting>) -> Result<Self, GcError> {
        let memory = PageMemory::map(EXTRA_OBJECT_PAGE_SIZE, PageKind::Extra, 0, accounting)?;
        let slot_count = memory.view::<ExtraObjectData>().len();
        Ok(Self {
            memory,
            slot_count,
            free_head: AtomicUsize::new(NO_SLOT),
            fresh: AtomicUsize::new(0),
        })
    }

    fn sweep(&self, scope: &mut SweepScope) -> bool {
        let slots = self.slots();
        let fresh = self.fresh.load(Ordering::Relaxed);
        let mut alive = false;
        let mut head = NO_SLOT;
        for index in (0..fresh).rev() {
            let slot = &slots[index];
            let occupied = slot.base.load(Ordering::Acquire) != 0;
            if occupied {
                if slot.sweep(&mut scope.finalizer_queue) {
                    scope.keep(std::mem::size_of::<ExtraObjectData>());
                    alive = true;
                    continue;
                }
                scope.sweep(std::mem::size_of::<ExtraObjectData>());
            }
            slot.next_free.store(head, Ordering::Relaxed);
            head = index;
        }
        if alive {
            self.free_head.store(head, Ordering::Relaxed);
        } else {
            self.free_head.store(NO_SLOT, Ordering::Relaxed);
            self.fresh.store(0, Ordering::Relaxed);
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Cell, TypeInfo, CELL_SIZE, HEADER_CELLS};
    use std::sync::atomic::AtomicUsize as Counter;

    static FINALIZED: Counter = Counter::new(0);

    fn count_finalized(_obj: ObjRef) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    static FINALIZABLE: TypeInfo =
        TypeInfo::object("Resource", CELL_SIZE, 0).with_finalizer(count_finalized);

    struct Fixture {
        _cells: Vec<Cell>,
        page: ExtraObjectPage,
        objs: Vec<ObjRef>,
    }

    fn fixture(count: usize) -> Fixture {
        let stride = HEADER_CELLS + 1;
        let cells: Vec<Cell> = (0..count * stride).map(|_| Cell::default()).collect();
        let page = ExtraObjectPage::create(0, &Arc::new(HeapAccounting::new(None))).unwrap();
        let objs = (0..count)
            .map(|i| {
                let obj = unsafe { ObjRef::initialize(NonNull::from(&cells[i * stride]), &FINALIZABLE, 0) };
                let record = page.try_allocate().unwrap();
                unsafe { record.as_ref() }.install(obj);
                obj
            })
            .collect();
        Fixture {
            _cells: cells,
            page,
            objs,
        }
    }

    #[test]
    fn test_dead_finalizable_object_is_queued_and_kept_alive() {
        let f = fixture(3);
        f.objs[0].gc_data().try_mark();

        let mut scope = SweepScope::default();
        assert!(f.page.sweep(&mut scope));
        assert_eq!(scope.finalizer_queue.len(), 2);
        assert!(f.objs.iter().all(|o| o.gc_data().is_marked()));

        // Still queued on the next cycle: kept alive again, not re-queued.
        for obj in &f.objs[1..] {
            obj.gc_data().try_reset_mark();
        }
        let mut again = SweepScope::default();
        assert!(f.page.sweep(&mut again));
        assert!(again.finalizer_queue.is_empty());
        assert!(f.objs[1].gc_data().is_marked());
    }

    #[test]
    fn test_finalized_record_is_released() {
        let f = fixture(1);
        let mut scope = SweepScope::default();
        f.page.sweep(&mut scope);
        let queue = std::mem::take(&mut scope.finalizer_queue);
        let before = FINALIZED.load(Ordering::SeqCst);
        queue.finalize();
        assert!(FINALIZED.load(Ordering::SeqCst) > before);

        f.objs[0].gc_data().try_reset_mark();
        let mut next = SweepScope::default();
        assert!(!f.page.sweep(&mut next));
        assert_eq!(next.swept_objects, 1);
        assert!(f.objs[0].meta().is_none());
        assert!(!f.objs[0].gc_data().is_marked());
    }
}
