//! Managed object layout.
//!
//! Every managed object is a run of word-sized [`Cell`]s inside a heap page:
//!
//! ```text
//! +-------------+-----------+-----------+---------+------------------+
//! | ObjectData  | type info | meta      | count   | payload cells... |
//! | (mark word) | pointer   | pointer   | (array) |                  |
//! +-------------+-----------+-----------+---------+------------------+
//! ```
//!
//! All words are atomics, so a page of zeroed memory is a valid run of free
//! cells and concurrent markers never race on plain memory. Reference slots
//! hold the address of another object's header, or zero for null.

use std::fmt;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::extra::ExtraObjectData;

/// Size in bytes of one heap cell.
pub const CELL_SIZE: usize = size_of::<Cell>();

/// Number of cells taken by [`ObjectHeader`].
pub const HEADER_CELLS: usize = size_of::<ObjectHeader>() / CELL_SIZE;

const _: () = assert!(size_of::<ObjectHeader>() % CELL_SIZE == 0);

/// Number of cells needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn cells_for(bytes: usize) -> usize {
    bytes.div_ceil(CELL_SIZE)
}

// ============================================================================
// Cell - the unit of heap memory
// ============================================================================

/// One machine word of heap memory.
#[repr(transparent)]
#[derive(Default)]
pub struct Cell(AtomicUsize);

impl Cell {
    #[inline]
    pub(crate) fn load(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn load_acquire(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store_release(&self, value: usize) {
        self.0.store(value, Ordering::Release);
    }
}

/// Zeroes a run of cells.
pub(crate) fn clear_cells(cells: &[Cell]) {
    for cell in cells {
        cell.store(0);
    }
}

// ============================================================================
// ObjectData - per-object GC metadata
// ============================================================================

/// The per-object mark latch.
///
/// Within one epoch an object moves from unmarked to marked exactly once, and
/// sweep moves it back. Both transitions are CAS operations so that any number
/// of concurrent markers enqueue an object at most once.
#[repr(transparent)]
pub struct ObjectData {
    mark: AtomicUsize,
}

impl ObjectData {
    const UNMARKED: usize = 0;
    const MARKED: usize = 1;

    /// Claims the object for marking. Returns `true` only for the first caller.
    #[inline]
    pub fn try_mark(&self) -> bool {
        self.mark
            .compare_exchange(
                Self::UNMARKED,
                Self::MARKED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Releases the mark. Returns `true` if the object was marked.
    #[inline]
    pub fn try_reset_mark(&self) -> bool {
        self.mark
            .compare_exchange(
                Self::MARKED,
                Self::UNMARKED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Returns `true` if the object is marked in the current epoch.
    #[inline]
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Acquire) == Self::MARKED
    }
}

/// Header shared by every managed object.
#[repr(C)]
pub struct ObjectHeader {
    gc: ObjectData,
    type_info: AtomicPtr<TypeInfo>,
    meta: AtomicPtr<ExtraObjectData>,
    count: AtomicUsize,
}

// ============================================================================
// TypeInfo - the type descriptor
// ============================================================================

/// Shape of a managed type's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Fixed-size object; the first `ref_fields` payload words are references.
    Object,
    /// Array whose every element is a reference.
    ReferenceArray,
    /// Array of plain data with a fixed element size.
    PrimitiveArray,
}

/// Visitor handed to trace callbacks during mark.
pub trait Tracer {
    /// Reports a reference from the object being traced.
    fn visit(&mut self, child: ObjRef);
}

/// Custom children tracer for a type.
pub type TraceFn = fn(ObjRef, &mut dyn Tracer);

/// Finalizer run on the finalizer thread once the object is unreachable.
///
/// Only the object itself is kept alive for the finalizer; objects it refers
/// to may already have been reclaimed, so a finalizer must not follow
/// reference fields.
pub type FinalizerFn = fn(ObjRef);

/// Static description of a managed type.
///
/// Type descriptors are emitted as `static` items by the code generator:
///
/// ```
/// use epoch_gc::TypeInfo;
///
/// static NODE: TypeInfo = TypeInfo::object("Node", 24, 2);
/// static BYTES: TypeInfo = TypeInfo::primitive_array("ByteArray", 1);
/// assert_eq!(NODE.ref_fields(), 2);
/// assert!(BYTES.is_array());
/// ```
pub struct TypeInfo {
    name: &'static str,
    kind: TypeKind,
    instance_size: usize,
    ref_fields: usize,
    element_size: usize,
    trace: Option<TraceFn>,
    finalizer: Option<FinalizerFn>,
}

impl TypeInfo {
    /// Describes a plain object with `instance_size` payload bytes whose first
    /// `ref_fields` words are references.
    ///
    /// # Panics
    ///
    /// Panics if the reference fields do not fit in the payload.
    #[must_use]
    pub const fn object(name: &'static str, instance_size: usize, ref_fields: usize) -> Self {
        assert!(
            ref_fields * CELL_SIZE <= instance_size,
            "reference fields must fit in the instance size"
        );
        Self {
            name,
            kind: TypeKind::Object,
            instance_size,
            ref_fields,
            element_size: 0,
            trace: None,
            finalizer: None,
        }
    }

    /// Describes an array of references.
    #[must_use]
    pub const fn reference_array(name: &'static str) -> Self {
        Self {
            name,
            kind: TypeKind::ReferenceArray,
            instance_size: 0,
            ref_fields: 0,
            element_size: CELL_SIZE,
            trace: None,
            finalizer: None,
        }
    }

    /// Describes an array of `element_size`-byte plain values.
    ///
    /// # Panics
    ///
    /// Panics if `element_size` is zero.
    #[must_use]
    pub const fn primitive_array(name: &'static str, element_size: usize) -> Self {
        assert!(element_size > 0, "element size must be non-zero");
        Self {
            name,
            kind: TypeKind::PrimitiveArray,
            instance_size: 0,
            ref_fields: 0,
            element_size,
            trace: None,
            finalizer: None,
        }
    }

    /// Attaches a finalizer.
    #[must_use]
    pub const fn with_finalizer(mut self, finalizer: FinalizerFn) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Replaces the default reference-slot tracing with a custom callback.
    #[must_use]
    pub const fn with_trace(mut self, trace: TraceFn) -> Self {
        self.trace = Some(trace);
        self
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn kind(&self) -> TypeKind {
        self.kind
    }

    #[must_use]
    pub const fn is_array(&self) -> bool {
        !matches!(self.kind, TypeKind::Object)
    }

    #[must_use]
    pub const fn instance_size(&self) -> usize {
        self.instance_size
    }

    #[must_use]
    pub const fn ref_fields(&self) -> usize {
        self.ref_fields
    }

    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    #[must_use]
    pub const fn finalizer(&self) -> Option<FinalizerFn> {
        self.finalizer
    }

    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Payload cells for an instance with `count` elements.
    fn payload_cells(&self, count: usize) -> Option<usize> {
        match self.kind {
            TypeKind::Object => Some(cells_for(self.instance_size)),
            TypeKind::ReferenceArray => Some(count),
            TypeKind::PrimitiveArray => count.checked_mul(self.element_size).map(cells_for),
        }
    }

    /// Total cells, header included, for an instance with `count` elements.
    ///
    /// Returns `None` if the size overflows.
    #[must_use]
    pub fn allocated_cells(&self, count: usize) -> Option<usize> {
        self.payload_cells(count)?.checked_add(HEADER_CELLS)
    }

    /// Total bytes, header included, for an instance with `count` elements.
    #[must_use]
    pub fn allocated_size(&self, count: usize) -> Option<usize> {
        self.allocated_cells(count)?.checked_mul(CELL_SIZE)
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instance_size", &self.instance_size)
            .field("ref_fields", &self.ref_fields)
            .field("element_size", &self.element_size)
            .field("finalizer", &self.finalizer.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ObjRef - handle to a managed object
// ============================================================================

/// A reference to a managed object.
///
/// An `ObjRef` stays valid while the object is reachable from a root: a
/// mutator's shadow stack, a global root, or a reference slot of another
/// reachable object. Holding an `ObjRef` does not by itself keep the object
/// alive; push it as a root before the next safepoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjRef(NonNull<ObjectHeader>);

// SAFETY: every word of a managed object is atomic.
unsafe impl Send for ObjRef {}
// SAFETY: every word of a managed object is atomic.
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// Lays out a fresh object in `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to at least `ty.allocated_cells(count)` zeroed cells
    /// exclusively owned by the caller.
    pub(crate) unsafe fn initialize(block: NonNull<Cell>, ty: &'static TypeInfo, count: usize) -> Self {
        let obj = Self(block.cast::<ObjectHeader>());
        let header = obj.header();
        header.count.store(count, Ordering::Relaxed);
        header
            .type_info
            .store(ptr::from_ref(ty).cast_mut(), Ordering::Release);
        obj
    }

    /// Views an occupied block as an object.
    ///
    /// # Safety
    ///
    /// `block` must start with a header written by [`ObjRef::initialize`].
    #[inline]
    pub(crate) const unsafe fn from_block(block: NonNull<Cell>) -> Self {
        Self(block.cast::<ObjectHeader>())
    }

    /// Reconstructs a reference from an address stored in a slot.
    #[inline]
    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut ObjectHeader).map(Self)
    }

    /// Address of the object header.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *const ObjectHeader {
        self.0.as_ptr()
    }

    #[inline]
    fn header(&self) -> &ObjectHeader {
        // SAFETY: an ObjRef always points at an initialized header inside a mapped page.
        unsafe { self.0.as_ref() }
    }

    /// The object's mark latch.
    #[inline]
    #[must_use]
    pub fn gc_data(&self) -> &ObjectData {
        &self.header().gc
    }

    /// The object's type descriptor.
    #[inline]
    #[must_use]
    pub fn type_info(self) -> &'static TypeInfo {
        let ptr = self.header().type_info.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "object at {:#x} has no type", self.addr());
        // SAFETY: type descriptors are 'static and never freed.
        unsafe { &*ptr }
    }

    /// Element count for arrays, zero for plain objects.
    #[inline]
    #[must_use]
    pub fn array_len(self) -> usize {
        self.header().count.load(Ordering::Relaxed)
    }

    /// Bytes occupied by the object, header included.
    #[must_use]
    pub fn allocated_size(self) -> usize {
        self.payload_len() * CELL_SIZE + size_of::<ObjectHeader>()
    }

    fn payload_len(self) -> usize {
        self.type_info()
            .payload_cells(self.array_len())
            .unwrap_or_default()
    }

    fn payload(&self) -> &[Cell] {
        let len = self.payload_len();
        // SAFETY: the allocator reserved `HEADER_CELLS + len` cells for this object.
        unsafe {
            let start = self.0.cast::<Cell>().as_ptr().add(HEADER_CELLS);
            std::slice::from_raw_parts(start, len)
        }
    }

    /// Number of reference slots at the start of the payload.
    #[must_use]
    pub fn ref_slot_count(self) -> usize {
        let ty = self.type_info();
        match ty.kind() {
            TypeKind::Object => ty.ref_fields(),
            TypeKind::ReferenceArray => self.array_len(),
            TypeKind::PrimitiveArray => 0,
        }
    }

    /// Number of payload words, reference slots included.
    #[must_use]
    pub fn word_count(self) -> usize {
        self.payload_len()
    }

    /// Reads reference slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference slot.
    #[must_use]
    pub fn load_ref(self, index: usize) -> Option<Self> {
        assert!(index < self.ref_slot_count(), "reference slot {index} out of bounds");
        Self::from_addr(self.payload()[index].load_acquire())
    }

    /// Writes reference slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference slot.
    pub fn store_ref(self, index: usize, value: Option<Self>) {
        assert!(index < self.ref_slot_count(), "reference slot {index} out of bounds");
        self.payload()[index].store_release(value.map_or(0, Self::addr));
    }

    /// Reads plain payload word `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is a reference slot or out of bounds.
    #[must_use]
    pub fn load_word(self, index: usize) -> usize {
        assert!(index >= self.ref_slot_count(), "word {index} is a reference slot");
        self.payload()[index].load()
    }

    /// Writes plain payload word `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is a reference slot or out of bounds.
    pub fn store_word(self, index: usize, value: usize) {
        assert!(index >= self.ref_slot_count(), "word {index} is a reference slot");
        self.payload()[index].store(value);
    }

    pub(crate) fn meta(self) -> Option<NonNull<ExtraObjectData>> {
        NonNull::new(self.header().meta.load(Ordering::Acquire))
    }

    pub(crate) fn install_meta(self, meta: NonNull<ExtraObjectData>) {
        self.header().meta.store(meta.as_ptr(), Ordering::Release);
    }

    pub(crate) fn clear_meta(self) {
        self.header().meta.store(ptr::null_mut(), Ordering::Release);
    }

    /// Reports every outgoing reference to `tracer`.
    pub(crate) fn trace_children(self, tracer: &mut dyn Tracer) {
        let ty = self.type_info();
        if let Some(trace) = ty.trace {
            trace(self, tracer);
            return;
        }
        let slots = self.ref_slot_count();
        for cell in &self.payload()[..slots] {
            if let Some(child) = Self::from_addr(cell.load_acquire()) {
                tracer.visit(child);
            }
        }
    }
}

/// Returns `true` if a block starting at `block` holds a live object header.
#[inline]
pub(crate) fn block_is_occupied(block: &[Cell]) -> bool {
    // The type pointer is the second header word; free blocks keep it null.
    block[1].load_acquire() != 0
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x}: {})", self.addr(), self.type_info().name())
    }
}
