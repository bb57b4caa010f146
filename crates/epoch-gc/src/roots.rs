//! Root tracking.
//!
//! Each mutator keeps a [`ShadowStack`] of reference slots that generated code
//! pushes and pops around calls. Slots are scanned during the pause, either by
//! the collector or by the mutator itself when it marks its own stack.
//! Process-wide references live in [`GlobalRoots`].

use parking_lot::Mutex;

use crate::object::ObjRef;

// ============================================================================
// ShadowStack - per-mutator root slots
// ============================================================================

/// A stack of nullable reference slots with scope frames.
#[derive(Debug, Default)]
pub struct ShadowStack {
    slots: Vec<Option<ObjRef>>,
    frame_markers: Vec<usize>,
}

impl ShadowStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Pushes a slot and returns its index.
    pub fn push(&mut self, root: Option<ObjRef>) -> usize {
        self.slots.push(root);
        self.slots.len() - 1
    }

    /// Pops the topmost slot.
    pub fn pop(&mut self) -> Option<Option<ObjRef>> {
        self.slots.pop()
    }

    /// Reads slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ObjRef> {
        self.slots[index]
    }

    /// Overwrites slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist.
    pub fn set(&mut self, index: usize, root: Option<ObjRef>) {
        self.slots[index] = root;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates over non-null slots.
    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }

    /// Opens a scope; [`pop_frame`](Self::pop_frame) drops every slot pushed since.
    pub fn push_frame(&mut self) {
        self.frame_markers.push(self.slots.len());
    }

    /// Closes the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics if no frame is open.
    pub fn pop_frame(&mut self) {
        let marker = self
            .frame_markers
            .pop()
            .unwrap_or_else(|| panic!("pop_frame without a matching push_frame"));
        self.slots.truncate(marker);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.frame_markers.clear();
    }
}

// ============================================================================
// GlobalRoots - process-wide root slots
// ============================================================================

/// Handle returned by [`GlobalRoots::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalRootId(usize);

#[derive(Debug, Default)]
struct Slab {
    slots: Vec<Option<ObjRef>>,
    free: Vec<usize>,
    live: usize,
}

/// Registry of roots that outlive any single mutator frame.
#[derive(Debug, Default)]
pub struct GlobalRoots {
    slab: Mutex<Slab>,
}

impl GlobalRoots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, root: ObjRef) -> GlobalRootId {
        let mut slab = self.slab.lock();
        slab.live += 1;
        if let Some(index) = slab.free.pop() {
            slab.slots[index] = Some(root);
            GlobalRootId(index)
        } else {
            slab.slots.push(Some(root));
            GlobalRootId(slab.slots.len() - 1)
        }
    }

    /// Removes a root. Returns the object it held, or `None` if already removed.
    pub fn remove(&self, id: GlobalRootId) -> Option<ObjRef> {
        let mut slab = self.slab.lock();
        let root = slab.slots.get_mut(id.0)?.take()?;
        slab.free.push(id.0);
        slab.live -= 1;
        Some(root)
    }

    #[must_use]
    pub fn get(&self, id: GlobalRootId) -> Option<ObjRef> {
        self.slab.lock().slots.get(id.0).copied().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.lock().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every live root out under the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ObjRef> {
        self.slab.lock().slots.iter().filter_map(|slot| *slot).collect()
    }
}
