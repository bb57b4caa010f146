//! Work-stealing queue for parallel marking.
//!
//! A bounded Chase-Lev deque: the owner pushes and pops at the bottom (LIFO),
//! any number of thieves steal from the top (FIFO). Items are stored as
//! machine words in atomic slots so that a racing steal never reads a torn
//! value.
//!
//! Based on "Simple and Efficient Work-Stealing Queues for Parallel
//! Programming" by Chase and Lev (2005), with the fences from "Correct and
//! Efficient Work-Stealing for Weak Memory Models" (Lê et al., 2013).

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::object::ObjRef;

/// A value that round-trips through a machine word.
///
/// # Safety
///
/// `from_word(into_word(x))` must return a value equal to `x`.
pub unsafe trait WorkItem: Copy + Send {
    fn into_word(self) -> usize;

    /// # Safety
    ///
    /// `word` must come from [`WorkItem::into_word`].
    unsafe fn from_word(word: usize) -> Self;
}

// SAFETY: identity.
unsafe impl WorkItem for usize {
    #[inline]
    fn into_word(self) -> usize {
        self
    }

    #[inline]
    unsafe fn from_word(word: usize) -> Self {
        word
    }
}

// SAFETY: object references are non-zero header addresses.
unsafe impl WorkItem for ObjRef {
    #[inline]
    fn into_word(self) -> usize {
        self.addr()
    }

    #[inline]
    unsafe fn from_word(word: usize) -> Self {
        // SAFETY: produced by `into_word`, so non-zero.
        unsafe { Self::from_addr(word).unwrap_unchecked() }
    }
}

/// Lock-free bounded work-stealing deque.
///
/// # Invariants
///
/// - `N` is a power of two
/// - the queue is empty when `bottom == top`
/// - the queue is full when `bottom - top == N`
/// - only the owner calls [`push`](Self::push) and [`pop`](Self::pop)
#[derive(Debug)]
pub struct StealQueue<T: WorkItem, const N: usize> {
    buffer: [AtomicUsize; N],
    bottom: AtomicUsize,
    top: AtomicUsize,
    _items: PhantomData<T>,
}

impl<T: WorkItem, const N: usize> StealQueue<T, N> {
    const MASK: usize = N - 1;

    /// Creates an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of two.
    #[must_use]
    pub const fn new() -> Self {
        assert!(N.is_power_of_two(), "StealQueue size N must be a power of 2");
        Self {
            buffer: [const { AtomicUsize::new(0) }; N],
            bottom: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
            _items: PhantomData,
        }
    }

    /// Pushes at the owner's end. Returns `false` if the queue is full.
    pub fn push(&self, item: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b.wrapping_sub(t) >= N {
            return false;
        }
        self.buffer[b & Self::MASK].store(item.into_word(), Ordering::Relaxed);
        // Publishes the slot before the new bottom.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pops at the owner's end.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        if b == self.top.load(Ordering::Relaxed) {
            return None;
        }
        let new_b = b.wrapping_sub(1);
        self.bottom.store(new_b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t.wrapping_sub(new_b) as isize > 0 {
            // Emptied by thieves between the checks.
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }

        let word = self.buffer[new_b & Self::MASK].load(Ordering::Relaxed);
        if t != new_b {
            // SAFETY: the slot was written by `push`.
            return Some(unsafe { T::from_word(word) });
        }

        // Last item: race the thieves for it.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b, Ordering::Relaxed);
        // SAFETY: as above.
        won.then(|| unsafe { T::from_word(word) })
    }

    /// Steals from the thieves' end.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if b.wrapping_sub(t) as isize <= 0 {
            return None;
        }

        // Read before claiming: once `top` moves the owner may reuse the slot.
        let word = self.buffer[t & Self::MASK].load(Ordering::Relaxed);
        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            // SAFETY: the claimed slot was written by `push`.
            .map(|_| unsafe { T::from_word(word) })
    }

    /// Current number of items; a snapshot under concurrency.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let len = b.wrapping_sub(t);
        if len as isize > 0 {
            len
        } else {
            0
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: WorkItem, const N: usize> Default for StealQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
