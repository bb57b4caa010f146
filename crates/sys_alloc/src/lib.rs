//! Zeroed anonymous page mappings.
//!
//! Every heap page of the collector is backed by one [`Mmap`]. Mappings are
//! private, read-write and zero-filled by the OS, which lets the heap treat a
//! fresh page as a run of all-zero atomic cells without initializing it.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a multiple of the system page size.
#[must_use]
pub fn round_to_page(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// A handle to a zero-filled anonymous mapping.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> NonNull<u8> {
        // SAFETY: a successful mapping never starts at address zero.
        unsafe { NonNull::new_unchecked(self.inner.ptr()) }
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty, which a live mapping never is.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside this mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.inner.ptr() as usize;
        addr >= start && addr < start + self.inner.len()
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
// SAFETY: the handle itself is immutable; callers synchronize access to the bytes.
unsafe impl Sync for Mmap {}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.inner.ptr())
            .field("len", &self.inner.len())
            .finish()
    }
}

/// Configuration for creating a mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates options for an empty mapping. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes. It is rounded up to whole pages.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Prefaults the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates a zero-filled anonymous mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length and the OS error if the
    /// mapping could not be created.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = round_to_page(self.len);
        // SAFETY: no address hint is passed, so the OS picks a fresh region.
        let inner = unsafe { os::MmapInner::map_anon(len, self.populate)? };
        Ok(Mmap { inner })
    }
}
