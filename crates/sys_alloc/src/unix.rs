use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

/// Returns the system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[cfg(miri)]
            let page_size = 4096;
            #[cfg(not(miri))]
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut u8,
    len: usize,
}

impl MmapInner {
    /// Maps `len` bytes of private anonymous memory.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize, populate: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            let _ = populate;
            let layout = std::alloc::Layout::from_size_align(len, page_size())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            // SAFETY: layout has a non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self { ptr, len })
        }
        #[cfg(not(miri))]
        {
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON | if populate { MAP_POPULATE } else { 0 };
            let prot = libc::PROT_READ | libc::PROT_WRITE;

            // SAFETY: anonymous mapping with no fixed address.
            let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
            if ptr == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            Ok(Self {
                ptr: ptr.cast::<u8>(),
                len,
            })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        #[cfg(miri)]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.len, page_size()) {
                // SAFETY: allocated in `map_anon` with the same layout.
                unsafe { std::alloc::dealloc(self.ptr, layout) };
            }
        }
        #[cfg(not(miri))]
        // SAFETY: `ptr`/`len` describe a mapping created by `map_anon`.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}
