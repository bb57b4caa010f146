use std::io::{self, Error};
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system page size.
pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    // SAFETY: GetSystemInfo only writes into the provided struct.
    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

pub struct MmapInner {
    ptr: *mut u8,
    len: usize,
}

impl MmapInner {
    /// Commits `len` bytes of zeroed read-write memory.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize, _populate: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
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
            // SAFETY: no base address is requested.
            let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
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
        // SAFETY: MEM_RELEASE requires a zero size and the base of the reservation.
        unsafe {
            VirtualFree(self.ptr.cast::<std::ffi::c_void>(), 0, MEM_RELEASE);
        }
    }
}
