//! Anonymous memory mappings backing the heap regions.

use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod sys {
    use core::ffi::c_void;

    const PROT_READ: i32 = 0x1;
    const PROT_WRITE: i32 = 0x2;
    const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const MAP_ANON: i32 = 0x1000;
    const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    pub fn reserve(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping, no fd, no fixed address.
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if p as isize == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// `ptr`/`len` must describe a mapping produced by [`reserve`].
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // SAFETY: per contract.
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

/// Maps `size` zero-initialized bytes, or `None` when the OS refuses.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    NonNull::new(sys::reserve(size))
}

/// Returns a mapping obtained from [`map_memory`] to the OS.
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: pointer originates from map_memory.
    unsafe { sys::release(ptr.as_ptr(), size) };
}
