//! Platform layer: page-aligned memory mapping and stack capture.

use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap and munmap
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// Anonymous read-write mapping of `len` bytes.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
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
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap with the same length
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

/// Alignment of mappings returned by [`map_memory`].
pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of zeroed, OS-page-aligned memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous mapping, result is null-checked below
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// Returns a mapping obtained from [`map_memory`] to the OS.
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from map_memory with the same size
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Approximates the current stack pointer through an opaque call boundary.
///
/// The call itself is the register barrier: the compiler must assume the
/// callee observes memory, so values that conservative scanning needs to see
/// should be spilled to the caller's frame. Pointers held only in registers
/// are not guaranteed to be found; hosts keep a pointer observable with
/// `std::hint::black_box(&p)`.
#[inline(never)]
pub fn stack_pointer() -> *const u8 {
    let marker = 0u8;
    std::hint::black_box(&marker as *const u8)
}

/// Runs `f` with a stack base captured above `f`'s own frame.
///
/// Every frame entered from inside `f` lies below the marker, so a scan up
/// to the passed base covers all of `f`'s locals. Hosts call this at the
/// outermost point that may hold managed pointers.
#[inline(never)]
pub fn with_stack_base<R>(f: impl FnOnce(*const u8) -> R) -> R {
    let marker = 0usize;
    call_below(std::hint::black_box(&raw const marker as *const u8), f)
}

// Separate, never-inlined call frame: keeps `f`'s locals strictly below
// the marker even when `f` itself gets inlined.
#[inline(never)]
fn call_below<R>(base: *const u8, f: impl FnOnce(*const u8) -> R) -> R {
    f(base)
}
