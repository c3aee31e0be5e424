//! Hugepage-backed slice extents.
//!
//! Slices are 2 MiB extents allocated with mmap, preferring explicit
//! `MAP_HUGETLB` pages on Linux and falling back to regular pages with a THP
//! hint. Extents are always aligned to their own size: the allocator locates
//! a slice header from an interior object pointer by address masking, which
//! only works when every extent starts on a 2 MiB boundary.

use std::io;
use std::ptr::NonNull;

/// Size (and alignment) of one slice extent: 2 MiB.
pub(crate) const EXTENT_SIZE: usize = 2 * 1024 * 1024;

/// One mmap-backed, extent-aligned memory extent.
pub(crate) struct HugepageExtent {
    ptr: NonNull<u8>,
}

// Safety: the extent is just raw memory, safe to send between threads.
unsafe impl Send for HugepageExtent {}
unsafe impl Sync for HugepageExtent {}

impl HugepageExtent {
    /// Get a pointer to the start of the extent.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HugepageExtent {
    fn drop(&mut self) {
        unsafe {
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, EXTENT_SIZE);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

/// Allocate one 2 MiB extent, aligned to 2 MiB.
///
/// Tries explicit hugepages first (Linux), then falls back to regular pages
/// with a transparent-hugepage hint. Both paths guarantee alignment.
pub(crate) fn allocate_extent() -> io::Result<HugepageExtent> {
    #[cfg(target_os = "linux")]
    match try_mmap_hugetlb(EXTENT_SIZE) {
        Ok(ptr) => return Ok(HugepageExtent { ptr }),
        Err(e) => {
            log::debug!(
                target: "slabtable::hugepage",
                "2MB hugepage allocation failed ({}), falling back to regular pages",
                e
            );
        }
    }

    allocate_aligned_regular(EXTENT_SIZE)
}

/// Try to allocate memory using explicit 2 MiB hugepages.
///
/// `MAP_HUGETLB` mappings are naturally aligned to the hugepage size.
#[cfg(target_os = "linux")]
fn try_mmap_hugetlb(size: usize) -> io::Result<NonNull<u8>> {
    // MAP_HUGE_2MB = 21 << MAP_HUGE_SHIFT
    const MAP_HUGE_SHIFT: libc::c_int = 26;
    const MAP_HUGE_2MB: libc::c_int = 21 << MAP_HUGE_SHIFT;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | MAP_HUGE_2MB,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: mmap returned a non-null mapping
    Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
}

/// Allocate with regular pages, trimming an oversized mapping so the
/// surviving region is aligned to `align`.
fn allocate_aligned_regular(align: usize) -> io::Result<HugepageExtent> {
    let map_len = EXTENT_SIZE + align;

    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    let addr = raw as usize;
    let aligned = (addr + align - 1) & !(align - 1);
    let head = aligned - addr;
    let tail = map_len - head - EXTENT_SIZE;

    // Trim the unaligned head and the leftover tail so exactly one aligned
    // extent remains mapped.
    unsafe {
        if head > 0 {
            let result = libc::munmap(raw, head);
            debug_assert_eq!(result, 0, "munmap of head failed");
        }
        if tail > 0 {
            let result = libc::munmap((aligned + EXTENT_SIZE) as *mut libc::c_void, tail);
            debug_assert_eq!(result, 0, "munmap of tail failed");
        }
    }

    // Best-effort THP hint (Linux only).
    #[cfg(target_os = "linux")]
    unsafe {
        let _ = libc::madvise(
            aligned as *mut libc::c_void,
            EXTENT_SIZE,
            libc::MADV_HUGEPAGE,
        );
    }

    // Pre-fault so the hot path never takes a first-touch page fault.
    let ptr = aligned as *mut u8;
    let mut offset = 0;
    while offset < EXTENT_SIZE {
        unsafe { ptr.add(offset).write_volatile(0) };
        offset += 4096;
    }

    // SAFETY: aligned is inside the surviving mapping and non-null
    Ok(HugepageExtent {
        ptr: unsafe { NonNull::new_unchecked(ptr) },
    })
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_extent_is_aligned() {
        let extent = allocate_extent().expect("allocation failed");
        assert_eq!(extent.as_ptr() as usize % EXTENT_SIZE, 0);
    }

    #[test]
    fn test_extent_is_writable() {
        let extent = allocate_extent().expect("allocation failed");
        unsafe {
            extent.as_ptr().write(0xAB);
            extent.as_ptr().add(EXTENT_SIZE - 1).write(0xCD);
            assert_eq!(extent.as_ptr().read(), 0xAB);
            assert_eq!(extent.as_ptr().add(EXTENT_SIZE - 1).read(), 0xCD);
        }
    }

    #[test]
    fn test_extents_do_not_overlap() {
        let a = allocate_extent().expect("allocation failed");
        let b = allocate_extent().expect("allocation failed");
        let (lo, hi) = if a.as_ptr() < b.as_ptr() {
            (a.as_ptr(), b.as_ptr())
        } else {
            (b.as_ptr(), a.as_ptr())
        };
        assert!(unsafe { lo.add(EXTENT_SIZE) } <= hi);
    }
}
