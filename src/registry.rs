//! Process-wide registry of the predefined slab allocators.
//!
//! One [`SlabAllocator`] exists per size class. The registry is constructed
//! explicitly (no hidden singleton) and shared by `Arc` between the hashtable
//! and any other object-storage caller. Requests are rounded up to the
//! nearest class and served from the calling core's free lists.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocator::SlabAllocator;
use crate::class::{class_for_size, CLASS_COUNT, OBJECT_SIZES};
use crate::cores;
use crate::error::{Error, Result};
use crate::slice::SliceRef;
use crate::sync::{AtomicBool, Ordering};

/// Prefix reserved ahead of objects handed out by the disabled-mode
/// system-allocator fallback; holds the allocation size for `dealloc`.
const FALLBACK_HEADER: usize = 64;

/// Registry owning one slab allocator per predefined size class.
pub struct AllocatorRegistry {
    core_count: u16,
    allocators: Vec<SlabAllocator>,
    /// Kill switch for teardown/testing: when false, alloc/free route to the
    /// system allocator instead of the slab path.
    enabled: AtomicBool,
}

impl AllocatorRegistry {
    /// Create a registry with per-core metadata for `core_count` logical
    /// cores, one allocator per size class.
    pub fn new(core_count: usize) -> Arc<Self> {
        assert!(core_count > 0 && core_count < u16::MAX as usize);
        let core_count = core_count as u16;

        let allocators = OBJECT_SIZES
            .iter()
            .enumerate()
            .map(|(i, &size)| SlabAllocator::new(i as u8, size, core_count))
            .collect();

        Arc::new(Self {
            core_count,
            allocators,
            enabled: AtomicBool::new(true),
        })
    }

    /// Number of logical cores this registry partitions state across.
    #[inline]
    pub fn core_count(&self) -> usize {
        self.core_count as usize
    }

    /// Enable or disable the slab path.
    ///
    /// Intended for teardown and testing. Toggling while slab-owned objects
    /// are outstanding is a contract violation: every object must be freed
    /// in the mode it was allocated in (debug builds catch mismatches via
    /// the slice magic assertion).
    pub fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[inline]
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Allocate `size` bytes, rounded up to the nearest size class.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if !self.is_enabled() {
            return fallback_alloc(size);
        }

        let Some(class) = class_for_size(size) else {
            debug_assert!(false, "no size class for {size} bytes");
            return Err(Error::InvalidSizeClass);
        };

        let core = cores::current_core(self.core_count);
        self.allocators[class as usize]
            .alloc(core)
            .ok_or(Error::OutOfMemory)
    }

    /// Allocate `size` bytes of zero-filled memory.
    pub fn alloc_zero(&self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        // Slab memory is recycled, so it must be cleared explicitly.
        // SAFETY: ptr points to at least `size` writable bytes (class >= size)
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Resize an allocation.
    ///
    /// When both sizes round to the same class, the object is returned
    /// unchanged. Otherwise new storage is allocated, `min(old, new)` bytes
    /// are copied and the old object is freed. `zero_new` clears the grown
    /// tail.
    pub fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        zero_new: bool,
    ) -> Result<NonNull<u8>> {
        if self.is_enabled() {
            let old_class = class_for_size(old_size);
            if old_class.is_some() && old_class == class_for_size(new_size) {
                if zero_new && new_size > old_size {
                    // SAFETY: the class covers new_size, so the tail is in
                    // bounds of the same slot
                    unsafe {
                        std::ptr::write_bytes(ptr.as_ptr().add(old_size), 0, new_size - old_size)
                    };
                }
                return Ok(ptr);
            }
        }

        let new_ptr = self.alloc(new_size)?;
        let copy_len = old_size.min(new_size);
        // SAFETY: both objects cover copy_len bytes and cannot overlap
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
            if zero_new && new_size > old_size {
                std::ptr::write_bytes(new_ptr.as_ptr().add(old_size), 0, new_size - old_size);
            }
        }
        self.free(ptr);
        Ok(new_ptr)
    }

    /// Free an object previously returned by this registry.
    pub fn free(&self, ptr: NonNull<u8>) {
        if !self.is_enabled() {
            fallback_free(ptr);
            return;
        }

        // SAFETY: ptr was handed out by a slab allocator of this registry,
        // so masking recovers its slice (debug-asserted via the magic field)
        let slice = unsafe { SliceRef::from_object_ptr(ptr) };
        let class = slice.class_index() as usize;
        debug_assert!(class < CLASS_COUNT);
        self.allocators[class].free(ptr, slice);
    }

    /// Number of slices a core holds for the class serving `object_size`.
    pub fn slices_inuse_count(&self, object_size: usize, core_index: usize) -> usize {
        match class_for_size(object_size) {
            Some(class) => {
                self.allocators[class as usize].slices_inuse_count(core_index as u16)
            }
            None => 0,
        }
    }

    /// Number of live objects a core holds for the class serving
    /// `object_size`.
    pub fn objects_inuse_count(&self, object_size: usize, core_index: usize) -> usize {
        match class_for_size(object_size) {
            Some(class) => {
                self.allocators[class as usize].objects_inuse_count(core_index as u16)
            }
            None => 0,
        }
    }

    /// Object size of the class that would serve a request of `size` bytes.
    pub fn class_object_size(&self, size: usize) -> Option<usize> {
        class_for_size(size).map(|class| self.allocators[class as usize].object_size())
    }
}

fn fallback_layout(size: usize) -> Layout {
    // Size is bounded by the largest class plus the header, so this cannot
    // overflow Layout's invariants.
    Layout::from_size_align(FALLBACK_HEADER + size, FALLBACK_HEADER)
        .expect("fallback layout is always valid")
}

fn fallback_alloc(size: usize) -> Result<NonNull<u8>> {
    if size == 0 || class_for_size(size).is_none() {
        debug_assert!(false, "no size class for {size} bytes");
        return Err(Error::InvalidSizeClass);
    }

    let layout = fallback_layout(size);
    // SAFETY: layout has non-zero size
    let base = unsafe { std::alloc::alloc(layout) };
    let Some(base) = NonNull::new(base) else {
        return Err(Error::OutOfMemory);
    };

    // SAFETY: the header prefix is in bounds and u64-aligned
    unsafe {
        (base.as_ptr() as *mut usize).write(size);
        Ok(NonNull::new_unchecked(base.as_ptr().add(FALLBACK_HEADER)))
    }
}

fn fallback_free(ptr: NonNull<u8>) {
    // SAFETY: ptr was produced by fallback_alloc, so the size header sits
    // FALLBACK_HEADER bytes before it
    unsafe {
        let base = ptr.as_ptr().sub(FALLBACK_HEADER);
        let size = (base as *const usize).read();
        std::alloc::dealloc(base, fallback_layout(size));
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_to_class() {
        let registry = AllocatorRegistry::new(1);

        let ptr = registry.alloc(20).unwrap();
        assert_eq!(registry.class_object_size(20), Some(32));
        assert_eq!(registry.objects_inuse_count(32, 0), 1);
        assert_eq!(registry.objects_inuse_count(16, 0), 0);

        registry.free(ptr);
        assert_eq!(registry.objects_inuse_count(32, 0), 0);
    }

    #[test]
    fn test_alloc_zero_is_zeroed() {
        let registry = AllocatorRegistry::new(1);

        // Dirty a slot, free it, then alloc_zero must hand back clean memory.
        let ptr = registry.alloc(64).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xFF, 64) };
        registry.free(ptr);

        let ptr = registry.alloc_zero(64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        registry.free(ptr);
    }

    #[test]
    fn test_realloc_same_class_keeps_pointer() {
        let registry = AllocatorRegistry::new(1);

        let ptr = registry.alloc(100).unwrap();
        let moved = registry.realloc(ptr, 100, 128, false).unwrap();
        assert_eq!(ptr, moved);
        registry.free(moved);
    }

    #[test]
    fn test_realloc_grows_and_copies() {
        let registry = AllocatorRegistry::new(1);

        let ptr = registry.alloc(16).unwrap();
        unsafe {
            for i in 0..16 {
                ptr.as_ptr().add(i).write(i as u8);
            }
        }

        let grown = registry.realloc(ptr, 16, 200, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 200) };
        for (i, &b) in bytes.iter().enumerate() {
            if i < 16 {
                assert_eq!(b, i as u8);
            } else {
                assert_eq!(b, 0, "grown tail not zeroed at {i}");
            }
        }
        registry.free(grown);
        assert_eq!(registry.objects_inuse_count(16, 0), 0);
        assert_eq!(registry.objects_inuse_count(256, 0), 0);
    }

    #[test]
    fn test_invalid_size_class() {
        let registry = AllocatorRegistry::new(1);
        // Larger than the biggest class; a contract violation in debug
        // builds, an error value in release.
        if cfg!(debug_assertions) {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| registry.alloc(65537)));
            assert!(result.is_err());
        } else {
            assert_eq!(registry.alloc(65537), Err(Error::InvalidSizeClass));
        }
    }

    #[test]
    fn test_disabled_mode_round_trip() {
        let registry = AllocatorRegistry::new(1);
        registry.enable(false);

        let ptr = registry.alloc_zero(48).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 48) };
        assert!(bytes.iter().all(|&b| b == 0));

        // No slab state was touched.
        assert_eq!(registry.objects_inuse_count(64, 0), 0);

        let grown = registry.realloc(ptr, 48, 4096, false).unwrap();
        registry.free(grown);
        registry.enable(true);
    }
}
