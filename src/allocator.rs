//! Per-core slab allocator for a single size class.
//!
//! Each allocator owns the slices it has acquired and partitions its free
//! lists by logical core: the hot alloc/free path only touches the calling
//! (or owning) core's metadata behind a narrow mutex. Cross-core interaction
//! is limited to the hand-off of fully-free slices through a shared pool, so
//! cores can rebalance without contending on a global lock.

use std::ptr::NonNull;

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;

use crate::hugepage::{self, HugepageExtent};
use crate::slice::{SliceRef, OWNER_NONE};

/// Per-core slab metadata.
///
/// `partial` holds this core's slices that still have at least one free
/// slot; full slices leave the list and re-enter when one of their objects
/// is freed.
#[derive(Default)]
struct CoreSlabs {
    partial: Vec<SliceRef>,
    slices_inuse: usize,
    objects_inuse: usize,
}

struct CoreMetadata {
    slabs: Mutex<CoreSlabs>,
}

/// Slab allocator for one object size class.
pub(crate) struct SlabAllocator {
    class_index: u8,
    object_size: u32,
    core_count: u16,
    cores: Box<[CoreMetadata]>,
    /// Fully-free slices published for any core to claim before growing.
    available: Injector<SliceRef>,
    /// Owns the backing extents; unmapped at teardown.
    extents: Mutex<Vec<HugepageExtent>>,
}

impl SlabAllocator {
    pub(crate) fn new(class_index: u8, object_size: usize, core_count: u16) -> Self {
        debug_assert!(core_count > 0);
        let cores = (0..core_count)
            .map(|_| CoreMetadata {
                slabs: Mutex::new(CoreSlabs::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            class_index,
            object_size: object_size as u32,
            core_count,
            cores,
            available: Injector::new(),
            extents: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn object_size(&self) -> usize {
        self.object_size as usize
    }

    /// Allocate one object on the given core.
    ///
    /// Returns `None` only if backing memory could not be acquired.
    pub(crate) fn alloc(&self, core_index: u16) -> Option<NonNull<u8>> {
        let core = &self.cores[core_index as usize];

        loop {
            let mut slabs = core.slabs.lock();

            if let Some(&slice) = slabs.partial.last() {
                if let Some(ptr) = slice.pop_free() {
                    if slice.is_full() {
                        slabs.partial.pop();
                    }
                    slabs.objects_inuse += 1;
                    return Some(ptr);
                }
                // Invariant: slices on the partial list have a free slot.
                debug_assert!(false, "full slice on partial list");
                slabs.partial.pop();
                continue;
            }

            if self.try_acquire_available(&mut slabs, core_index) {
                continue;
            }

            // Grow outside the core lock: extent allocation can fail and
            // must never happen under the metadata lock.
            drop(slabs);
            self.grow(core_index)?;
        }
    }

    /// Claim a fully-free slice from the shared pool, if one is parked there.
    fn try_acquire_available(&self, slabs: &mut CoreSlabs, core_index: u16) -> bool {
        loop {
            match self.available.steal() {
                Steal::Success(slice) => {
                    slice.set_owner_core(core_index);
                    slabs.partial.push(slice);
                    slabs.slices_inuse += 1;
                    return true;
                }
                Steal::Empty => return false,
                Steal::Retry => {}
            }
        }
    }

    /// Acquire one more slice from the OS and publish it to a core.
    fn grow(&self, core_index: u16) -> Option<()> {
        let extent = match hugepage::allocate_extent() {
            Ok(extent) => extent,
            Err(e) => {
                log::warn!(
                    target: "slabtable::allocator",
                    "slice allocation failed for {}B class: {}",
                    self.object_size,
                    e
                );
                return None;
            }
        };

        // SAFETY: the extent is freshly mapped, exclusively ours, and
        // EXTENT_SIZE-aligned
        let ptr = unsafe { NonNull::new_unchecked(extent.as_ptr()) };
        let slice = unsafe { SliceRef::init(ptr, self.class_index, self.object_size) };

        self.extents.lock().push(extent);

        let mut slabs = self.cores[core_index as usize].slabs.lock();
        slice.set_owner_core(core_index);
        slabs.partial.push(slice);
        slabs.slices_inuse += 1;

        log::debug!(
            target: "slabtable::allocator",
            "grew {}B class on core {} ({} slots)",
            self.object_size,
            core_index,
            slice.objects_total()
        );

        Some(())
    }

    /// Return an object to its slice.
    ///
    /// The free is applied under the *owning* core's lock, which may differ
    /// from the calling core.
    pub(crate) fn free(&self, ptr: NonNull<u8>, slice: SliceRef) {
        let owner = slice.owner_core();
        debug_assert!(owner != OWNER_NONE, "free into pooled slice");
        debug_assert!(owner < self.core_count);

        let mut slabs = self.cores[owner as usize].slabs.lock();

        let was_full = slice.push_free(ptr);
        slabs.objects_inuse -= 1;

        if was_full {
            slabs.partial.push(slice);
        } else if slice.is_empty() && slabs.partial.len() > 1 {
            // Keep one warm slice per core; surplus fully-free slices are
            // made available for other cores to claim.
            slabs.partial.retain(|s| *s != slice);
            slabs.slices_inuse -= 1;
            slice.set_owner_core(OWNER_NONE);
            self.available.push(slice);
        }
    }

    /// Number of slices currently owned by a core.
    pub(crate) fn slices_inuse_count(&self, core_index: u16) -> usize {
        self.cores[core_index as usize].slabs.lock().slices_inuse
    }

    /// Number of live objects attributed to a core.
    pub(crate) fn objects_inuse_count(&self, core_index: u16) -> usize {
        self.cores[core_index as usize].slabs.lock().objects_inuse
    }

    /// Total slices this allocator has acquired from the OS.
    #[cfg(test)]
    pub(crate) fn slices_total(&self) -> usize {
        self.extents.lock().len()
    }
}
