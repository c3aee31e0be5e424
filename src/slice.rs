//! Slices: hugepage extents carved into fixed-size slots.
//!
//! A slice is one 2 MiB extent holding, in order: a fixed header, a side
//! array of `u32` free-list links (one per slot), and a 64-byte-aligned data
//! area of equally sized slots. Keeping the free list in a side index array
//! means slot memory is never reinterpreted as list nodes, so a slot's
//! "in-use" bytes and its free-list link never alias.
//!
//! Because extents are aligned to their own size, the owning slice of any
//! object pointer is found by masking the address down to the extent
//! boundary.

use std::ptr::NonNull;

use crate::hugepage::EXTENT_SIZE;
use crate::sync::{AtomicU16, AtomicU32, Ordering};

/// Sentinel for "no slot" in the free-list links.
const FREE_NONE: u32 = u32::MAX;

/// Identifies slice memory in debug assertions on the free path.
const SLICE_MAGIC: u64 = 0x534c_4243_4845_0001;

/// Owner value for slices parked in the shared available pool.
pub(crate) const OWNER_NONE: u16 = u16::MAX;

/// Header stored at the start of every slice extent.
///
/// All mutable fields except `owner_core` are only touched while holding the
/// owning core's metadata lock; they are atomics so concurrent metric reads
/// stay defined behavior.
#[repr(C, align(64))]
pub(crate) struct SliceHeader {
    magic: u64,
    object_size: u32,
    objects_total: u32,
    objects_inuse: AtomicU32,
    free_head: AtomicU32,
    data_offset: u32,
    class_index: u8,
    owner_core: AtomicU16,
}

/// A shared handle to a slice header living inside its extent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SliceRef(NonNull<SliceHeader>);

// Safety: the header lives in stable mmap-backed memory for the lifetime of
// the owning allocator; mutation is serialized by the core metadata locks.
unsafe impl Send for SliceRef {}
unsafe impl Sync for SliceRef {}

impl PartialEq for SliceRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl SliceRef {
    /// Initialize a fresh extent as a slice for one size class.
    ///
    /// # Safety
    ///
    /// `extent` must point to the start of an exclusively owned, writable
    /// extent of `EXTENT_SIZE` bytes aligned to `EXTENT_SIZE`.
    pub(crate) unsafe fn init(extent: NonNull<u8>, class_index: u8, object_size: u32) -> SliceRef {
        debug_assert_eq!(extent.as_ptr() as usize % EXTENT_SIZE, 0);

        let (slots, data_offset) = slice_layout(object_size as usize);
        let header = extent.as_ptr() as *mut SliceHeader;

        // SAFETY: extent is exclusively owned and large enough for the
        // header, the links array and `slots` objects (slice_layout invariant)
        unsafe {
            header.write(SliceHeader {
                magic: SLICE_MAGIC,
                object_size,
                objects_total: slots as u32,
                objects_inuse: AtomicU32::new(0),
                free_head: AtomicU32::new(0),
                data_offset: data_offset as u32,
                class_index,
                owner_core: AtomicU16::new(OWNER_NONE),
            });

            let links = links_ptr(header);
            for i in 0..slots {
                let next = if i + 1 < slots { i as u32 + 1 } else { FREE_NONE };
                links.add(i).write(next);
            }

            SliceRef(NonNull::new_unchecked(header))
        }
    }

    /// Recover the owning slice from a pointer to one of its objects.
    ///
    /// # Safety
    ///
    /// `ptr` must point into the data area of a live slice.
    #[inline]
    pub(crate) unsafe fn from_object_ptr(ptr: NonNull<u8>) -> SliceRef {
        let base = (ptr.as_ptr() as usize) & !(EXTENT_SIZE - 1);
        let header = base as *mut SliceHeader;
        // SAFETY: masking an in-slice pointer lands on the extent start
        unsafe {
            debug_assert_eq!(
                (*header).magic,
                SLICE_MAGIC,
                "pointer does not belong to a slab slice"
            );
            SliceRef(NonNull::new_unchecked(header))
        }
    }

    #[inline]
    fn header(&self) -> &SliceHeader {
        // SAFETY: the header outlives every SliceRef (extents are unmapped
        // only at allocator teardown)
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn class_index(&self) -> u8 {
        self.header().class_index
    }

    #[inline]
    pub(crate) fn objects_total(&self) -> u32 {
        self.header().objects_total
    }

    #[inline]
    pub(crate) fn objects_inuse(&self) -> u32 {
        self.header().objects_inuse.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.header().free_head.load(Ordering::Relaxed) == FREE_NONE
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.objects_inuse() == 0
    }

    #[inline]
    pub(crate) fn owner_core(&self) -> u16 {
        self.header().owner_core.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_owner_core(&self, core_index: u16) {
        self.header().owner_core.store(core_index, Ordering::Release);
    }

    /// Pop one free slot, returning a pointer to its object storage.
    ///
    /// Caller must hold the owning core's metadata lock.
    pub(crate) fn pop_free(&self) -> Option<NonNull<u8>> {
        let header = self.header();
        let head = header.free_head.load(Ordering::Relaxed);
        if head == FREE_NONE {
            return None;
        }

        // SAFETY: head < objects_total while on the free list
        let next = unsafe { links_ptr(self.0.as_ptr()).add(head as usize).read() };
        header.free_head.store(next, Ordering::Relaxed);
        header.objects_inuse.fetch_add(1, Ordering::Relaxed);

        let data = self.0.as_ptr() as usize + header.data_offset as usize;
        let ptr = data + head as usize * header.object_size as usize;
        // SAFETY: slot addresses are non-null interior extent pointers
        Some(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
    }

    /// Return an object's slot to the free list.
    ///
    /// Caller must hold the owning core's metadata lock. Returns `true` if
    /// the slice was full before this push.
    pub(crate) fn push_free(&self, ptr: NonNull<u8>) -> bool {
        let header = self.header();
        let data = self.0.as_ptr() as usize + header.data_offset as usize;
        let offset = ptr.as_ptr() as usize - data;

        debug_assert_eq!(offset % header.object_size as usize, 0);
        let index = (offset / header.object_size as usize) as u32;
        debug_assert!(index < header.objects_total);

        let head = header.free_head.load(Ordering::Relaxed);
        // SAFETY: index < objects_total, checked above
        unsafe { links_ptr(self.0.as_ptr()).add(index as usize).write(head) };
        header.free_head.store(index, Ordering::Relaxed);
        header.objects_inuse.fetch_sub(1, Ordering::Relaxed);

        head == FREE_NONE
    }
}

/// Pointer to the free-list links array, stored right after the header.
#[inline]
unsafe fn links_ptr(header: *mut SliceHeader) -> *mut u32 {
    // SAFETY: caller guarantees header points at a slice extent; the links
    // array begins at the first byte past the (64-byte aligned) header
    unsafe { (header as *mut u8).add(std::mem::size_of::<SliceHeader>()) as *mut u32 }
}

/// Compute `(slots_count, data_offset)` for an object size.
///
/// The data area starts 64-byte aligned after the header and links array and
/// holds as many slots as fit in the extent.
pub(crate) fn slice_layout(object_size: usize) -> (usize, usize) {
    let header = std::mem::size_of::<SliceHeader>();
    let mut slots = (EXTENT_SIZE - header) / (object_size + 4);

    loop {
        let data_offset = round_up(header + slots * 4, 64);
        if data_offset + slots * object_size <= EXTENT_SIZE {
            return (slots, data_offset);
        }
        slots -= 1;
    }
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
