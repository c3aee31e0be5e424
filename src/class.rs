//! Predefined object size classes.
//!
//! Every slab allocation is rounded up to one of a fixed, ascending set of
//! power-of-two object sizes. Each size class owns exactly one
//! [`SlabAllocator`](crate::allocator::SlabAllocator) instance inside the
//! registry.

/// Predefined object sizes in bytes, ascending powers of two.
pub const OBJECT_SIZES: &[usize] = &[
    16,    // 0
    32,    // 1
    64,    // 2
    128,   // 3
    256,   // 4
    512,   // 5
    1024,  // 6: 1KiB
    2048,  // 7
    4096,  // 8: 4KiB
    8192,  // 9
    16384, // 10: 16KiB
    32768, // 11
    65536, // 12: 64KiB
];

/// Smallest supported object size.
pub(crate) const OBJECT_SIZE_MIN: usize = OBJECT_SIZES[0];

/// Largest supported object size.
pub(crate) const OBJECT_SIZE_MAX: usize = OBJECT_SIZES[OBJECT_SIZES.len() - 1];

/// Number of predefined size classes.
pub(crate) const CLASS_COUNT: usize = OBJECT_SIZES.len();

/// Find the index of the smallest size class that fits `size`.
///
/// Returns `None` if `size` is zero or exceeds the largest class.
#[inline]
pub fn class_for_size(size: usize) -> Option<u8> {
    if size == 0 || size > OBJECT_SIZE_MAX {
        return None;
    }
    let rounded = size.max(OBJECT_SIZE_MIN).next_power_of_two();
    Some((rounded.trailing_zeros() - OBJECT_SIZE_MIN.trailing_zeros()) as u8)
}

/// Get the object size for a class index.
#[inline]
pub fn class_size(class_index: u8) -> Option<usize> {
    OBJECT_SIZES.get(class_index as usize).copied()
}
