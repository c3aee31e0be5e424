//! Logical core identification for per-core allocator state.
//!
//! The allocator partitions its metadata by logical core index. Threads that
//! the caller has pinned should register their core with
//! [`bind_current_thread`]; unbound threads fall back to `sched_getcpu` on
//! Linux (or a stable per-thread hash elsewhere), which is correct but may
//! touch a different core's free list after an OS migration.

use std::cell::Cell;

thread_local! {
    static BOUND_CORE: Cell<Option<u16>> = const { Cell::new(None) };
}

/// Register the logical core index of the calling thread.
///
/// Pinning the thread to that core (e.g. via `sched_setaffinity`) is the
/// caller's responsibility; this only tells the allocator which per-core
/// free lists to use.
pub fn bind_current_thread(core_index: u16) {
    BOUND_CORE.with(|c| c.set(Some(core_index)));
}

/// Resolve the logical core index for the calling thread, clamped to
/// `core_count`.
#[inline]
pub(crate) fn current_core(core_count: u16) -> u16 {
    debug_assert!(core_count > 0);
    let core = BOUND_CORE.with(|c| c.get()).unwrap_or_else(detected_core);
    core % core_count
}

#[cfg(target_os = "linux")]
fn detected_core() -> u16 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        cpu as u16
    } else {
        thread_hash()
    }
}

#[cfg(not(target_os = "linux"))]
fn detected_core() -> u16 {
    thread_hash()
}

/// Stable per-thread fallback when the OS cannot report the current CPU.
fn thread_hash() -> u16 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as u16
}
