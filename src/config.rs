//! Configuration for assembling an allocator registry and hashtable pair.

use std::sync::Arc;

use crate::hashtable::Hashtable;
use crate::registry::AllocatorRegistry;

/// Default bucket count for a new table (2^16 = 64K buckets).
pub const DEFAULT_BUCKETS: usize = 65536;

/// Configuration for a registry/hashtable pair.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical cores the slab allocators partition their free lists across.
    pub core_count: usize,
    /// Initial hashtable bucket count (rounded up to a power of two).
    pub initial_buckets: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            initial_buckets: DEFAULT_BUCKETS,
        }
    }
}

impl Config {
    /// Build the allocator registry and a hashtable backed by it.
    ///
    /// The registry is also returned so callers can allocate value storage
    /// from the same slab classes the table draws its key buffers from.
    pub fn build(&self) -> (Arc<AllocatorRegistry>, Hashtable) {
        let registry = AllocatorRegistry::new(self.core_count);
        let table = Hashtable::new(self.initial_buckets, registry.clone());
        (registry, table)
    }
}
