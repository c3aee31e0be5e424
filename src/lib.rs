//! slabtable: slab-allocated memory and concurrent key lookup for cache engines.
//!
//! This crate provides the two memory-management subsystems at the core of a
//! high-performance in-memory cache:
//!
//! - **Slab allocator**: per-core arenas of fixed-size slots carved out of
//!   2 MiB hugepage-backed slices, with one allocator per power-of-two size
//!   class (16 B .. 64 KiB)
//! - **Concurrent hashtable**: bucket -> chunk -> slot addressing with
//!   inline/external key storage, lock-free reads, per-chunk write exclusion,
//!   and live resize via generation migration
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------+
//! |                    Hashtable                      |
//! |  +---------------------+  +--------------------+  |
//! |  | current generation  |  | next generation    |  |
//! |  | buckets/chunks/slots|  | (during migration) |  |
//! |  +----------+----------+  +--------------------+  |
//! +-------------|-------------------------------------+
//!               | external key buffers
//!               v
//! +---------------------------------------------------+
//! |               AllocatorRegistry                   |
//! |  +---------------+ +---------------+              |
//! |  | class 16B     | | class 32B     |  ... 64KiB   |
//! |  | per-core free | | per-core free |              |
//! |  | slice lists   | | slice lists   |              |
//! |  +-------+-------+ +-------+-------+              |
//! +----------|-----------------|----------------------+
//!            v                 v
//!      2 MiB hugepage slices (header + slots)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use slabtable::{AllocatorRegistry, Hashtable};
//!
//! let registry = AllocatorRegistry::new(4);
//! let table = Hashtable::new(1_000, registry.clone());
//!
//! table.op_set(b"some key", 42).unwrap();
//! assert_eq!(table.op_get(b"some key"), Some(42));
//! assert!(table.op_delete(b"some key"));
//! ```
//!
//! Threads serving cache traffic should be pinned to a core by the caller and
//! registered with [`bind_current_thread`] so allocations hit that core's
//! free lists without contention.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod allocator;
mod chunk;
mod class;
mod config;
mod cores;
mod error;
mod hashtable;
mod hugepage;
mod registry;
mod resize;
mod slice;
mod sync;

pub use class::{class_for_size, class_size, OBJECT_SIZES};
pub use config::{Config, DEFAULT_BUCKETS};
pub use cores::bind_current_thread;
pub use error::{Error, Result};
pub use hashtable::{Hashtable, TableState};
pub use registry::AllocatorRegistry;
