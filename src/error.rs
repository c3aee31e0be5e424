//! Error types for allocator and hashtable operations.

use std::fmt;

/// Errors that can occur during allocator or hashtable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Backing memory could not be acquired (hugepage or slice exhaustion).
    /// Recoverable: the caller may retry, evict, or fail the request.
    OutOfMemory,

    /// The hashtable has no empty slot in the probe neighborhood and resize
    /// is already in progress (structural exhaustion).
    TableFull,

    /// The key exceeds the maximum supported length (64 KiB).
    KeyTooLong,

    /// The requested size maps to no predefined size class.
    /// This is a programming-contract violation; debug builds assert.
    InvalidSizeClass,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TableFull => write!(f, "hashtable full"),
            Self::KeyTooLong => write!(f, "key too long (max 64KiB)"),
            Self::InvalidSizeClass => write!(f, "no size class for requested size"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for allocator and hashtable operations.
pub type Result<T> = std::result::Result<T, Error>;
