//! Hashtable chunks and slots.
//!
//! Each chunk holds a small fixed number of slots searched linearly. Writers
//! serialize on a per-chunk mutex; readers never lock. A slot's fields are
//! all atomics, published in write-then-occupied order so a reader that
//! observes the occupied state with Acquire always sees a fully written
//! entry, and a per-slot sequence counter rejects reads that raced a slot
//! reuse.
//!
//! Keys up to [`INLINE_KEY_MAX`] bytes are embedded in the slot; longer keys
//! live in a slab-allocated buffer owned by the slot. External key buffers
//! come from the registry's slab extents, which stay mapped for the
//! registry's lifetime, so a reader that raced a delete dereferences live
//! (possibly recycled) memory and the sequence re-check discards the result.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::Result;
use crate::registry::AllocatorRegistry;
use crate::sync::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Slots per chunk, scanned linearly.
pub(crate) const CHUNK_SLOTS: usize = 8;

/// Buckets that share one chunk.
pub(crate) const BUCKETS_PER_CHUNK: usize = 8;

/// Longest key stored inline in a slot.
pub(crate) const INLINE_KEY_MAX: usize = 23;

const SLOT_EMPTY: u8 = 0;
const SLOT_OCCUPIED: u8 = 1;

/// An owned key representation, detached from any slot.
///
/// Used to stage external-buffer allocation before chunk locks are taken and
/// to transfer buffer ownership between generations during migration.
pub(crate) enum KeyOwned {
    Inline {
        len: u8,
        bytes: [u8; INLINE_KEY_MAX],
    },
    External {
        ptr: NonNull<u8>,
        len: u32,
    },
}

// Safety: an External variant exclusively owns its buffer.
unsafe impl Send for KeyOwned {}

impl KeyOwned {
    /// Stage a key for insertion, allocating an external buffer when it
    /// exceeds the inline bound.
    pub(crate) fn prepare(key: &[u8], registry: &AllocatorRegistry) -> Result<KeyOwned> {
        if key.len() <= INLINE_KEY_MAX {
            let mut bytes = [0u8; INLINE_KEY_MAX];
            bytes[..key.len()].copy_from_slice(key);
            Ok(KeyOwned::Inline {
                len: key.len() as u8,
                bytes,
            })
        } else {
            let ptr = registry.alloc(key.len())?;
            // SAFETY: the allocation covers key.len() bytes
            unsafe {
                std::ptr::copy_nonoverlapping(key.as_ptr(), ptr.as_ptr(), key.len());
            }
            Ok(KeyOwned::External {
                ptr,
                len: key.len() as u32,
            })
        }
    }

    /// Release any external buffer this key owns.
    pub(crate) fn release(self, registry: &AllocatorRegistry) {
        if let KeyOwned::External { ptr, .. } = self {
            registry.free(ptr);
        }
    }

    /// View the key bytes.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            KeyOwned::Inline { len, bytes } => &bytes[..*len as usize],
            // SAFETY: an External variant exclusively owns its live buffer
            KeyOwned::External { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len as usize)
            },
        }
    }
}

/// One hashtable slot.
///
/// Every field is atomic so the lock-free read path is fully defined
/// behavior; writer/writer ordering comes from the chunk mutex.
pub(crate) struct Slot {
    state: AtomicU8,
    /// Odd while a writer is mutating the key fields; readers re-check it
    /// after a key compare to reject reads that overlapped a slot reuse.
    seq: AtomicU32,
    /// Key length; lengths above `INLINE_KEY_MAX` mean the key is external.
    key_len: AtomicU32,
    hash: AtomicU64,
    value: AtomicU64,
    /// External key buffer address, 0 when the key is inline.
    key_ext: AtomicU64,
    key_inline: [AtomicU8; INLINE_KEY_MAX],
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_EMPTY),
            seq: AtomicU32::new(0),
            key_len: AtomicU32::new(0),
            hash: AtomicU64::new(0),
            value: AtomicU64::new(0),
            key_ext: AtomicU64::new(0),
            key_inline: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    /// Reader-side key comparison. May race a slot reuse; the caller
    /// validates with the sequence counter afterwards.
    fn key_matches_reader(&self, key: &[u8]) -> bool {
        let len = self.key_len.load(Ordering::Acquire) as usize;
        if len != key.len() {
            return false;
        }

        if len <= INLINE_KEY_MAX {
            self.key_inline[..len]
                .iter()
                .zip(key)
                .all(|(slot_byte, &key_byte)| slot_byte.load(Ordering::Relaxed) == key_byte)
        } else {
            let ptr = self.key_ext.load(Ordering::Acquire) as *const u8;
            if ptr.is_null() {
                return false;
            }
            // Volatile byte loads: the buffer may be concurrently recycled by
            // a racing delete, but it stays mapped (slab-owned) and the seq
            // re-check rejects any value read alongside a stale match.
            key.iter()
                .enumerate()
                .all(|(i, &key_byte)| unsafe { ptr.add(i).read_volatile() } == key_byte)
        }
    }

    /// Writer-side key comparison; caller holds the chunk lock, so the key
    /// fields are stable.
    fn key_matches_writer(&self, key: &[u8]) -> bool {
        let len = self.key_len.load(Ordering::Relaxed) as usize;
        if len != key.len() {
            return false;
        }

        if len <= INLINE_KEY_MAX {
            self.key_inline[..len]
                .iter()
                .zip(key)
                .all(|(slot_byte, &key_byte)| slot_byte.load(Ordering::Relaxed) == key_byte)
        } else {
            let ptr = self.key_ext.load(Ordering::Relaxed) as *const u8;
            debug_assert!(!ptr.is_null());
            // SAFETY: the external buffer is owned by this occupied slot and
            // only mutated under the chunk lock we hold
            let stored = unsafe { std::slice::from_raw_parts(ptr, len) };
            stored == key
        }
    }

    #[inline]
    fn occupied_relaxed(&self) -> bool {
        self.state.load(Ordering::Relaxed) == SLOT_OCCUPIED
    }

    /// Install an entry into an empty slot. Caller holds the chunk lock.
    ///
    /// Publish order: value, hash, key representation, occupied flag.
    fn install(&self, hash: u64, key: KeyOwned, value: u64) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), SLOT_EMPTY);

        self.seq.fetch_add(1, Ordering::Relaxed);
        // Pairs with the reader's fence before its seq re-check: a reader
        // that observes any field store below also observes the odd seq.
        fence(Ordering::Release);

        self.value.store(value, Ordering::Relaxed);
        self.hash.store(hash, Ordering::Relaxed);
        match key {
            KeyOwned::Inline { len, bytes } => {
                for (slot_byte, byte) in self.key_inline.iter().zip(bytes) {
                    slot_byte.store(byte, Ordering::Relaxed);
                }
                self.key_ext.store(0, Ordering::Relaxed);
                self.key_len.store(len as u32, Ordering::Relaxed);
            }
            KeyOwned::External { ptr, len } => {
                self.key_ext.store(ptr.as_ptr() as u64, Ordering::Relaxed);
                self.key_len.store(len, Ordering::Relaxed);
            }
        }

        self.seq.fetch_add(1, Ordering::Release);
        self.state.store(SLOT_OCCUPIED, Ordering::Release);
    }

    /// Update the value of an occupied slot in place.
    #[inline]
    fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Clear an occupied slot. Caller holds the chunk lock.
    ///
    /// The occupied flag is dropped first so readers stop matching; every
    /// field clear happens inside the odd-sequence window so a racing
    /// reader's re-check voids whatever it compared.
    fn erase(&self, registry: Option<&AllocatorRegistry>) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), SLOT_OCCUPIED);

        self.state.store(SLOT_EMPTY, Ordering::Release);
        self.seq.fetch_add(1, Ordering::Relaxed);
        // Pairs with the reader's fence before its seq re-check: a reader
        // that observes any field clear below also observes the odd seq.
        fence(Ordering::Release);

        let ext = self.key_ext.load(Ordering::Relaxed);
        if ext != 0 {
            if let Some(registry) = registry {
                // SAFETY: a non-zero key_ext of an occupied slot is a live
                // registry allocation owned by this slot
                registry.free(unsafe { NonNull::new_unchecked(ext as *mut u8) });
            }
            self.key_ext.store(0, Ordering::Relaxed);
        }
        self.key_len.store(0, Ordering::Relaxed);
        self.hash.store(0, Ordering::Relaxed);
        self.value.store(0, Ordering::Relaxed);

        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Copy this slot's entry out for migration, leaving the slot intact.
    /// Caller holds the chunk lock.
    ///
    /// An external key's buffer is shared with the returned copy until the
    /// caller clears the slot with `erase(None)`.
    fn peek_entry(&self) -> (u64, KeyOwned, u64) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), SLOT_OCCUPIED);

        let hash = self.hash.load(Ordering::Relaxed);
        let value = self.value.load(Ordering::Relaxed);
        let len = self.key_len.load(Ordering::Relaxed) as usize;

        let key = if len <= INLINE_KEY_MAX {
            let mut bytes = [0u8; INLINE_KEY_MAX];
            for (byte, slot_byte) in bytes.iter_mut().zip(&self.key_inline) {
                *byte = slot_byte.load(Ordering::Relaxed);
            }
            KeyOwned::Inline {
                len: len as u8,
                bytes,
            }
        } else {
            let ptr = self.key_ext.load(Ordering::Relaxed) as *mut u8;
            debug_assert!(!ptr.is_null());
            // SAFETY: non-null key_ext of an occupied slot is live
            KeyOwned::External {
                ptr: unsafe { NonNull::new_unchecked(ptr) },
                len: len as u32,
            }
        };

        (hash, key, value)
    }
}

/// Outcome of a writer-side probe of one chunk.
pub(crate) enum SlotSearch {
    /// A live entry with the same hash and key.
    Match(usize),
    /// No match; the first empty slot, if any.
    Empty(usize),
    /// No match and no empty slot.
    Full,
}

/// A fixed-capacity group of slots addressed by one or more buckets.
pub(crate) struct Chunk {
    write_lock: Mutex<()>,
    /// Set by the resize coordinator once every entry has moved to the next
    /// generation; writers then route this chunk's bucket range there.
    migrated: AtomicBool,
    slots: [Slot; CHUNK_SLOTS],
}

impl Chunk {
    pub(crate) fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
            migrated: AtomicBool::new(false),
            slots: std::array::from_fn(|_| Slot::new()),
        }
    }

    #[inline]
    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }

    #[inline]
    pub(crate) fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    /// Mark this chunk fully migrated. Caller holds the chunk lock.
    pub(crate) fn set_migrated(&self) {
        self.migrated.store(true, Ordering::Release);
    }

    /// Lock-free point lookup within this chunk.
    pub(crate) fn lookup(&self, hash: u64, key: &[u8]) -> Option<u64> {
        for slot in &self.slots {
            let seq = slot.seq.load(Ordering::Acquire);
            if seq & 1 == 1 {
                // Writer mid-mutation; the entry (if it is ours) is covered
                // by the set/get concurrency contract either way.
                continue;
            }
            if slot.state.load(Ordering::Acquire) != SLOT_OCCUPIED {
                continue;
            }
            if slot.hash.load(Ordering::Relaxed) != hash {
                continue;
            }
            let matched = slot.key_matches_reader(key);
            let value = slot.value.load(Ordering::Acquire);
            // Pairs with the writers' release fences: the hash/key/value
            // loads above cannot sink past this, so a read that overlapped
            // a slot mutation sees the bumped sequence and is voided.
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != seq {
                continue;
            }
            if matched {
                return Some(value);
            }
        }
        None
    }

    /// Writer-side probe. Caller holds the chunk lock.
    pub(crate) fn search(&self, hash: u64, key: &[u8]) -> SlotSearch {
        let mut empty = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.occupied_relaxed() {
                if slot.hash.load(Ordering::Relaxed) == hash && slot.key_matches_writer(key) {
                    return SlotSearch::Match(index);
                }
            } else if empty.is_none() {
                empty = Some(index);
            }
        }
        match empty {
            Some(index) => SlotSearch::Empty(index),
            None => SlotSearch::Full,
        }
    }

    /// Install an entry into the given empty slot. Caller holds the chunk
    /// lock.
    pub(crate) fn install(&self, index: usize, hash: u64, key: KeyOwned, value: u64) {
        self.slots[index].install(hash, key, value);
    }

    /// Update the value of the given occupied slot in place.
    pub(crate) fn set_value(&self, index: usize, value: u64) {
        self.slots[index].set_value(value);
    }

    /// Clear the given occupied slot, releasing its external key buffer.
    /// Caller holds the chunk lock.
    pub(crate) fn erase(&self, index: usize, registry: &AllocatorRegistry) {
        self.slots[index].erase(Some(registry));
    }

    /// Offer every live entry to a migration sink. Caller holds the chunk
    /// lock.
    ///
    /// Each entry is copied out first and only cleared once the sink has
    /// accepted it, so a lock-free reader always finds the entry in at least
    /// one generation. The external buffer (if any) moves with the accepted
    /// copy; the slot is cleared without freeing it. A rejected entry stays
    /// in place. Returns `true` when every entry was accepted.
    pub(crate) fn drain_entries(
        &self,
        mut sink: impl FnMut(u64, KeyOwned, u64) -> std::result::Result<(), KeyOwned>,
    ) -> bool {
        let mut all_moved = true;
        for slot in &self.slots {
            if slot.occupied_relaxed() {
                let (hash, key, value) = slot.peek_entry();
                match sink(hash, key, value) {
                    Ok(()) => slot.erase(None),
                    // KeyOwned has no drop glue, so discarding the rejected
                    // copy cannot free the slot's buffer out from under it.
                    Err(_) => all_moved = false,
                }
            }
        }
        all_moved
    }

    /// Number of live entries. Caller holds the chunk lock.
    #[cfg(test)]
    pub(crate) fn occupied_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied_relaxed()).count()
    }

    /// Erase every live entry, releasing external key buffers. Used at
    /// generation teardown.
    pub(crate) fn clear_all(&self, registry: &AllocatorRegistry) {
        let _guard = self.write_lock.lock();
        for slot in &self.slots {
            if slot.occupied_relaxed() {
                slot.erase(Some(registry));
            }
        }
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    fn inline_key(bytes: &[u8]) -> KeyOwned {
        let mut buf = [0u8; INLINE_KEY_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        KeyOwned::Inline {
            len: bytes.len() as u8,
            bytes: buf,
        }
    }

    // A lock-free reader racing an install sees the entry fully or not at
    // all, never a torn mix.
    #[test]
    fn publish_is_never_torn() {
        loom::model(|| {
            let chunk = loom::sync::Arc::new(Chunk::new());

            let writer = {
                let chunk = chunk.clone();
                loom::thread::spawn(move || {
                    chunk.install(0, 0x1234, inline_key(b"abc"), 99);
                })
            };

            match chunk.lookup(0x1234, b"abc") {
                None => {}
                Some(value) => assert_eq!(value, 99),
            }

            writer.join().unwrap();
        });
    }

    // A reader racing an erase returns the pre-delete value or a miss, and
    // never matches the slot against a half-cleared key.
    #[test]
    fn erase_is_never_half_observed() {
        loom::model(|| {
            let chunk = loom::sync::Arc::new(Chunk::new());
            chunk.install(0, 0x1234, inline_key(b"abc"), 99);

            let eraser = {
                let chunk = chunk.clone();
                loom::thread::spawn(move || {
                    chunk.slots[0].erase(None);
                })
            };

            match chunk.lookup(0x1234, b"abc") {
                None => {}
                Some(value) => assert_eq!(value, 99),
            }

            eraser.join().unwrap();
        });
    }
}
