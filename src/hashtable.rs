//! Concurrent hashtable with generation-based live resize.
//!
//! Keys hash to a bucket, buckets map onto chunks (eight buckets share one
//! eight-slot chunk), and an entry may land in any chunk of a small probe
//! neighborhood starting at its home chunk. Reads are lock-free; writes
//! lock the probe neighborhood's chunks in ascending index order.
//!
//! A generation is one complete bucket/chunk/slot structure. Resize installs
//! a larger next generation and migrates chunks incrementally while reads
//! and writes continue; see [`crate::resize`] for the coordinator.

use std::sync::Arc;

use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::chunk::{Chunk, KeyOwned, SlotSearch, BUCKETS_PER_CHUNK, CHUNK_SLOTS};
use crate::error::{Error, Result};
use crate::registry::AllocatorRegistry;
use crate::sync::{AtomicUsize, Ordering};

/// Chunks probed per key: the home chunk plus up to two followers.
pub(crate) const PROBE_CHUNKS: usize = 3;

/// Longest supported key (bounded by the largest slab class).
pub(crate) const MAX_KEY_LEN: usize = 65536;

/// Minimum bucket count per generation.
const MIN_BUCKETS: usize = 64;

/// Resize high-water mark: occupied > 3/4 of capacity.
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

/// Whether a table is serving from one generation or migrating to a larger
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// One generation serves all traffic.
    Stable,
    /// A larger generation is being populated; operations consult both.
    Migrating,
}

/// One complete bucket/chunk/slot structure.
pub(crate) struct Generation {
    buckets_count: usize,
    chunks: Box<[Chunk]>,
    occupied: AtomicUsize,
    /// Next chunk index the migration cursor will claim (meaningful while
    /// this generation is being drained).
    pub(crate) cursor: AtomicUsize,
    /// Completed migration passes over this generation.
    pub(crate) passes: AtomicUsize,
    registry: Arc<AllocatorRegistry>,
}

impl Generation {
    pub(crate) fn new(buckets_count: usize, registry: Arc<AllocatorRegistry>) -> Self {
        let buckets_count = buckets_count.next_power_of_two().max(MIN_BUCKETS);
        let chunk_count = buckets_count / BUCKETS_PER_CHUNK;
        let chunks = (0..chunk_count)
            .map(|_| Chunk::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buckets_count,
            chunks,
            occupied: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            passes: AtomicUsize::new(0),
            registry,
        }
    }

    #[inline]
    pub(crate) fn buckets_count(&self) -> usize {
        self.buckets_count
    }

    #[inline]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub(crate) fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    #[inline]
    pub(crate) fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn dec_occupied(&self) {
        self.occupied.fetch_sub(1, Ordering::Relaxed);
    }

    /// Occupancy crossed the resize high-water mark.
    #[inline]
    pub(crate) fn over_high_water(&self) -> bool {
        let capacity = self.chunks.len() * CHUNK_SLOTS;
        self.occupied() * LOAD_DEN > capacity * LOAD_NUM
    }

    /// Probe neighborhood for a hash: home chunk plus followers, wrapping.
    fn probe(&self, hash: u64) -> ([usize; PROBE_CHUNKS], usize) {
        let bucket = (hash as usize) & (self.buckets_count - 1);
        let home = bucket / BUCKETS_PER_CHUNK;
        let count = self.chunks.len().min(PROBE_CHUNKS);
        let mut indices = [0usize; PROBE_CHUNKS];
        for (i, slot) in indices.iter_mut().enumerate().take(count) {
            *slot = (home + i) % self.chunks.len();
        }
        (indices, count)
    }

    /// Lock-free lookup across the probe neighborhood.
    pub(crate) fn lookup(&self, hash: u64, key: &[u8]) -> Option<u64> {
        let (indices, count) = self.probe(hash);
        for &index in &indices[..count] {
            if let Some(value) = self.chunks[index].lookup(hash, key) {
                return Some(value);
            }
        }
        None
    }

    /// Lock the probe neighborhood for writing.
    ///
    /// Chunks are locked in ascending index order so concurrent writers with
    /// overlapping neighborhoods cannot deadlock.
    pub(crate) fn lock_probe(&self, hash: u64) -> ProbeGuard<'_> {
        let (indices, count) = self.probe(hash);
        let mut sorted = [0usize; PROBE_CHUNKS];
        sorted[..count].copy_from_slice(&indices[..count]);
        sorted[..count].sort_unstable();

        let mut guards: Vec<MutexGuard<'_, ()>> = Vec::with_capacity(count);
        let mut previous = usize::MAX;
        for &index in &sorted[..count] {
            if index != previous {
                guards.push(self.chunks[index].write_lock().lock());
                previous = index;
            }
        }

        ProbeGuard {
            generation: self,
            indices,
            count,
            _guards: guards,
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        for chunk in self.chunks.iter() {
            chunk.clear_all(&self.registry);
        }
    }
}

/// Write access to one key's probe neighborhood, chunks locked.
pub(crate) struct ProbeGuard<'a> {
    generation: &'a Generation,
    indices: [usize; PROBE_CHUNKS],
    count: usize,
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl ProbeGuard<'_> {
    /// Find a live entry with this hash and key.
    ///
    /// Migrated chunks are skipped: they are empty and closed for writes.
    pub(crate) fn find_match(&self, hash: u64, key: &[u8]) -> Option<(usize, usize)> {
        for &index in &self.indices[..self.count] {
            let chunk = &self.generation.chunks[index];
            if chunk.is_migrated() {
                continue;
            }
            if let SlotSearch::Match(slot) = chunk.search(hash, key) {
                return Some((index, slot));
            }
        }
        None
    }

    /// Update a located entry's value in place.
    pub(crate) fn update(&self, location: (usize, usize), value: u64) {
        self.generation.chunks[location.0].set_value(location.1, value);
    }

    /// Insert a new entry into the first empty slot of the neighborhood.
    ///
    /// Returns the key back when every non-migrated chunk is full.
    pub(crate) fn insert(
        &self,
        hash: u64,
        key: KeyOwned,
        value: u64,
    ) -> std::result::Result<(), KeyOwned> {
        for &index in &self.indices[..self.count] {
            let chunk = &self.generation.chunks[index];
            if chunk.is_migrated() {
                continue;
            }
            if let SlotSearch::Empty(slot) = chunk.search(hash, key.as_bytes()) {
                chunk.install(slot, hash, key, value);
                self.generation.occupied.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        Err(key)
    }

    /// Erase a located entry, releasing its external key buffer.
    pub(crate) fn erase(&self, location: (usize, usize)) {
        self.generation.chunks[location.0].erase(location.1, &self.generation.registry);
        self.generation.occupied.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Outcome of applying a set to one generation.
pub(crate) enum WriteOutcome {
    Updated,
    Inserted,
    Full,
}

/// Apply a set to a locked probe neighborhood.
///
/// `staged` must hold the staged key; it is consumed on insert and left for
/// the caller to release on update or overflow.
pub(crate) fn apply_set(
    probe: &ProbeGuard<'_>,
    hash: u64,
    key: &[u8],
    value: u64,
    staged: &mut Option<KeyOwned>,
) -> WriteOutcome {
    if let Some(location) = probe.find_match(hash, key) {
        probe.update(location, value);
        return WriteOutcome::Updated;
    }

    let Some(owned) = staged.take() else {
        debug_assert!(false, "staged key consumed twice");
        return WriteOutcome::Full;
    };

    match probe.insert(hash, owned, value) {
        Ok(()) => WriteOutcome::Inserted,
        Err(owned) => {
            *staged = Some(owned);
            WriteOutcome::Full
        }
    }
}

/// The set of generations serving a table: always a current one, plus the
/// larger next one while migrating.
pub(crate) struct GenerationSet {
    pub(crate) current: Arc<Generation>,
    pub(crate) next: Option<Arc<Generation>>,
}

/// Concurrent hashtable mapping byte keys to `u64` values.
pub struct Hashtable {
    hash_builder: RandomState,
    pub(crate) registry: Arc<AllocatorRegistry>,
    pub(crate) generations: RwLock<GenerationSet>,
    /// Serializes migration-start decisions (the generations write lock is
    /// only held for the brief install/swap steps).
    pub(crate) resize_lock: Mutex<()>,
}

impl Hashtable {
    /// Create a table sized for `initial_buckets` (rounded up to a power of
    /// two). External key buffers are drawn from `registry`.
    pub fn new(initial_buckets: usize, registry: Arc<AllocatorRegistry>) -> Self {
        // Fixed seeds under test for deterministic bucket placement.
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let current = Arc::new(Generation::new(initial_buckets, registry.clone()));

        Self {
            hash_builder,
            registry,
            generations: RwLock::new(GenerationSet {
                current,
                next: None,
            }),
            resize_lock: Mutex::new(()),
        }
    }

    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        self.hash_builder.hash_one(key)
    }

    /// Look up a key. Lock-free with respect to writers.
    pub fn op_get(&self, key: &[u8]) -> Option<u64> {
        let hash = self.hash(key);
        let generations = self.generations.read();

        // Old-then-new: a mid-move entry is present in the old generation
        // until the mover has inserted it into the new one.
        if let Some(value) = generations.current.lookup(hash, key) {
            return Some(value);
        }
        if let Some(next) = &generations.next {
            return next.lookup(hash, key);
        }
        None
    }

    /// Insert or update a key.
    pub fn op_set(&self, key: &[u8], value: u64) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong);
        }
        let hash = self.hash(key);

        loop {
            let generations = self.generations.read();

            let (outcome, migrating) = match &generations.next {
                None => {
                    let mut staged = Some(KeyOwned::prepare(key, &self.registry)?);
                    let probe = generations.current.lock_probe(hash);
                    let outcome = apply_set(&probe, hash, key, value, &mut staged);
                    drop(probe);
                    if let Some(unused) = staged.take() {
                        unused.release(&self.registry);
                    }
                    (outcome, false)
                }
                Some(next) => {
                    let outcome =
                        self.set_migrating(&generations.current, next, hash, key, value)?;
                    (outcome, true)
                }
            };

            match outcome {
                WriteOutcome::Updated => return Ok(()),
                WriteOutcome::Inserted => {
                    let needs_resize = !migrating && generations.current.over_high_water();
                    drop(generations);
                    if needs_resize {
                        self.start_migration();
                    }
                    if migrating || needs_resize {
                        self.assist_migration();
                    }
                    return Ok(());
                }
                WriteOutcome::Full => {
                    if migrating {
                        // Structurally exhausted: the next generation's
                        // neighborhood has no room either.
                        return Err(Error::TableFull);
                    }
                    // Chunk-level overflow triggers growth, then the set is
                    // retried against the migrating table.
                    drop(generations);
                    self.start_migration();
                }
            }
        }
    }

    /// Delete a key. Returns whether an entry was removed.
    pub fn op_delete(&self, key: &[u8]) -> bool {
        let hash = self.hash(key);
        let generations = self.generations.read();

        // Hold the old neighborhood while clearing the new one so a
        // concurrent mover or migrating set cannot interleave between them.
        let old_probe = generations.current.lock_probe(hash);
        let deleted_old = match old_probe.find_match(hash, key) {
            Some(location) => {
                old_probe.erase(location);
                true
            }
            None => false,
        };

        let deleted_new = match &generations.next {
            Some(next) => {
                let probe = next.lock_probe(hash);
                match probe.find_match(hash, key) {
                    Some(location) => {
                        probe.erase(location);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };
        drop(old_probe);

        deleted_old || deleted_new
    }

    /// Current state of the table.
    pub fn state(&self) -> TableState {
        if self.generations.read().next.is_some() {
            TableState::Migrating
        } else {
            TableState::Stable
        }
    }

    /// Bucket count of the generation serving normal traffic.
    pub fn buckets_count(&self) -> usize {
        self.generations.read().current.buckets_count()
    }

    /// Approximate number of live entries.
    ///
    /// Exact while Stable; during migration a mid-move entry may transiently
    /// be counted in both generations.
    pub fn entries(&self) -> usize {
        let generations = self.generations.read();
        // The mover publishes an entry in the new generation before clearing
        // its old slot, so the sum can briefly count an in-flight entry
        // twice.
        let next = generations.next.as_ref().map_or(0, |next| next.occupied());
        generations.current.occupied() + next
    }

    /// Apply a set while a migration is in progress.
    ///
    /// The old probe locks are held throughout: a concurrent mover takes the
    /// same locks before re-homing an entry, so the key cannot move between
    /// the old-generation check and the new-generation apply.
    fn set_migrating(
        &self,
        current: &Generation,
        next: &Generation,
        hash: u64,
        key: &[u8],
        value: u64,
    ) -> Result<WriteOutcome> {
        let mut staged = Some(KeyOwned::prepare(key, &self.registry)?);
        let old_probe = current.lock_probe(hash);

        let outcome = if let Some(location) = old_probe.find_match(hash, key) {
            // Still in the old generation; the mover carries the new value
            // over when it re-homes the entry.
            old_probe.update(location, value);
            WriteOutcome::Updated
        } else {
            // Already moved, or new: the next generation is authoritative.
            let probe = next.lock_probe(hash);
            apply_set(&probe, hash, key, value, &mut staged)
        };
        drop(old_probe);

        if let Some(unused) = staged.take() {
            unused.release(&self.registry);
        }
        Ok(outcome)
    }
}
