//! Migration coordinator for hashtable resize.
//!
//! Resize installs a next generation with twice the buckets and drains the
//! current one chunk by chunk while reads and writes continue. Writers that
//! insert during a migration assist it, moving a small batch of chunks each,
//! so progress needs no dedicated thread. Once the old generation is empty
//! the next generation is swapped in under the generations write lock.
//!
//! A migration that cannot finish (the new generation's neighborhoods filled
//! up before every old entry found a home) parks after a bounded number of
//! passes and the table simply stays in the migrating state: reads consult
//! both generations and writes land in the new one, so correctness does not
//! depend on finalization.

use std::sync::Arc;

use crate::hashtable::{Generation, Hashtable};
use crate::sync::Ordering;

/// Chunks one assisting writer migrates per operation.
const MIGRATE_BATCH: usize = 8;

/// Drain passes over the old generation before the migration parks.
const MIGRATE_MAX_PASSES: usize = 8;

impl Hashtable {
    /// Install a next generation with twice the buckets.
    ///
    /// No-op when a migration is already in progress.
    pub(crate) fn start_migration(&self) {
        let _starter = self.resize_lock.lock();

        let buckets_count = {
            let generations = self.generations.read();
            if generations.next.is_some() {
                return;
            }
            generations.current.buckets_count()
        };

        // Build the larger generation before taking the write lock; the
        // allocation is the slow part and traffic keeps flowing meanwhile.
        let next = Arc::new(Generation::new(
            buckets_count * 2,
            self.registry.clone(),
        ));

        log::debug!(
            target: "slabtable::resize",
            "resizing from {} to {} buckets",
            buckets_count,
            next.buckets_count()
        );

        let mut generations = self.generations.write();
        // The resize lock serializes starters and only finalization clears
        // `next`, so the slot is still empty.
        debug_assert!(generations.next.is_none());
        generations.next = Some(next);
    }

    /// Move a batch of chunks forward and finalize if the old generation has
    /// drained. No-op when no migration is in progress.
    pub(crate) fn assist_migration(&self) {
        let (old, new) = {
            let generations = self.generations.read();
            let Some(next) = generations.next.clone() else {
                return;
            };
            (generations.current.clone(), next)
        };

        for _ in 0..MIGRATE_BATCH {
            if !migrate_next_chunk(&old, &new) {
                break;
            }
        }

        self.try_finalize(&old, &new);
    }

    /// Drive any in-progress migration forward.
    ///
    /// Writers assist on their own; calling this from a maintenance thread
    /// speeds up a migration on a read-mostly workload.
    pub fn maintain(&self) {
        self.assist_migration();
    }

    /// Swap the new generation in once the old one is empty, or schedule
    /// another drain pass if entries remain.
    fn try_finalize(&self, old: &Arc<Generation>, new: &Arc<Generation>) {
        if old.cursor.load(Ordering::Relaxed) < old.chunk_count() {
            // Pass still in progress; a later assist gets here.
            return;
        }

        if old.occupied() == 0 {
            let mut generations = self.generations.write();
            if !Arc::ptr_eq(&generations.current, old) {
                // Another assistant finalized this migration first.
                return;
            }
            generations.current = new.clone();
            generations.next = None;
            drop(generations);

            log::debug!(
                target: "slabtable::resize",
                "resize to {} buckets complete",
                new.buckets_count()
            );
            return;
        }

        // Entries remain: some new-generation neighborhoods were full when
        // their chunks drained. Rewind the cursor for another pass, up to a
        // bound; deletes may have made room since.
        let _starter = self.resize_lock.lock();
        {
            let generations = self.generations.read();
            match &generations.next {
                Some(next) if Arc::ptr_eq(next, new) => {}
                _ => return,
            }
        }
        if old.cursor.load(Ordering::Relaxed) < old.chunk_count() {
            // A concurrent assistant already rewound.
            return;
        }

        let pass = old.passes.fetch_add(1, Ordering::Relaxed) + 1;
        if pass >= MIGRATE_MAX_PASSES {
            if pass == MIGRATE_MAX_PASSES {
                log::warn!(
                    target: "slabtable::resize",
                    "migration parked after {pass} passes with {} entries left",
                    old.occupied()
                );
            }
            // The table stays migrating: reads consult both generations and
            // writes land in the new one, so this is slow but correct.
            return;
        }
        old.cursor.store(0, Ordering::Relaxed);
    }
}

/// Claim the next chunk of the old generation and move its entries.
///
/// Returns `false` when the current pass has no chunks left to claim.
fn migrate_next_chunk(old: &Generation, new: &Generation) -> bool {
    let index = old.cursor.fetch_add(1, Ordering::Relaxed);
    if index >= old.chunk_count() {
        return false;
    }

    let chunk = old.chunk(index);
    let _guard = chunk.write_lock().lock();
    if chunk.is_migrated() {
        return true;
    }

    // Copy-then-clear: each entry is inserted into the new generation before
    // its old slot is cleared, all under this chunk's lock, so lock-free
    // readers scanning old-then-new always find it in at least one place and
    // lock-taking writers never see it in both.
    let all_moved = chunk.drain_entries(|hash, key, value| {
        let probe = new.lock_probe(hash);
        if probe.find_match(hash, key.as_bytes()).is_some() {
            // Unreachable while deleters lock the old neighborhood before
            // touching the new one; tolerated by dropping the stale copy
            // (its buffer is abandoned rather than freed under a reader).
            debug_assert!(false, "key present in both generations");
            old.dec_occupied();
            return Ok(());
        }
        match probe.insert(hash, key, value) {
            Ok(()) => {
                old.dec_occupied();
                Ok(())
            }
            Err(key) => Err(key),
        }
    });

    if all_moved {
        chunk.set_migrated();
    }
    true
}
