//! Multi-threaded stress tests: lock-free readers against concurrent
//! writers, including across live resizes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slabtable::{AllocatorRegistry, Hashtable, TableState};

fn make_key(writer: u64, id: u64, len: usize) -> Vec<u8> {
    let mut key = format!("w{writer:02}-key-{id:012x}-").into_bytes();
    key.resize(len.max(key.len()), b'k');
    key
}

/// A value a reader can validate: the low half identifies the key, the high
/// half is its checksum. A torn or misattributed read fails the check.
fn checked_value(writer: u64, id: u64, round: u64) -> u64 {
    let low = (writer << 24) | (id & 0xFF_FFFF);
    let high = low.wrapping_mul(0x9E37_79B9).wrapping_add(round) & 0xFFFF_FFFF;
    (high << 32) | (low & 0xFFFF_FFFF)
}

fn value_is_consistent(writer: u64, id: u64, value: u64) -> bool {
    let low = value & 0xFFFF_FFFF;
    if low != ((writer << 24) | (id & 0xFF_FFFF)) {
        return false;
    }
    let round = (value >> 32).wrapping_sub(low.wrapping_mul(0x9E37_79B9)) & 0xFFFF_FFFF;
    value == checked_value(writer, id, round)
}

#[test]
fn readers_never_observe_torn_or_foreign_values() {
    let registry = AllocatorRegistry::new(4);
    let table = Arc::new(Hashtable::new(4_096, registry));
    let stop = Arc::new(AtomicBool::new(false));

    let writers = 2;
    let keys_per_writer = 500u64;

    // Seed every key so readers always have something to find.
    for writer in 0..writers {
        for id in 0..keys_per_writer {
            let len = (id % 40) as usize;
            table
                .op_set(&make_key(writer, id, len), checked_value(writer, id, 0))
                .unwrap();
        }
    }

    std::thread::scope(|scope| {
        // Writers rewrite their own disjoint key ranges.
        for writer in 0..writers {
            let table = table.clone();
            let stop = stop.clone();
            scope.spawn(move || {
                slabtable::bind_current_thread(writer as u16);
                let mut round = 1u64;
                while !stop.load(Ordering::Relaxed) {
                    for id in 0..keys_per_writer {
                        let len = (id % 40) as usize;
                        table
                            .op_set(&make_key(writer, id, len), checked_value(writer, id, round))
                            .unwrap();
                    }
                    round += 1;
                }
            });
        }

        // Readers validate that every observed value belongs to the key it
        // was read from, whatever round it is from.
        for reader in 0..2 {
            let table = table.clone();
            let stop = stop.clone();
            scope.spawn(move || {
                slabtable::bind_current_thread(2 + reader);
                while !stop.load(Ordering::Relaxed) {
                    for writer in 0..writers {
                        for id in (0..keys_per_writer).step_by(7) {
                            let len = (id % 40) as usize;
                            let key = make_key(writer, id, len);
                            match table.op_get(&key) {
                                Some(value) => assert!(
                                    value_is_consistent(writer, id, value),
                                    "torn read: key w{writer}/{id} value {value:#x}"
                                ),
                                None => panic!("seeded key w{writer}/{id} vanished"),
                            }
                        }
                    }
                }
            });
        }

        std::thread::sleep(std::time::Duration::from_millis(500));
        stop.store(true, Ordering::Relaxed);
    });
}

#[test]
fn readers_racing_deletes_see_whole_entries_or_misses() {
    let registry = AllocatorRegistry::new(2);
    let table = Arc::new(Hashtable::new(1_024, registry));
    let stop = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        // One writer churns a small key set through delete/reinsert cycles,
        // keeping slots permanently mid-erase or mid-install.
        {
            let table = table.clone();
            let stop = stop.clone();
            scope.spawn(move || {
                let mut round = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    for id in 1..65u64 {
                        let key = make_key(0, id, (id % 40) as usize);
                        table.op_set(&key, checked_value(0, id, round)).unwrap();
                        table.op_delete(&key);
                    }
                    round += 1;
                }
            });
        }

        // Readers may miss (the key is deleted half the time) but a hit
        // must be a whole entry: a cleared value against still-matching key
        // bytes fails the checksum.
        for _ in 0..2 {
            let table = table.clone();
            let stop = stop.clone();
            scope.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for id in 1..65u64 {
                        let key = make_key(0, id, (id % 40) as usize);
                        if let Some(value) = table.op_get(&key) {
                            assert!(
                                value_is_consistent(0, id, value),
                                "half-cleared read: key {id} value {value:#x}"
                            );
                        }
                    }
                }
            });
        }

        std::thread::sleep(std::time::Duration::from_millis(500));
        stop.store(true, Ordering::Relaxed);
    });
}

#[test]
fn entries_survive_a_live_migration_under_load() {
    let registry = AllocatorRegistry::new(4);
    let table = Arc::new(Hashtable::new(64, registry));
    let stop = Arc::new(AtomicBool::new(false));

    let keys = 300u64;
    for id in 0..keys {
        table
            .op_set(&make_key(0, id, (id % 50) as usize), checked_value(0, id, 0))
            .unwrap();
    }

    std::thread::scope(|scope| {
        // A reader hammers the seeded keys while inserts force resizes.
        {
            let table = table.clone();
            let stop = stop.clone();
            scope.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for id in 0..keys {
                        let key = make_key(0, id, (id % 50) as usize);
                        let value = table
                            .op_get(&key)
                            .unwrap_or_else(|| panic!("key {id} vanished mid-migration"));
                        assert!(value_is_consistent(0, id, value));
                    }
                }
            });
        }

        // Writer 1 grows the table well past several doublings.
        for id in 0..5_000u64 {
            table
                .op_set(&make_key(1, id, (id % 30) as usize), checked_value(1, id, 0))
                .unwrap();
        }
        stop.store(true, Ordering::Relaxed);
    });

    // Finish any in-flight migration and verify both key populations.
    let mut spins = 0;
    while table.state() == TableState::Migrating {
        table.maintain();
        spins += 1;
        assert!(spins < 100_000, "migration failed to finish");
    }
    assert_eq!(table.entries(), (keys + 5_000) as usize);
    for id in 0..keys {
        let key = make_key(0, id, (id % 50) as usize);
        assert_eq!(table.op_get(&key), Some(checked_value(0, id, 0)));
    }
    for id in 0..5_000u64 {
        let key = make_key(1, id, (id % 30) as usize);
        assert_eq!(table.op_get(&key), Some(checked_value(1, id, 0)));
    }
}

#[test]
fn concurrent_writers_with_overlapping_neighborhoods() {
    let registry = AllocatorRegistry::new(4);
    // A tiny table maximizes probe-neighborhood overlap between threads.
    let table = Arc::new(Hashtable::new(64, registry));

    let threads = 4u64;
    let per_thread = 1_000u64;

    std::thread::scope(|scope| {
        for writer in 0..threads {
            let table = table.clone();
            scope.spawn(move || {
                slabtable::bind_current_thread(writer as u16);
                for id in 0..per_thread {
                    let key = make_key(writer, id, (id % 60) as usize);
                    table.op_set(&key, checked_value(writer, id, 0)).unwrap();
                    if id % 3 == 0 {
                        assert!(table.op_delete(&key));
                    }
                }
            });
        }
    });

    let mut spins = 0;
    while table.state() == TableState::Migrating {
        table.maintain();
        spins += 1;
        assert!(spins < 100_000, "migration failed to finish");
    }

    let mut live = 0usize;
    for writer in 0..threads {
        for id in 0..per_thread {
            let key = make_key(writer, id, (id % 60) as usize);
            let expected = if id % 3 == 0 {
                None
            } else {
                Some(checked_value(writer, id, 0))
            };
            assert_eq!(table.op_get(&key), expected, "writer {writer} id {id}");
            live += usize::from(expected.is_some());
        }
    }
    assert_eq!(table.entries(), live);
}
