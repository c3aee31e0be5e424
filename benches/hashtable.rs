use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use slabtable::{AllocatorRegistry, Hashtable};

fn make_key(id: u64, len: usize) -> Vec<u8> {
    let mut key = format!("key-{id:016x}-").into_bytes();
    key.resize(len.max(key.len()), b'x');
    key
}

fn get(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashtable/get");
    group.throughput(Throughput::Elements(1));

    for (label, len) in [("inline_key", 0usize), ("external_key", 64)] {
        let registry = AllocatorRegistry::new(1);
        let table = Hashtable::new(1_000_000, registry);
        for i in 0..100_000u64 {
            table.op_set(&make_key(i, len), i).unwrap();
        }

        let mut i = 0u64;
        group.bench_function(label, |b| {
            b.iter(|| {
                i = (i + 1) % 100_000;
                table.op_get(&make_key(i, len))
            })
        });
    }

    group.finish();
}

fn get_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashtable/get_miss");
    group.throughput(Throughput::Elements(1));

    let registry = AllocatorRegistry::new(1);
    let table = Hashtable::new(1_000_000, registry);
    for i in 0..100_000u64 {
        table.op_set(&make_key(i, 0), i).unwrap();
    }

    let mut i = 0u64;
    group.bench_function("inline_key", |b| {
        b.iter(|| {
            i += 1;
            table.op_get(&make_key(1_000_000 + i, 0))
        })
    });

    group.finish();
}

fn set(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashtable/set");
    group.throughput(Throughput::Elements(1));

    for (label, len) in [("inline_key", 0usize), ("external_key", 64)] {
        let registry = AllocatorRegistry::new(1);
        let table = Hashtable::new(1_000_000, registry);

        // Updates after the first lap; key churn stays bounded.
        let mut i = 0u64;
        group.bench_function(label, |b| {
            b.iter(|| {
                i = (i + 1) % 100_000;
                table.op_set(&make_key(i, len), i)
            })
        });
    }

    group.finish();
}

fn set_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashtable/set_delete");
    group.throughput(Throughput::Elements(2));

    let registry = AllocatorRegistry::new(1);
    let table = Hashtable::new(1_000_000, registry);

    let mut i = 0u64;
    group.bench_function("external_key", |b| {
        b.iter(|| {
            i += 1;
            let key = make_key(i, 64);
            table.op_set(&key, i).unwrap();
            table.op_delete(&key)
        })
    });

    group.finish();
}

criterion_group!(benches, get, get_miss, set, set_delete);
criterion_main!(benches);
