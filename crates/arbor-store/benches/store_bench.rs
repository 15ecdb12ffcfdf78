//! Benchmarks for object store operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use arbor_store::{ObjectStore, RelationKind, StoreConfig};

fn bench_allocate_release(c: &mut Criterion) {
    let store = ObjectStore::with_config(StoreConfig {
        key_pool_size: 1024,
        ..Default::default()
    });

    c.bench_function("store_allocate_release_64b", |b| {
        b.iter(|| {
            let handle = store.allocate(black_box(64), 0).unwrap();
            store.release(handle).unwrap();
        })
    });
}

fn bench_find(c: &mut Criterion) {
    let store = ObjectStore::new();
    let handles: Vec<_> = (0..1000).map(|_| store.allocate(16, 0).unwrap()).collect();

    c.bench_function("store_find_1000", |b| {
        b.iter(|| {
            for handle in &handles {
                black_box(store.find(black_box(handle.key)));
            }
        })
    });
}

fn bench_link(c: &mut Criterion) {
    let store = ObjectStore::new();
    let from = store.allocate(16, 0).unwrap();
    let to = store.allocate(16, 1).unwrap();

    c.bench_function("store_link", |b| {
        b.iter(|| {
            store
                .link(from, to, black_box(3), 1, RelationKind::Compose)
                .unwrap();
        })
    });
}

criterion_group!(benches, bench_allocate_release, bench_find, bench_link);
criterion_main!(benches);
