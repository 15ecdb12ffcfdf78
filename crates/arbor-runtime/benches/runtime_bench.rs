//! Benchmarks for loop dispatch and membrane evolution

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use arbor_core::{EventKind, EventPayload, Key, ObjectType, Timestamp, Topology};
use arbor_runtime::{EventLoop, Membrane, MembraneConfig, Rule, Substrate};
use arbor_store::ObjectStore;

fn bench_post_drain(c: &mut Criterion) {
    let store = Arc::new(ObjectStore::new());
    let topology = Arc::new(Topology::from_table(&[0, 1]));
    let looper = EventLoop::create(store, topology, Key(1), 0).unwrap();

    c.bench_function("loop_post_drain_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                looper
                    .post(EventKind::TimerExpire, Key(1), EventPayload::None)
                    .unwrap();
            }
            black_box(looper.drain());
        })
    });
}

fn bench_evolve(c: &mut Criterion) {
    let substrate = Substrate::new(
        Arc::new(ObjectStore::new()),
        Arc::new(Topology::from_table(&[0, 1])),
        MembraneConfig::default(),
    );
    let membrane = Membrane::create_root(&substrate).unwrap();
    for i in 0..16u32 {
        membrane
            .add_rule(
                Rule::new(i)
                    .consumes(ObjectType(i), 1)
                    .produces(ObjectType(i + 1), 1),
            )
            .unwrap();
    }

    c.bench_function("membrane_evolve_16_rules", |b| {
        b.iter(|| {
            membrane.add_object(ObjectType(0), 1).unwrap();
            black_box(membrane.evolve(Timestamp::now()).unwrap());
        })
    });
}

criterion_group!(benches, bench_post_drain, bench_evolve);
criterion_main!(benches);
