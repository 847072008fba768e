use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use scangraph::config::{LevelConfig, PropagationConfig};
use scangraph::storage::{Document, Transaction};
use scangraph::{
    DeclaredLevel, Edge, EdgeKey, EngineConfig, GraphEngine, GraphStore, InMemoryGraphStore, InMemoryQueue, Object,
    OriginId, OriginPayload, Reference, ScanLevel, ScanProfilePropagator,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn host(i: usize) -> Object {
    Object::new("Hostname", &["internet".to_string(), format!("h{i}")]).unwrap()
}

/// A tree of `n` hosts where node `i` links to `2i+1` and `2i+2`, plus a
/// back edge every 16 nodes so the graph has cycles.
fn seed_tree(store: &InMemoryGraphStore, n: usize) -> Reference {
    let mut tx = Transaction::new(t0());
    for i in 0..n {
        tx.put(Document::Object(host(i)));
    }
    for i in 0..n {
        for child in [2 * i + 1, 2 * i + 2] {
            if child < n {
                let key = EdgeKey::new(host(i).primary_key, "link", host(child).primary_key).unwrap();
                tx.put(Document::Edge(Edge::new(key)));
            }
        }
        if i > 0 && i % 16 == 0 {
            let key = EdgeKey::new(host(i).primary_key, "link", host(i / 16).primary_key).unwrap();
            tx.put(Document::Edge(Edge::new(key)));
        }
    }
    store.submit(tx).unwrap();
    host(0).primary_key
}

fn bench_incremental_declaration(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/incremental_declaration");
    for n in [256usize, 4096] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_custom(|iters| {
                // Fresh graph per sample so profile history does not accumulate.
                let store = Arc::new(InMemoryGraphStore::new());
                let root = seed_tree(&store, n);
                let propagator =
                    ScanProfilePropagator::new(store.clone(), LevelConfig::default(), PropagationConfig::default());

                let mut elapsed = Duration::ZERO;
                for i in 0..iters {
                    let mut tx = Transaction::new(t0() + chrono::Duration::seconds(i as i64 + 1));
                    let level = ScanLevel::new(1 + (i % 4) as u8);
                    tx.put(Document::Declaration(DeclaredLevel::new(root.clone(), level)));
                    let id = store.submit(tx).unwrap();

                    let start = Instant::now();
                    propagator.propagate(id).unwrap();
                    elapsed += start.elapsed();
                }
                elapsed
            });
        });
    }
    group.finish();
}

fn bench_full_pass(c: &mut Criterion) {
    let store = Arc::new(InMemoryGraphStore::new());
    let root = seed_tree(&store, 4096);
    let mut tx = Transaction::new(t0());
    tx.put(Document::Declaration(DeclaredLevel::new(root, ScanLevel::new(3))));
    store.submit(tx).unwrap();
    let propagator = ScanProfilePropagator::new(store.clone(), LevelConfig::default(), PropagationConfig::default());
    propagator.propagate_all(t0()).unwrap();

    c.bench_function("propagation/full_pass_settled_4096", |b| {
        b.iter(|| propagator.propagate_all(t0()).unwrap());
    });
}

fn bench_ingest_and_flush(c: &mut Criterion) {
    c.bench_function("engine/ingest_await_flush", |b| {
        b.iter_custom(|iters| {
            let engine = GraphEngine::new(
                Arc::new(InMemoryGraphStore::new()),
                Arc::new(InMemoryQueue::new()),
                EngineConfig::default(),
            )
            .unwrap();

            let start = Instant::now();
            for i in 0..iters {
                let payload = OriginPayload::observation(OriginId::new(format!("scanner|{i}")), t0())
                    .with_object(host(i as usize));
                let result = engine.ingest(&payload).unwrap();
                if let Some(tx) = result.transaction_id {
                    assert!(engine.await_flush(tx, Duration::from_secs(10)));
                }
            }
            start.elapsed()
        });
    });
}

criterion_group!(propagation, bench_incremental_declaration, bench_full_pass, bench_ingest_and_flush);
criterion_main!(propagation);
