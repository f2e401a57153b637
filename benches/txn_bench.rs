//! Transaction manager benchmarks
//!
//! Run with: `cargo bench --bench txn_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use motetx::tuple;
use motetx::txn::MemoryJournal;
use motetx::{Request, SpaceDef, TxManager, TxnConfig, Value};
use rand::Rng;
use std::sync::Arc;

const SPACE: u32 = 512;

fn setup() -> (TxManager, Arc<MemoryJournal>) {
    let (manager, journal) = TxManager::with_memory_journal(TxnConfig::default()).unwrap();
    manager
        .create_space(SpaceDef::new(SPACE, "bench", manager.memtx()))
        .unwrap();
    (manager, journal)
}

/// Autocommit inserts, one journal entry each
fn bench_autocommit_insert(c: &mut Criterion) {
    let (manager, _journal) = setup();
    let mut next = 0i64;
    c.bench_function("autocommit_insert", |b| {
        b.iter(|| {
            next += 1;
            manager
                .execute(black_box(&Request::insert(SPACE, tuple![next, "payload"])))
                .unwrap()
        });
    });
}

/// Multi-statement transactions of varying size
fn bench_batch_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_commit");
    for size in [1usize, 10, 100] {
        let (manager, _journal) = setup();
        let mut next = 0i64;
        group.bench_with_input(BenchmarkId::new("replace", size), &size, |b, &size| {
            b.iter(|| {
                let mut txn = manager.begin().unwrap();
                for _ in 0..size {
                    next += 1;
                    txn.replace(SPACE, tuple![next % 1000, "payload"]).unwrap();
                }
                txn.commit().unwrap();
            });
        });
    }
    group.finish();
}

/// Tracked reads of committed data inside a transaction
fn bench_tracked_reads(c: &mut Criterion) {
    let (manager, _journal) = setup();
    for k in 0..1000i64 {
        manager.execute(&Request::insert(SPACE, tuple![k, "payload"])).unwrap();
    }
    let mut rng = rand::thread_rng();
    c.bench_function("tracked_reads_x100", |b| {
        b.iter(|| {
            let mut txn = manager.begin().unwrap();
            for _ in 0..100 {
                let key = vec![Value::Integer(rng.gen_range(0..1000))];
                black_box(txn.get(SPACE, 0, &key).unwrap());
            }
            txn.commit().unwrap();
        });
    });
}

/// Savepoint rollback of a few statements
fn bench_savepoint_rollback(c: &mut Criterion) {
    let (manager, _journal) = setup();
    c.bench_function("savepoint_rollback", |b| {
        b.iter(|| {
            let mut txn = manager.begin().unwrap();
            let sp = txn.savepoint(None).unwrap();
            for k in 0..10i64 {
                txn.insert(SPACE, tuple![k, "scratch"]).unwrap();
            }
            txn.rollback_to_savepoint(sp).unwrap();
            txn.rollback().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_autocommit_insert,
    bench_batch_commit,
    bench_tracked_reads,
    bench_savepoint_rollback
);
criterion_main!(benches);
