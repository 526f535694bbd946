//! Performance benchmarks for the tracker database and cells.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mdtracker::store::{ChapterHistory, ChapterHistoryReplication};
use mdtracker::{
    Cell, ChapterHistoryRecord, Database, DatabaseConfig, ReplicationHistoryRecord, Schema,
    Timestamp,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

fn create_db(dir: &TempDir) -> Database {
    Database::open_tracker(DatabaseConfig {
        path: dir.path().join("tracker"),
        create_if_missing: true,
        sync_on_commit: false,
        feed_buffer: 1000,
    })
    .unwrap()
}

fn record(i: u64) -> ChapterHistoryRecord {
    let base = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();
    ChapterHistoryRecord::new(format!("chapter-{:08}", i), base.plus(Duration::from_secs(i)))
}

/// Benchmark a history write with its replication row, journaled
fn bench_commit(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = create_db(&dir);
    let mut i = 0u64;

    c.bench_function("commit_history_row", |b| {
        b.iter(|| {
            i += 1;
            let record = record(i);
            let mut txn = db.transaction();
            txn.put::<ChapterHistory>(&record).unwrap();
            txn.put::<ChapterHistoryReplication>(&ReplicationHistoryRecord::pending(&record.id))
                .unwrap();
            black_box(txn.commit().unwrap());
        });
    });
}

/// Benchmark the pending-rows index query with varying history sizes
fn bench_pending_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_query");

    for history_size in [100, 1000, 10000] {
        group.bench_with_input(
            BenchmarkId::new("history_size", history_size),
            &history_size,
            |b, &size| {
                let db = Database::open_in_memory(&Schema::tracker()).unwrap();

                let mut txn = db.transaction();
                for i in 0..size {
                    let record = record(i);
                    let mut history = ReplicationHistoryRecord::pending(&record.id);
                    // One row in ten still pending.
                    if i % 10 != 0 {
                        history = history.acknowledged();
                    }
                    txn.put::<ChapterHistory>(&record).unwrap();
                    txn.put::<ChapterHistoryReplication>(&history).unwrap();
                }
                txn.commit().unwrap();

                b.iter(|| {
                    black_box(
                        db.get_all_from_index(
                            "chapter_history_replication_history",
                            "isReplicated",
                            &json!(0),
                        )
                        .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

/// Benchmark reopening (journal replay) with and without compaction
fn bench_reopen(c: &mut Criterion) {
    let mut group = c.benchmark_group("reopen");
    group.sample_size(20);

    for compacted in [false, true] {
        group.bench_with_input(
            BenchmarkId::new("compacted", compacted),
            &compacted,
            |b, &compacted| {
                let dir = TempDir::new().unwrap();
                {
                    let db = create_db(&dir);
                    for i in 0..1000 {
                        db.put::<ChapterHistory>(&record(i)).unwrap();
                    }
                    if compacted {
                        db.compact().unwrap();
                    }
                }

                b.iter(|| {
                    black_box(create_db(&dir));
                });
            },
        );
    }

    group.finish();
}

/// Benchmark synchronous fan-out to many subscribers
fn bench_cell_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("cell_fanout");

    for subscribers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let cell = Cell::new(0u64);
                let subs: Vec<_> = (0..n)
                    .map(|_| cell.subscribe(|v| {
                        black_box(*v);
                    }))
                    .collect();
                let mut v = 0u64;

                b.iter(|| {
                    v += 1;
                    cell.set(v);
                });

                for sub in subs {
                    sub.unsubscribe();
                }
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_commit,
    bench_pending_query,
    bench_reopen,
    bench_cell_fanout,
);
criterion_main!(benches);
