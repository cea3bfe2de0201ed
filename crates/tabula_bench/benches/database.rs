//! Database operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tabula_bench::{bench_db, bench_row, random_data, BENCH_TABLE};
use tabula_core::Value;

/// Benchmark single-row insert transactions.
fn bench_single_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_insert");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let db = bench_db();
            let data = random_data(size);
            let mut key = 0i64;

            b.iter(|| {
                key += 1;
                db.transaction(|txn| txn.insert(BENCH_TABLE, black_box(&bench_row(key, &data))))
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark batch inserts in one transaction.
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_insert");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let db = bench_db();
                let data = random_data(256);
                let mut next = 0i64;

                b.iter(|| {
                    db.transaction(|txn| {
                        for _ in 0..batch_size {
                            next += 1;
                            txn.insert(BENCH_TABLE, &bench_row(next, &data))?;
                        }
                        Ok(())
                    })
                    .unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark point lookups through the key index.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_lookup");

    for rows in [100i64, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, &rows| {
            let db = bench_db();
            let data = random_data(64);
            db.transaction(|txn| {
                for key in 0..rows {
                    txn.insert(BENCH_TABLE, &bench_row(key, &data))?;
                }
                Ok(())
            })
            .unwrap();
            let mut txn = db.begin().unwrap();
            let mut key = 0i64;

            b.iter(|| {
                key = (key + 7919) % rows;
                let view = txn.table(BENCH_TABLE).unwrap();
                black_box(view.select_equal(0, &Value::Integer(key)).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark update transactions, which add a row and retire another.
fn bench_update(c: &mut Criterion) {
    c.bench_function("update_row", |b| {
        let db = bench_db();
        let data = random_data(128);
        let mut row = db
            .transaction(|txn| txn.insert(BENCH_TABLE, &bench_row(0, &data)))
            .unwrap();
        let mut key = 0i64;

        b.iter(|| {
            key += 1;
            row = db
                .transaction(|txn| txn.update(BENCH_TABLE, row, &bench_row(key, &data)))
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_single_insert,
    bench_batch_insert,
    bench_point_lookup,
    bench_update
);
criterion_main!(benches);
