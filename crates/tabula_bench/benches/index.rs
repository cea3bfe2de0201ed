//! Index list benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tabula_bench::shuffled_ids;
use tabula_core::index::{IndexIntegerList, IndexSetStore};
use tabula_storage::{AreaStore, HeapAreaStore};

/// Benchmark sorted inserts into a working list.
fn bench_insert_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_insert_sort");

    for count in [1_000u32, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(u64::from(*count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let ids = shuffled_ids(count);
            b.iter(|| {
                let mut list = IndexIntegerList::new(512);
                for id in &ids {
                    list.insert_sort(*id);
                }
                black_box(list.len());
            });
        });
    }
    group.finish();
}

/// Benchmark committing a modified list back to the store.
fn bench_commit_index_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_commit");

    for changes in [1u32, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(u64::from(*changes)));
        group.bench_with_input(BenchmarkId::from_parameter(changes), changes, |b, &changes| {
            let store: Arc<dyn AreaStore> = Arc::new(HeapAreaStore::new());
            let start = IndexSetStore::create(store.as_ref(), 1, 512).unwrap();
            let index = IndexSetStore::open(Arc::clone(&store), start).unwrap();
            let mut next = 0u32;

            b.iter(|| {
                let mut set = index.snapshot().unwrap();
                let list = set.get_index(0).unwrap();
                for _ in 0..changes {
                    list.insert_sort(next);
                    next += 1;
                }
                index.commit_index_set(&set).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert_sort, bench_commit_index_set);
criterion_main!(benches);
