//! Benchmark for PersistentHashMap.
//!
//! Compares persistent operations against the standard `HashMap`.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use persimmon::PersistentHashMap;
use std::collections::HashMap;
use std::hint::black_box;

fn benchmark_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("hashmap_insert");

    for size in [1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("PersistentHashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = PersistentHashMap::new();
                    for key in 0..size {
                        map = map.insert(black_box(key), black_box(key));
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("HashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = HashMap::new();
                    for key in 0..size {
                        map.insert(black_box(key), black_box(key));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

fn benchmark_get(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("hashmap_get");

    for size in [1_000, 10_000] {
        let map: PersistentHashMap<i32, i32> = (0..size).map(|key| (key, key)).collect();
        let native: HashMap<i32, i32> = (0..size).map(|key| (key, key)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentHashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut total = 0i32;
                    for key in 0..size {
                        total = total.wrapping_add(*map.get(&black_box(key)).unwrap_or(&0));
                    }
                    black_box(total)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("HashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut total = 0i32;
                    for key in 0..size {
                        total = total.wrapping_add(*native.get(&black_box(key)).unwrap_or(&0));
                    }
                    black_box(total)
                });
            },
        );
    }

    group.finish();
}

fn benchmark_remove(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("hashmap_remove");

    for size in [1_000, 10_000] {
        let map: PersistentHashMap<i32, i32> = (0..size).map(|key| (key, key)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentHashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut current = map.clone();
                    for key in (0..size).step_by(10) {
                        current = current.remove(&black_box(key));
                    }
                    black_box(current)
                });
            },
        );
    }

    group.finish();
}

fn benchmark_merge(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("hashmap_merge");

    for size in [1_000, 10_000] {
        let left: PersistentHashMap<i32, i32> = (0..size).map(|key| (key, key)).collect();
        let right: PersistentHashMap<i32, i32> =
            (size / 2..size + size / 2).map(|key| (key, key * 2)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentHashMap", size),
            &size,
            |bencher, _| {
                bencher.iter(|| black_box(left.merge(&right)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_get,
    benchmark_remove,
    benchmark_merge
);
criterion_main!(benches);
