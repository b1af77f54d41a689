//! Basic benchmarks for the `cascade_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use alloc_tracker::Allocator;
use cascade_pool::PoolForest;
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const ALLOCATION_BYTES: usize = 64;

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("cascade_basic");

    let allocs_op = allocs.operation("build_empty");
    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(PoolForest::new()));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("allocate_one");
    group.bench_function("allocate_one", |b| {
        b.iter_custom(|iters| {
            let mut forest = PoolForest::new();
            let pool = forest.create_root();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(forest.allocate(pool, ALLOCATION_BYTES).unwrap());
            }

            let elapsed = start.elapsed();

            forest.destroy(pool).unwrap();

            elapsed
        });
    });

    let allocs_op = allocs.operation("create_destroy_child");
    group.bench_function("create_destroy_child", |b| {
        b.iter_custom(|iters| {
            let mut forest = PoolForest::new();
            let root = forest.create_root();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let child = forest.create_child(root).unwrap();
                forest.destroy(black_box(child)).unwrap();
            }

            let elapsed = start.elapsed();

            forest.destroy(root).unwrap();

            elapsed
        });
    });

    let allocs_op = allocs.operation("destroy_with_1k_cleanups");
    group.bench_function("destroy_with_1k_cleanups", |b| {
        b.iter_custom(|iters| {
            let mut forest = PoolForest::new();

            let pools = iter::repeat_with(|| {
                let pool = forest.create_root();
                for _ in 0..1_000 {
                    _ = forest.register_cleanup(pool, || Ok(())).unwrap();
                }
                pool
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for pool in pools {
                forest.destroy(black_box(pool)).unwrap();
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("fill_and_clear_64k");
    group.bench_function("fill_and_clear_64k", |b| {
        b.iter_custom(|iters| {
            let mut forest = PoolForest::new();
            let pool = forest.create_root();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..1_024 {
                    _ = black_box(forest.allocate(pool, ALLOCATION_BYTES).unwrap());
                }
                forest.clear(pool).unwrap();
            }

            let elapsed = start.elapsed();

            forest.destroy(pool).unwrap();

            elapsed
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
