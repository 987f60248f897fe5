//! Interpreter and scheduler benchmarks using criterion.
//!
//! Measures the cost of running effect chains, forking and joining fibers,
//! and composing causes.
//!
//! Run with: cargo bench --bench interpreter_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein_runtime::{collect_all_par, Cause, Effect, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(4).build().unwrap()).unwrap()
}

/// Benchmark a long chain of flat_maps on a single fiber
fn bench_flat_map_chain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("flat_map_chain");

    for depth in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let chain = (0..depth).fold(Effect::<u64, String>::succeed(0), |acc, _| {
                    acc.flat_map(|n| Effect::succeed(n + 1))
                });
                black_box(rt.run(chain))
            });
        });
    }

    group.finish();
}

/// Benchmark failure and recovery through catch_all
fn bench_catch_all(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("catch_all_recovery", |b| {
        b.iter(|| {
            let effect = (0..100).fold(Effect::<u64, String>::succeed(0), |acc, _| {
                acc.flat_map(|_| Effect::<u64, String>::fail("retry".into()))
                    .catch_all(|_| Effect::<u64, String>::succeed(1))
            });
            black_box(rt.run(effect))
        });
    });
}

/// Benchmark fork and join throughput
fn bench_fork_join(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fork_join");

    for fibers in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(fibers as u64));
        group.bench_with_input(BenchmarkId::new("collect_all_par", fibers), &fibers, |b, &fibers| {
            b.iter(|| {
                let effects = (0..fibers as u64).map(Effect::<u64, String>::succeed);
                black_box(rt.run(collect_all_par(effects)))
            });
        });
    }

    group.finish();
}

/// Benchmark cause composition and semantic equality
fn bench_cause_equality(c: &mut Criterion) {
    let mut group = c.benchmark_group("cause");

    let build = |n: usize| {
        (0..n).fold(Cause::<usize>::Empty, |acc, i| {
            if i % 2 == 0 {
                acc.then(Cause::fail(i))
            } else {
                acc.both(Cause::die(format!("d{i}")))
            }
        })
    };

    for size in [8usize, 64] {
        let a = build(size);
        let b = build(size);
        group.bench_with_input(BenchmarkId::new("eq", size), &size, |bench, _| {
            bench.iter(|| black_box(a == b));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_flat_map_chain,
    bench_catch_all,
    bench_fork_join,
    bench_cause_equality,
);
criterion_main!(benches);
