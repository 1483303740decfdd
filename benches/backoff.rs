//! Backoff Computation Benchmarks
//!
//! The delay calculation runs once per retried attempt, so it only needs to be
//! cheap relative to a network round trip. These benchmarks keep an eye on:
//! - Base delay computation, below and at the cap
//! - Jittered delay with a seeded `StdRng`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rebound::{RetryConfig, RetryPolicy};

fn bench_base_delay(c: &mut Criterion) {
    let policy = RetryPolicy::new(RetryConfig::default()).unwrap();

    c.bench_function("base_delay_below_cap", |b| {
        b.iter(|| policy.base_delay(black_box(3)));
    });

    c.bench_function("base_delay_capped", |b| {
        b.iter(|| policy.base_delay(black_box(40)));
    });
}

fn bench_jittered_delay(c: &mut Criterion) {
    let policy = RetryPolicy::new(RetryConfig::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    c.bench_function("delay_for_with_jitter", |b| {
        b.iter(|| policy.delay_for(black_box(4), &mut rng));
    });
}

criterion_group!(benches, bench_base_delay, bench_jittered_delay);
criterion_main!(benches);
