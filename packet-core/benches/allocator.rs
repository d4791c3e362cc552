//! Allocator benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use packet_core::{allocator::allocate_with_rng, SplitPolicy};
use rand::{rngs::StdRng, SeedableRng};

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");

    for shares in [10u32, 100, 1_000] {
        for policy in [SplitPolicy::Even, SplitPolicy::Random] {
            group.bench_with_input(
                BenchmarkId::new(policy.to_string(), shares),
                &shares,
                |b, &shares| {
                    let mut rng = StdRng::seed_from_u64(42);
                    b.iter(|| {
                        allocate_with_rng(black_box(100_000_000), shares, policy, &mut rng)
                            .map(|amounts| amounts.len())
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_allocate);
criterion_main!(benches);
