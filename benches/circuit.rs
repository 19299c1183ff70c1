use std::hint::black_box;

use criterion::{BatchSize, Criterion};
use multiquorum::circuit::sorting::bitonic_sort;

pub fn circuit_benchmarks(c: &mut Criterion) {
    let mut g = c.benchmark_group("circuit");
    for wires in [64, 256] {
        let net = bitonic_sort(wires, false).expect("power of two");
        g.bench_function(format!("bitonic sort {wires}: build"), |b| {
            b.iter(|| bitonic_sort(black_box(wires), false))
        });
        g.bench_function(format!("bitonic sort {wires}: topological order"), |b| {
            b.iter_batched(
                || net.circuit().clone(),
                |circuit| circuit.topological_order().map(<[_]>::len),
                BatchSize::SmallInput,
            )
        });
        g.bench_function(format!("bitonic sort {wires}: collapse"), |b| {
            b.iter_batched(
                || net.clone(),
                |mut net| net.collapse_permutation_gates().map(|c| c.removed),
                BatchSize::SmallInput,
            )
        });
    }
    g.finish();
}
