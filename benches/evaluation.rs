use std::collections::BTreeMap;

use criterion::Criterion;
use multiquorum::{
    circuit::sorting::bitonic_sort,
    config::EvaluationConfig,
    evaluation::{EvaluationPlan, Factories},
    plaintext::{MajorityResharing, PlaintextCompareAndSwap},
    simulation::simulate_plan,
};
use tokio::runtime::Runtime;

pub fn evaluation_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().expect("could not start tokio runtime");
    let factories = Factories::new(PlaintextCompareAndSwap, MajorityResharing);
    let parties = 9;
    let party_ids: Vec<_> = (0..parties).collect();

    let mut g = c.benchmark_group("evaluation");
    for wires in [16, 64] {
        let mut net = bitonic_sort(wires, false).expect("power of two");
        net.collapse_permutation_gates().expect("valid network");
        let inputs: BTreeMap<_, _> = (0..wires)
            .filter_map(|wire| Some((net.first(wire)?, (wires - wire) as u64)))
            .collect();
        let config = EvaluationConfig {
            quorum_count: 3,
            quorum_size: 4,
            seed: 1,
        };
        let plan = EvaluationPlan::new(net.into_circuit(), &party_ids, &config)
            .expect("valid configuration");
        g.throughput(criterion::Throughput::Elements(
            plan.circuit().gate_count() as u64,
        ));
        g.bench_function(format!("simulated bitonic sort {wires}, 3 quorums"), |b| {
            b.to_async(&rt).iter(|| async {
                simulate_plan(&plan, parties, inputs.clone(), &factories)
                    .await
                    .expect("evaluation failed")
            })
        });
    }
    g.finish();
}
