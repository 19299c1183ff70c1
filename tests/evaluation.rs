use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use multiquorum::{
    Error,
    circuit::{
        Circuit, ComputationGateType, Gate, GateConnection, GateId, InputGateAddress,
        OutputGateAddress,
        sorting::bitonic_sort,
    },
    config::EvaluationConfig,
    evaluation::{
        CircuitEvaluationProtocol, EvaluationPlan, Factories, GateEvaluationFactory,
        ResharingFactory,
    },
    party::Party,
    plaintext::{IdentityEvaluation, MajorityResharing, PlaintextCompareAndSwap, evaluate_circuit},
    protocol_id::ProtocolId,
    quorum::{PartyId, Quorum},
    runtime::{BoxedProtocol, Immediate},
    simulation::simulate_evaluation,
};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Default)]
struct Counters {
    evaluations: AtomicUsize,
    reshares: AtomicUsize,
    receives: AtomicUsize,
}

/// Counts how often sub-protocols are requested before delegating to the plaintext ones.
#[derive(Clone, Default)]
struct Counting(Arc<Counters>);

impl GateEvaluationFactory<u32> for Counting {
    fn evaluation_protocol(
        &self,
        gate: ComputationGateType,
        me: PartyId,
        quorum: &Quorum,
        inputs: Vec<u32>,
        id: ProtocolId,
    ) -> Result<BoxedProtocol<u32, Vec<u32>>, Error> {
        self.0.evaluations.fetch_add(1, Ordering::SeqCst);
        PlaintextCompareAndSwap.evaluation_protocol(gate, me, quorum, inputs, id)
    }
}

impl ResharingFactory<u32> for Counting {
    fn resharing_protocol(
        &self,
        me: PartyId,
        from: &Quorum,
        to: &Quorum,
        value: Option<u32>,
        gate_rank: usize,
        port: usize,
    ) -> Result<BoxedProtocol<u32, Option<u32>>, Error> {
        match value {
            Some(_) => self.0.reshares.fetch_add(1, Ordering::SeqCst),
            None => self.0.receives.fetch_add(1, Ordering::SeqCst),
        };
        MajorityResharing.resharing_protocol(me, from, to, value, gate_rank, port)
    }
}

/// Produces one output too few for every gate.
struct Truncating;

impl GateEvaluationFactory<u32> for Truncating {
    fn evaluation_protocol(
        &self,
        _gate: ComputationGateType,
        _me: PartyId,
        _quorum: &Quorum,
        mut inputs: Vec<u32>,
        id: ProtocolId,
    ) -> Result<BoxedProtocol<u32, Vec<u32>>, Error> {
        inputs.pop();
        Ok(Box::new(Immediate::new(id, inputs)))
    }
}

/// Two compare-and-swap gates, the second one consuming both outputs of the first.
fn chain() -> (Circuit, GateId, GateId) {
    let mut circuit = Circuit::new();
    let a = circuit.add_gate(Gate::compare_and_swap(), []).unwrap();
    let b = circuit.next_gate_id();
    circuit
        .add_gate(
            Gate::compare_and_swap(),
            [
                GateConnection::new(a.output(0), b.input(1)),
                GateConnection::new(a.output(1), b.input(0)),
            ],
        )
        .unwrap();
    (circuit, a, b)
}

struct Run {
    outputs: Vec<BTreeMap<OutputGateAddress, u32>>,
    loopbacks: Vec<usize>,
}

/// Runs every party in lockstep on the current thread.
fn run_in_lockstep(
    plan: &EvaluationPlan,
    parties: usize,
    inputs: BTreeMap<InputGateAddress, u32>,
    factories: &Factories<u32>,
) -> Result<Run, Error> {
    let inputs = Arc::new(inputs);
    let mut parties: Vec<Party<u32, CircuitEvaluationProtocol<u32>>> = (0..parties)
        .map(|me| Party::new(me, plan.protocols_for(me, Arc::clone(&inputs), factories)))
        .collect();
    for party in parties.iter_mut() {
        party.start()?;
    }
    loop {
        let envelopes: Vec<_> = parties
            .iter_mut()
            .flat_map(|party| party.take_outgoing())
            .collect();
        if envelopes.is_empty() {
            break;
        }
        for envelope in envelopes {
            parties[envelope.to].deliver(envelope)?;
        }
    }
    assert!(parties.iter().all(|party| party.is_completed()));
    let mut outputs = vec![];
    for party in parties.iter_mut() {
        outputs.push(party.take_results()?.into_iter().flatten().collect());
    }
    Ok(Run {
        outputs,
        loopbacks: parties.iter().map(|p| p.loopbacks_delivered()).collect(),
    })
}

#[test]
fn single_quorum_identity_evaluation() -> Result<(), Error> {
    let (circuit, a, b) = chain();
    let plan = EvaluationPlan::with_quorums(circuit, vec![Quorum::new(0, [0, 1])])?;
    let factories = Factories::new(IdentityEvaluation, MajorityResharing);
    let inputs = BTreeMap::from([(a.input(0), 1), (a.input(1), 2)]);
    let run = run_in_lockstep(&plan, 2, inputs, &factories)?;
    let expected = BTreeMap::from([(b.output(0), 2), (b.output(1), 1)]);
    assert_eq!(run.outputs, vec![expected.clone(), expected]);
    // each party loops both outputs of `a` back to its coordinator of `b`
    assert_eq!(run.loopbacks, vec![2, 2]);
    Ok(())
}

#[test]
fn identity_evaluation_passes_inputs_through() -> Result<(), Error> {
    let mut circuit = Circuit::new();
    let g = circuit.add_gate(Gate::compare_and_swap(), [])?;
    let plan = EvaluationPlan::with_quorums(circuit, vec![Quorum::new(0, [0, 1, 2])])?;
    let factories = Factories::new(IdentityEvaluation, MajorityResharing);
    let inputs = BTreeMap::from([(g.input(0), 7), (g.input(1), 3)]);
    let run = run_in_lockstep(&plan, 3, inputs, &factories)?;
    let expected = BTreeMap::from([(g.output(0), 7), (g.output(1), 3)]);
    assert_eq!(run.outputs, vec![expected; 3]);
    assert_eq!(run.loopbacks, vec![0; 3]);
    Ok(())
}

#[test]
fn joined_circuits_reshare_once_per_party() -> Result<(), Error> {
    let mut first = Circuit::new();
    let a = first.add_gate(Gate::compare_and_swap(), [])?;
    let mut second = Circuit::new();
    let b = second.add_gate(Gate::compare_and_swap(), [])?;
    let remap = first.join_with(second, &[(a.output(1), b.input(0))])?;
    let b = remap.gate(b);

    let quorums = vec![Quorum::new(0, [0, 1, 2]), Quorum::new(1, [3, 4, 5])];
    let plan = EvaluationPlan::with_quorums(first, quorums)?;
    assert_eq!(plan.mapping().quorum_index_of(a), Some(0));
    assert_eq!(plan.mapping().quorum_index_of(b), Some(1));

    let counting = Counting::default();
    let factories = Factories::new(counting.clone(), counting.clone());
    let inputs = BTreeMap::from([(a.input(0), 10), (a.input(1), 20), (b.input(1), 15)]);
    let run = run_in_lockstep(&plan, 6, inputs, &factories)?;

    for party in 0..3 {
        assert_eq!(run.outputs[party], BTreeMap::from([(a.output(0), 10)]));
    }
    for party in 3..6 {
        assert_eq!(
            run.outputs[party],
            BTreeMap::from([(b.output(0), 15), (b.output(1), 20)])
        );
    }
    assert_eq!(counting.0.reshares.load(Ordering::SeqCst), 3);
    assert_eq!(counting.0.receives.load(Ordering::SeqCst), 3);
    assert_eq!(run.loopbacks, vec![0; 6]);
    Ok(())
}

#[test]
fn disjoint_quorums_reshare_every_wire() -> Result<(), Error> {
    let (circuit, a, b) = chain();
    let quorums = vec![Quorum::new(0, [0, 1, 2]), Quorum::new(1, [3, 4, 5])];
    let plan = EvaluationPlan::with_quorums(circuit, quorums)?;
    let counting = Counting::default();
    let factories = Factories::new(counting.clone(), counting.clone());
    let inputs = BTreeMap::from([(a.input(0), 9), (a.input(1), 4)]);
    let run = run_in_lockstep(&plan, 6, inputs, &factories)?;

    let expected = BTreeMap::from([(b.output(0), 4), (b.output(1), 9)]);
    for (party, outputs) in run.outputs.iter().enumerate() {
        if party < 3 {
            assert!(outputs.is_empty());
        } else {
            assert_eq!(outputs, &expected);
        }
    }
    let counters = &counting.0;
    assert_eq!(counters.evaluations.load(Ordering::SeqCst), 6);
    assert_eq!(counters.reshares.load(Ordering::SeqCst), 6);
    assert_eq!(counters.receives.load(Ordering::SeqCst), 6);
    assert_eq!(run.loopbacks, vec![0; 6]);
    Ok(())
}

#[test]
fn overlapping_members_skip_receiving() -> Result<(), Error> {
    let (circuit, a, b) = chain();
    let quorums = vec![Quorum::new(0, [0, 1, 2]), Quorum::new(1, [2, 3, 4])];
    let plan = EvaluationPlan::with_quorums(circuit, quorums)?;
    let counting = Counting::default();
    let factories = Factories::new(counting.clone(), counting.clone());
    let inputs = BTreeMap::from([(a.input(0), 5), (a.input(1), 6)]);
    let run = run_in_lockstep(&plan, 5, inputs, &factories)?;

    let expected = BTreeMap::from([(b.output(0), 5), (b.output(1), 6)]);
    for party in 2..5 {
        assert_eq!(run.outputs[party], expected);
    }
    // party 2 reshares but never receives
    assert_eq!(counting.0.reshares.load(Ordering::SeqCst), 6);
    assert_eq!(counting.0.receives.load(Ordering::SeqCst), 4);
    // its own shares and the reshared values reach it locally
    assert_eq!(run.loopbacks, vec![0, 0, 4, 0, 0]);
    Ok(())
}

#[test]
fn wrong_arity_is_reported() {
    let (circuit, a, _) = chain();
    let plan = EvaluationPlan::with_quorums(circuit, vec![Quorum::new(0, [0])]).unwrap();
    let factories = Factories::new(Truncating, MajorityResharing);
    let inputs = BTreeMap::from([(a.input(0), 1), (a.input(1), 2)]);
    let err = run_in_lockstep(&plan, 1, inputs, &factories).err().unwrap();
    assert!(matches!(
        err,
        Error::WrongArity {
            expected: 2,
            actual: 1,
            ..
        }
    ));
}

#[test]
fn bitonic_sort_on_two_quorums() -> Result<(), Error> {
    let _guard = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default();

    let net = bitonic_sort(8, false)?;
    let values = [31u32, 7, 19, 3, 25, 11, 2, 17];
    let inputs: BTreeMap<_, _> = values
        .iter()
        .enumerate()
        .map(|(wire, v)| (net.first(wire).unwrap(), *v))
        .collect();
    let last: Vec<_> = (0..8).map(|wire| net.last(wire).unwrap()).collect();
    let config = EvaluationConfig {
        quorum_count: 2,
        quorum_size: 4,
        seed: 2024,
    };
    let factories = Factories::new(PlaintextCompareAndSwap, MajorityResharing);
    let outputs = simulate_evaluation(net.into_circuit(), 6, &config, inputs, &factories)?;
    let sorted: Vec<_> = last.iter().map(|addr| outputs[addr]).collect();
    let mut expected = values.to_vec();
    expected.sort();
    assert_eq!(sorted, expected);
    Ok(())
}

#[test]
fn simulation_agrees_with_clear_evaluation() -> Result<(), Error> {
    let mut net = bitonic_sort(8, false)?;
    let collapsed = net.collapse_permutation_gates()?;
    assert!(collapsed.removed > 0);
    let inputs: BTreeMap<_, _> = [4u32, 9, 1, 12, 3, 3, 8, 0]
        .into_iter()
        .enumerate()
        .map(|(wire, v)| (net.first(wire).unwrap(), v))
        .collect();
    let circuit = net.into_circuit();
    let expected = evaluate_circuit(&circuit, &inputs)?;
    let config = EvaluationConfig {
        quorum_count: 3,
        quorum_size: 2,
        seed: 5,
    };
    let factories = Factories::new(PlaintextCompareAndSwap, MajorityResharing);
    let outputs = simulate_evaluation(circuit, 5, &config, inputs, &factories)?;
    assert_eq!(outputs, expected);
    Ok(())
}
