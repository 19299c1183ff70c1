//! Insecure reference implementations of the sub-protocols, operating on values in the clear.
//!
//! These are meant for tests, benchmarks and for checking a circuit before running it with real
//! cryptography: [`PlaintextCompareAndSwap`] evaluates gates locally, [`MajorityResharing`] sends
//! the value of every source party to every destination party, and [`evaluate_circuit`] evaluates
//! a whole circuit without any parties at all.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::{
    circuit::{Circuit, ComputationGateType, Gate, InputGateAddress, OutputGateAddress},
    evaluation::{GateEvaluationFactory, ResharingFactory},
    protocol_id::ProtocolId,
    quorum::{PartyId, Quorum},
    runtime::{BoxedProtocol, Composed, Context, Error, Event, Immediate, Logic, Msg, Value},
};

fn compare_and_swap<V: Ord>(a: V, b: V) -> [V; 2] {
    if b < a { [b, a] } else { [a, b] }
}

/// Evaluates compare-and-swap gates on clear values, without any communication.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCompareAndSwap;

impl<V: Value + Ord> GateEvaluationFactory<V> for PlaintextCompareAndSwap {
    fn evaluation_protocol(
        &self,
        gate: ComputationGateType,
        _me: PartyId,
        _quorum: &Quorum,
        inputs: Vec<V>,
        id: ProtocolId,
    ) -> Result<BoxedProtocol<V, Vec<V>>, Error> {
        let expected = gate.input_count();
        let [a, b]: [V; 2] = inputs.try_into().map_err(|inputs: Vec<V>| {
            Error::SubProtocol(
                format!("{gate:?} expects {expected} inputs, got {}", inputs.len()).into(),
            )
        })?;
        let protocol: BoxedProtocol<V, Vec<V>> =
            Box::new(Immediate::new(id, compare_and_swap(a, b).to_vec()));
        Ok(protocol)
    }
}

/// Passes the inputs of every gate through unchanged, whatever the gate type.
///
/// Useful to test the data flow of an evaluation with values that have no order.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityEvaluation;

impl<V: Value> GateEvaluationFactory<V> for IdentityEvaluation {
    fn evaluation_protocol(
        &self,
        _gate: ComputationGateType,
        _me: PartyId,
        _quorum: &Quorum,
        inputs: Vec<V>,
        id: ProtocolId,
    ) -> Result<BoxedProtocol<V, Vec<V>>, Error> {
        let protocol: BoxedProtocol<V, Vec<V>> = Box::new(Immediate::new(id, inputs));
        Ok(protocol)
    }
}

/// Moves a value between quorums by sending it from every source member to every destination
/// member. Destination members keep the value sent by the majority of the source quorum.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityResharing;

impl<V: Value> ResharingFactory<V> for MajorityResharing {
    fn resharing_protocol(
        &self,
        _me: PartyId,
        from: &Quorum,
        to: &Quorum,
        value: Option<V>,
        gate_rank: usize,
        port: usize,
    ) -> Result<BoxedProtocol<V, Option<V>>, Error> {
        let mut participants: Vec<PartyId> =
            from.members().iter().chain(to.members()).copied().collect();
        participants.sort_unstable();
        participants.dedup();
        let logic = Resharing {
            sources: from.members().to_vec(),
            targets: to.members().to_vec(),
            value,
            received: BTreeMap::new(),
        };
        let protocol: BoxedProtocol<V, Option<V>> = Box::new(Composed::new(
            ProtocolId::gate_input_sharing(gate_rank, port),
            participants,
            logic,
        ));
        Ok(protocol)
    }
}

struct Resharing<V> {
    sources: Vec<PartyId>,
    targets: Vec<PartyId>,
    value: Option<V>,
    received: BTreeMap<PartyId, V>,
}

/// The first of the most frequent values.
fn majority<V: PartialEq + Clone>(values: &[V]) -> Option<V> {
    let mut best: Option<(&V, usize)> = None;
    for v in values {
        let count = values.iter().filter(|w| *w == v).count();
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((v, count));
        }
    }
    best.map(|(v, _)| v.clone())
}

impl<V: Value> Logic<V> for Resharing<V> {
    type Sub = ();
    type Output = Option<V>;

    fn start(&mut self, cx: &mut Context<'_, V, (), Option<V>>) -> Result<(), Error> {
        let me = cx.me();
        if self.sources.contains(&me) {
            if let Some(value) = self.value.take() {
                cx.multicast(&self.targets, Msg::Share(value));
            }
        }
        if !self.targets.contains(&me) {
            cx.complete(None);
        }
        Ok(())
    }

    fn handle(
        &mut self,
        cx: &mut Context<'_, V, (), Option<V>>,
        event: Event<V, ()>,
    ) -> Result<(), Error> {
        let (from, value) = match event {
            Event::Message {
                from,
                msg: Msg::Share(value),
            } => (from, value),
            Event::Message { from, .. } => {
                return Err(Error::UnexpectedMessage { id: cx.id(), from });
            }
            Event::SubProtocolCompleted(_) => return Err(Error::MissingResult(cx.id())),
        };
        if !self.sources.contains(&from) {
            warn!(id = %cx.id(), from, "ignoring share from a party outside the source quorum");
            return Ok(());
        }
        if self.received.contains_key(&from) {
            warn!(id = %cx.id(), from, "ignoring repeated share");
            return Ok(());
        }
        self.received.insert(from, value);
        trace!(id = %cx.id(), from, received = self.received.len(), "received share");
        if self.received.len() == self.sources.len() {
            let values: Vec<V> = self.received.values().cloned().collect();
            cx.complete(majority(&values));
        }
        Ok(())
    }
}

/// Evaluates `circuit` on clear values, returning the value of every circuit output.
pub fn evaluate_circuit<V: Clone + Ord>(
    circuit: &Circuit,
    inputs: &BTreeMap<InputGateAddress, V>,
) -> Result<BTreeMap<OutputGateAddress, V>, Error> {
    let mut wires: BTreeMap<InputGateAddress, V> = BTreeMap::new();
    let mut outputs = BTreeMap::new();
    for &id in circuit.topological_order()? {
        let Some(gate) = circuit.gate(id) else {
            continue;
        };
        let values = (0..gate.input_count())
            .map(|port| {
                let addr = id.input(port);
                match circuit.source_of(addr) {
                    Some(_) => wires.remove(&addr).ok_or(Error::MissingGateInput(addr)),
                    None => inputs
                        .get(&addr)
                        .cloned()
                        .ok_or(Error::MissingCircuitInput(addr)),
                }
            })
            .collect::<Result<Vec<V>, Error>>()?;
        let results = match gate {
            Gate::Computation(ComputationGateType::CompareAndSwap) => {
                let [a, b]: [V; 2] = values.try_into().map_err(|values: Vec<V>| {
                    Error::WrongArity {
                        gate: id,
                        expected: 2,
                        actual: values.len(),
                    }
                })?;
                compare_and_swap(a, b).to_vec()
            }
            Gate::Permutation(permutation) => permutation.apply(&values),
        };
        for (port, value) in results.into_iter().enumerate() {
            let output = id.output(port);
            match circuit.consumer_of(output) {
                Some(consumer) => {
                    wires.insert(consumer, value);
                }
                None => {
                    outputs.insert(output, value);
                }
            }
        }
    }
    Ok(outputs)
}
