//! The coordinator evaluating one gate on behalf of its quorum.

use std::{collections::BTreeMap, mem, sync::Arc};

use tracing::{debug, trace};

use super::EvaluationContext;
use crate::{
    circuit::{CircuitError, Gate, GateId, InputGateAddress, OutputGateAddress},
    protocol_id::ProtocolId,
    quorum::{GateQuorumMapping, PartyId, Quorum},
    runtime::{Composed, Context, Error, Event, Logic, Msg, ProtocolExt, SubResult, Value},
};

/// A coordinator wrapped into a protocol.
pub type GateEvaluationProtocol<V> = Composed<V, MultiQuorumGateEvaluation<V>>;

type Cx<'a, V> = Context<'a, V, GateStep<V>, BTreeMap<OutputGateAddress, V>>;

fn quorum_of(mapping: &GateQuorumMapping, gate: GateId) -> Result<(usize, &Quorum), Error> {
    let index = mapping
        .quorum_index_of(gate)
        .ok_or(Error::UnassignedGate(gate))?;
    let quorum = mapping.quorum(index).ok_or(Error::UnassignedGate(gate))?;
    Ok((index, quorum))
}

/// The result of a sub-protocol launched by a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum GateStep<V> {
    /// An input value received from another quorum.
    Received(Option<V>),
    /// The outputs of the gate evaluation protocol.
    Evaluated(Vec<V>),
    /// An output value moved to another quorum.
    Reshared(Option<V>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Receiving,
    Evaluating,
    Distributing,
    Done,
}

/// Evaluates one gate for one member of the gate's quorum.
///
/// 1. **Receiving**: circuit inputs are read from the local inputs. Inputs produced by the same
///    quorum, or by a quorum the local party also belongs to, arrive as a loopback
///    [`Msg::GateInput`]. All other inputs are received through resharing protocols.
/// 2. **Evaluating**: once every input is present, the gate evaluation protocol runs under
///    `ProtocolId::gate_eval(rank).nested()`. Uncollapsed permutation gates are routed locally.
/// 3. **Distributing**: each output either becomes a circuit output, is looped back to a
///    coordinator of the same quorum, or is reshared into the quorum of the consuming gate. A
///    party that is also a member of the consuming quorum loops the reshared value back to its
///    own coordinator there.
/// 4. **Done**: the protocol completes with the circuit outputs it produced.
///
/// Loopbacks are only sent once every resharing of the gate has finished.
#[derive(Debug)]
pub struct MultiQuorumGateEvaluation<V: Value> {
    me: PartyId,
    gate: GateId,
    rank: usize,
    quorum: usize,
    shared: EvaluationContext<V>,
    stage: Stage,
    inputs: Vec<Option<V>>,
    loopbacks: Vec<(ProtocolId, Msg<V>)>,
    outputs: BTreeMap<OutputGateAddress, V>,
}

impl<V: Value> MultiQuorumGateEvaluation<V> {
    /// The coordinator of `gate` for party `me`, addressed as `ProtocolId::gate_eval(rank)`.
    pub fn protocol(
        me: PartyId,
        gate: GateId,
        shared: EvaluationContext<V>,
    ) -> Result<GateEvaluationProtocol<V>, Error> {
        let circuit = &shared.circuit;
        let input_count = circuit
            .gate(gate)
            .ok_or(CircuitError::UnknownGate(gate))?
            .input_count();
        let rank = circuit.rank(gate).ok_or(Error::UnassignedGate(gate))?;
        let quorum = shared
            .mapping
            .quorum_index_of(gate)
            .ok_or(Error::UnassignedGate(gate))?;
        let participants = shared
            .mapping
            .quorum(quorum)
            .ok_or(Error::UnassignedGate(gate))?
            .members()
            .to_vec();
        let logic = Self {
            me,
            gate,
            rank,
            quorum,
            shared,
            stage: Stage::Receiving,
            inputs: vec![None; input_count],
            loopbacks: vec![],
            outputs: BTreeMap::new(),
        };
        Ok(Composed::new(ProtocolId::gate_eval(rank), participants, logic))
    }

    /// The gate being evaluated.
    pub fn gate(&self) -> GateId {
        self.gate
    }

    fn consumer_rank(&self, consumer: InputGateAddress) -> Result<usize, Error> {
        self.shared
            .circuit
            .rank(consumer.gate)
            .ok_or(Error::UnassignedGate(consumer.gate))
    }

    fn store(&mut self, addr: InputGateAddress, value: V) -> Result<(), Error> {
        let slot = self
            .inputs
            .get_mut(addr.port)
            .ok_or(CircuitError::InvalidInputPort(addr))?;
        if slot.is_some() {
            return Err(Error::DuplicateInput(addr));
        }
        *slot = Some(value);
        Ok(())
    }

    fn evaluate_if_ready(&mut self, cx: &mut Cx<'_, V>) -> Result<(), Error> {
        if self.stage != Stage::Receiving || self.inputs.iter().any(Option::is_none) {
            return Ok(());
        }
        self.stage = Stage::Evaluating;
        let values: Vec<V> = self.inputs.iter_mut().filter_map(Option::take).collect();
        let circuit = Arc::clone(&self.shared.circuit);
        match circuit
            .gate(self.gate)
            .ok_or(CircuitError::UnknownGate(self.gate))?
        {
            Gate::Permutation(permutation) => {
                trace!(gate = %self.gate, "routing permutation gate locally");
                self.distribute(cx, permutation.apply(&values))
            }
            Gate::Computation(kind) => {
                let mapping = Arc::clone(&self.shared.mapping);
                let (_, quorum) = quorum_of(&mapping, self.gate)?;
                let id = ProtocolId::gate_eval(self.rank).nested();
                let evaluation = self
                    .shared
                    .factories
                    .evaluation
                    .evaluation_protocol(*kind, self.me, quorum, values, id)?;
                debug!(gate = %self.gate, rank = self.rank, "evaluating gate");
                cx.execute(0, evaluation.map(GateStep::Evaluated))
            }
        }
    }

    fn distribute(&mut self, cx: &mut Cx<'_, V>, values: Vec<V>) -> Result<(), Error> {
        self.stage = Stage::Distributing;
        let circuit = Arc::clone(&self.shared.circuit);
        let mapping = Arc::clone(&self.shared.mapping);
        let (_, from) = quorum_of(&mapping, self.gate)?;
        let mut resharing = false;
        for (port, value) in values.into_iter().enumerate() {
            let output = self.gate.output(port);
            let Some(consumer) = circuit.consumer_of(output) else {
                self.outputs.insert(output, value);
                continue;
            };
            let rank = self.consumer_rank(consumer)?;
            let (target, to) = quorum_of(&mapping, consumer.gate)?;
            if target == self.quorum {
                self.loopbacks.push((
                    ProtocolId::gate_eval(rank),
                    Msg::GateInput {
                        port: consumer.port,
                        value,
                    },
                ));
                continue;
            }
            let reshare = self.shared.factories.resharing.resharing_protocol(
                self.me,
                from,
                to,
                Some(value),
                rank,
                consumer.port,
            )?;
            cx.execute(port as u64, reshare.map(GateStep::Reshared))?;
            resharing = true;
        }
        if !resharing {
            self.finish(cx);
        }
        Ok(())
    }

    fn reshared(
        &mut self,
        results: Vec<SubResult<GateStep<V>>>,
        id: ProtocolId,
    ) -> Result<(), Error> {
        let circuit = Arc::clone(&self.shared.circuit);
        let mapping = Arc::clone(&self.shared.mapping);
        for SubResult { tag, result, .. } in results {
            let GateStep::Reshared(value) = result else {
                return Err(Error::MissingResult(id));
            };
            let output = self.gate.output(tag as usize);
            let consumer = circuit
                .consumer_of(output)
                .ok_or(CircuitError::InvalidOutputPort(output))?;
            let (_, to) = quorum_of(&mapping, consumer.gate)?;
            if !to.has_member(self.me) {
                continue;
            }
            let value = value.ok_or(Error::MissingGateInput(consumer))?;
            let rank = self.consumer_rank(consumer)?;
            self.loopbacks.push((
                ProtocolId::gate_eval(rank),
                Msg::GateInput {
                    port: consumer.port,
                    value,
                },
            ));
        }
        Ok(())
    }

    fn finish(&mut self, cx: &mut Cx<'_, V>) {
        for (id, msg) in self.loopbacks.drain(..) {
            trace!(from = %self.gate, to = %id, "looping back gate output");
            cx.loopback(id, msg);
        }
        self.stage = Stage::Done;
        debug!(gate = %self.gate, outputs = self.outputs.len(), "gate done");
        cx.complete(mem::take(&mut self.outputs));
    }
}

impl<V: Value> Logic<V> for MultiQuorumGateEvaluation<V> {
    type Sub = GateStep<V>;
    type Output = BTreeMap<OutputGateAddress, V>;

    fn start(&mut self, cx: &mut Cx<'_, V>) -> Result<(), Error> {
        let circuit = Arc::clone(&self.shared.circuit);
        let mapping = Arc::clone(&self.shared.mapping);
        let (_, own) = quorum_of(&mapping, self.gate)?;
        let mut receives = vec![];
        for port in 0..self.inputs.len() {
            let addr = self.gate.input(port);
            let Some(source) = circuit.source_of(addr) else {
                let value = self
                    .shared
                    .inputs
                    .get(&addr)
                    .cloned()
                    .ok_or(Error::MissingCircuitInput(addr))?;
                self.inputs[port] = Some(value);
                continue;
            };
            let (index, from) = quorum_of(&mapping, source.gate)?;
            if index == self.quorum || from.has_member(self.me) {
                // the value arrives as a loopback from the source coordinator
                continue;
            }
            let receive = self.shared.factories.resharing.resharing_protocol(
                self.me, from, own, None, self.rank, port,
            )?;
            receives.push((port as u64, receive.map(GateStep::Received)));
        }
        cx.execute_all(receives)?;
        self.evaluate_if_ready(cx)
    }

    fn handle(&mut self, cx: &mut Cx<'_, V>, event: Event<V, GateStep<V>>) -> Result<(), Error> {
        match (self.stage, event) {
            (
                Stage::Receiving,
                Event::Message {
                    from,
                    msg: Msg::GateInput { port, value },
                },
            ) if from == cx.me() => {
                self.store(self.gate.input(port), value)?;
                self.evaluate_if_ready(cx)
            }
            (Stage::Receiving, Event::SubProtocolCompleted(results)) => {
                for SubResult { tag, result, .. } in results {
                    let addr = self.gate.input(tag as usize);
                    let GateStep::Received(value) = result else {
                        return Err(Error::MissingResult(cx.id()));
                    };
                    self.store(addr, value.ok_or(Error::MissingGateInput(addr))?)?;
                }
                self.evaluate_if_ready(cx)
            }
            (Stage::Evaluating, Event::SubProtocolCompleted(mut results)) => {
                let Some(SubResult {
                    result: GateStep::Evaluated(values),
                    ..
                }) = results.pop()
                else {
                    return Err(Error::MissingResult(cx.id()));
                };
                let expected = self
                    .shared
                    .circuit
                    .gate(self.gate)
                    .ok_or(CircuitError::UnknownGate(self.gate))?
                    .output_count();
                if values.len() != expected {
                    return Err(Error::WrongArity {
                        gate: self.gate,
                        expected,
                        actual: values.len(),
                    });
                }
                self.distribute(cx, values)
            }
            (Stage::Distributing, Event::SubProtocolCompleted(results)) => {
                self.reshared(results, cx.id())?;
                self.finish(cx);
                Ok(())
            }
            (_, Event::Message { from, .. }) => Err(Error::UnexpectedMessage { id: cx.id(), from }),
            (_, Event::SubProtocolCompleted(_)) => Err(Error::MissingResult(cx.id())),
        }
    }
}
