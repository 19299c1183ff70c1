//! The orchestrator running all coordinators of one quorum.

use std::collections::BTreeMap;

use tracing::debug;

use super::{
    EvaluationContext,
    gate::{GateEvaluationProtocol, MultiQuorumGateEvaluation},
};
use crate::{
    circuit::OutputGateAddress,
    protocol_id::ProtocolId,
    quorum::PartyId,
    runtime::{Composed, Context, Error, Event, Logic, SubResult, Value},
};

/// An orchestrator wrapped into a protocol.
pub type CircuitEvaluationProtocol<V> = Composed<V, MultiQuorumCircuitEvaluation<V>>;

/// Evaluates the gates assigned to one quorum, on behalf of one of its members.
///
/// All coordinators are launched as a single batch when the orchestrator starts, tagged with the
/// topological rank of their gate. The orchestrator completes with the union of the circuit
/// outputs produced by its coordinators.
#[derive(Debug)]
pub struct MultiQuorumCircuitEvaluation<V: Value> {
    me: PartyId,
    quorum: usize,
    shared: EvaluationContext<V>,
}

impl<V: Value> MultiQuorumCircuitEvaluation<V> {
    /// The orchestrator of the quorum at index `quorum` for party `me`.
    pub fn protocol(
        id: ProtocolId,
        me: PartyId,
        quorum: usize,
        shared: EvaluationContext<V>,
    ) -> CircuitEvaluationProtocol<V> {
        let participants = shared
            .mapping
            .quorum(quorum)
            .map(|q| q.members().to_vec())
            .unwrap_or_default();
        Composed::new(id, participants, Self { me, quorum, shared })
    }

    /// The index of the quorum this orchestrator works for.
    pub fn quorum(&self) -> usize {
        self.quorum
    }
}

impl<V: Value> Logic<V> for MultiQuorumCircuitEvaluation<V> {
    type Sub = BTreeMap<OutputGateAddress, V>;
    type Output = BTreeMap<OutputGateAddress, V>;

    fn start(
        &mut self,
        cx: &mut Context<'_, V, Self::Sub, Self::Output>,
    ) -> Result<(), Error> {
        let gates = self.shared.mapping.gates_of(self.quorum);
        debug!(
            me = self.me,
            quorum = self.quorum,
            gates = gates.len(),
            "starting orchestrator"
        );
        if gates.is_empty() {
            cx.complete(BTreeMap::new());
            return Ok(());
        }
        let coordinators = gates
            .iter()
            .map(|&gate| {
                let rank = self
                    .shared
                    .circuit
                    .rank(gate)
                    .ok_or(Error::UnassignedGate(gate))?;
                let coordinator: GateEvaluationProtocol<V> =
                    MultiQuorumGateEvaluation::protocol(self.me, gate, self.shared.clone())?;
                Ok((rank as u64, coordinator))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        cx.execute_all(coordinators)
    }

    fn handle(
        &mut self,
        cx: &mut Context<'_, V, Self::Sub, Self::Output>,
        event: Event<V, Self::Sub>,
    ) -> Result<(), Error> {
        match event {
            Event::SubProtocolCompleted(results) => {
                let mut outputs = BTreeMap::new();
                for SubResult { result, .. } in results {
                    outputs.extend(result);
                }
                debug!(
                    me = self.me,
                    quorum = self.quorum,
                    outputs = outputs.len(),
                    "orchestrator done"
                );
                cx.complete(outputs);
                Ok(())
            }
            Event::Message { from, .. } => Err(Error::UnexpectedMessage { id: cx.id(), from }),
        }
    }
}
