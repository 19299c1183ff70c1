//! Multi-quorum evaluation of a circuit.
//!
//! Every gate is evaluated by exactly one quorum. For each quorum a party belongs to, it runs one
//! [`MultiQuorumCircuitEvaluation`] orchestrator, which starts one [`MultiQuorumGateEvaluation`]
//! coordinator per gate of that quorum. A coordinator waits for its inputs, evaluates the gate
//! with a protocol obtained from a [`GateEvaluationFactory`] and hands the outputs on: directly to
//! a coordinator of the same quorum, or through a protocol obtained from a [`ResharingFactory`] to
//! the quorum owning the consuming gate.
//!
//! The cryptography lives entirely behind the two factory traits; [`crate::plaintext`] provides
//! insecure reference implementations.

use std::{collections::BTreeMap, fmt, sync::Arc};

use tracing::debug;

use crate::{
    circuit::{Circuit, ComputationGateType, InputGateAddress},
    config::EvaluationConfig,
    protocol_id::{ProtocolId, check_sharing_range},
    quorum::{GateQuorumMapping, PartyId, Quorum, generate_quorums},
    runtime::{BoxedProtocol, Error, Value},
};

mod circuit;
mod gate;

pub use circuit::{CircuitEvaluationProtocol, MultiQuorumCircuitEvaluation};
pub use gate::{GateEvaluationProtocol, GateStep, MultiQuorumGateEvaluation};

/// Creates the protocols that evaluate a single computation gate within a quorum.
pub trait GateEvaluationFactory<V: Value>: Send + Sync {
    /// A protocol for party `me` of `quorum`, evaluating a gate of type `gate` on the (shares of
    /// the) `inputs`, one per input port. The protocol must use the identifier `id` and output one
    /// value per output port of the gate.
    fn evaluation_protocol(
        &self,
        gate: ComputationGateType,
        me: PartyId,
        quorum: &Quorum,
        inputs: Vec<V>,
        id: ProtocolId,
    ) -> Result<BoxedProtocol<V, Vec<V>>, Error>;
}

/// Creates the protocols that move a value from one quorum to another.
pub trait ResharingFactory<V: Value>: Send + Sync {
    /// A protocol for party `me` moving a value from quorum `from` into input `port` of the gate
    /// with topological rank `gate_rank`, which is evaluated by quorum `to`.
    ///
    /// Members of `from` pass their `value`, parties only in `to` pass `None`. The protocol must
    /// use the identifier [`ProtocolId::gate_input_sharing`]`(gate_rank, port)` and output the new
    /// value for members of `to` and `None` for everyone else.
    fn resharing_protocol(
        &self,
        me: PartyId,
        from: &Quorum,
        to: &Quorum,
        value: Option<V>,
        gate_rank: usize,
        port: usize,
    ) -> Result<BoxedProtocol<V, Option<V>>, Error>;
}

/// The sub-protocol factories used by an evaluation.
pub struct Factories<V: Value> {
    /// Gate evaluation protocols.
    pub evaluation: Arc<dyn GateEvaluationFactory<V>>,
    /// Resharing protocols.
    pub resharing: Arc<dyn ResharingFactory<V>>,
}

impl<V: Value> Factories<V> {
    /// Bundles the two factories.
    pub fn new(
        evaluation: impl GateEvaluationFactory<V> + 'static,
        resharing: impl ResharingFactory<V> + 'static,
    ) -> Self {
        Self {
            evaluation: Arc::new(evaluation),
            resharing: Arc::new(resharing),
        }
    }
}

impl<V: Value> Clone for Factories<V> {
    fn clone(&self) -> Self {
        Self {
            evaluation: Arc::clone(&self.evaluation),
            resharing: Arc::clone(&self.resharing),
        }
    }
}

impl<V: Value> fmt::Debug for Factories<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factories").finish_non_exhaustive()
    }
}

/// The read-only state shared by all orchestrators and coordinators of one party.
#[derive(Debug, Clone)]
pub struct EvaluationContext<V: Value> {
    circuit: Arc<Circuit>,
    mapping: Arc<GateQuorumMapping>,
    inputs: Arc<BTreeMap<InputGateAddress, V>>,
    factories: Factories<V>,
}

/// Everything the parties must agree on before evaluating: the circuit, the quorums, the gate
/// assignment and the orchestrator identifiers.
#[derive(Debug, Clone)]
pub struct EvaluationPlan {
    circuit: Arc<Circuit>,
    mapping: Arc<GateQuorumMapping>,
    orchestrator_ids: Vec<ProtocolId>,
}

impl EvaluationPlan {
    /// Draws quorums from `parties` as configured and assigns the gates round-robin.
    pub fn new(
        circuit: Circuit,
        parties: &[PartyId],
        config: &EvaluationConfig,
    ) -> Result<Self, Error> {
        config.validate(parties.len())?;
        let quorums = generate_quorums(
            parties,
            config.quorum_count,
            config.quorum_size,
            config.seed,
        )?;
        Self::with_quorums(circuit, quorums)
    }

    /// Assigns the gates round-robin to the given quorums.
    pub fn with_quorums(circuit: Circuit, mut quorums: Vec<Quorum>) -> Result<Self, Error> {
        let ports = circuit
            .gates()
            .map(|(_, gate)| gate.input_count())
            .max()
            .unwrap_or(0);
        check_sharing_range(circuit.gate_count(), ports)?;
        let orchestrator_ids = quorums
            .iter_mut()
            .map(Quorum::next_protocol_id)
            .collect::<Result<Vec<_>, _>>()?;
        let mapping = GateQuorumMapping::round_robin(&circuit, quorums)?;
        debug!(
            gates = circuit.gate_count(),
            quorums = mapping.quorums().len(),
            "planned evaluation"
        );
        Ok(Self {
            circuit: Arc::new(circuit),
            mapping: Arc::new(mapping),
            orchestrator_ids,
        })
    }

    /// The circuit to evaluate.
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// The quorums and the gate assignment.
    pub fn mapping(&self) -> &GateQuorumMapping {
        &self.mapping
    }

    /// The identifier of the orchestrator of the quorum at `index`.
    pub fn orchestrator_id(&self, index: usize) -> Option<ProtocolId> {
        self.orchestrator_ids.get(index).copied()
    }

    /// The orchestrators party `me` runs, one for every quorum it belongs to.
    ///
    /// `inputs` holds the (shares of the) circuit inputs known to `me`.
    pub fn protocols_for<V: Value>(
        &self,
        me: PartyId,
        inputs: Arc<BTreeMap<InputGateAddress, V>>,
        factories: &Factories<V>,
    ) -> Vec<CircuitEvaluationProtocol<V>> {
        let shared = EvaluationContext {
            circuit: Arc::clone(&self.circuit),
            mapping: Arc::clone(&self.mapping),
            inputs,
            factories: factories.clone(),
        };
        self.mapping
            .quorums()
            .iter()
            .zip(&self.orchestrator_ids)
            .enumerate()
            .filter(|(_, (quorum, _))| quorum.has_member(me))
            .map(|(index, (_, id))| {
                MultiQuorumCircuitEvaluation::protocol(*id, me, index, shared.clone())
            })
            .collect()
    }
}
