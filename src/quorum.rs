//! Quorums, seeded quorum generation and the deterministic gate to quorum assignment.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    hash::{Hash, Hasher},
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::{
    Error,
    circuit::{Circuit, GateId},
    protocol_id::ProtocolId,
};

/// Identifies a party.
pub type PartyId = usize;

/// How many times a full set of quorums is drawn before giving up on covering every party.
const MAX_ATTEMPTS: usize = 10_000;

/// Errors during quorum generation and protocol identifier allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuorumError {
    /// No parties were given.
    #[error("cannot build quorums without parties")]
    NoParties,
    /// At least one quorum is needed.
    #[error("at least one quorum of at least one party is required")]
    Empty,
    /// A quorum would need more members than there are parties.
    #[error("quorums of size {size} cannot be drawn from {parties} parties")]
    TooLarge {
        /// Requested quorum size.
        size: usize,
        /// Number of available parties.
        parties: usize,
    },
    /// The quorums cannot cover every party.
    #[error("{count} quorums of size {size} cannot cover {parties} parties")]
    Uncoverable {
        /// Requested number of quorums.
        count: usize,
        /// Requested quorum size.
        size: usize,
        /// Number of parties.
        parties: usize,
    },
    /// No draw covered every party within the attempt limit.
    #[error("no quorum set covering all parties was found after {0} attempts")]
    CoverageFailed(usize),
    /// More quorums were requested than quorum numbers exist.
    #[error("{0} quorums exceed the quorum number range")]
    TooMany(usize),
    /// Two quorums share the same number.
    #[error("quorum number {0} is used more than once")]
    DuplicateNumber(u16),
    /// A quorum ran out of protocol identifiers.
    #[error("quorum {0} has exhausted its protocol identifiers")]
    IdsExhausted(u16),
}

/// A numbered set of parties that jointly evaluates gates.
///
/// Quorums compare and hash by their number only.
#[derive(Debug, Clone)]
pub struct Quorum {
    number: u16,
    members: Vec<PartyId>,
    counter: u32,
    pair_counters: HashMap<u16, u16>,
}

impl Quorum {
    /// Creates a quorum, sorting and deduplicating the members.
    pub fn new(number: u16, members: impl IntoIterator<Item = PartyId>) -> Self {
        let members: BTreeSet<PartyId> = members.into_iter().collect();
        Self {
            number,
            members: members.into_iter().collect(),
            counter: 0,
            pair_counters: HashMap::new(),
        }
    }

    /// The quorum number.
    pub fn number(&self) -> u16 {
        self.number
    }

    /// The members, sorted ascending.
    pub fn members(&self) -> &[PartyId] {
        &self.members
    }

    /// The number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether `party` belongs to the quorum.
    pub fn has_member(&self, party: PartyId) -> bool {
        self.members.binary_search(&party).is_ok()
    }

    /// The index of `party` within the sorted members.
    pub fn position_of(&self, party: PartyId) -> Option<usize> {
        self.members.binary_search(&party).ok()
    }

    /// Allocates the next identifier of a protocol run inside this quorum. Identifiers are
    /// never handed out twice.
    pub fn next_protocol_id(&mut self) -> Result<ProtocolId, QuorumError> {
        let id = ProtocolId::quorum(self.number, self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(QuorumError::IdsExhausted(self.number))?;
        Ok(id)
    }

    /// Allocates the next identifier of a protocol run jointly with `other`, advancing the
    /// pairwise counters of both quorums so either side can allocate the next one.
    ///
    /// For a quorum paired with itself this is [`Quorum::next_protocol_id`].
    pub fn next_two_quorum_protocol_id(
        &mut self,
        other: &mut Quorum,
    ) -> Result<ProtocolId, QuorumError> {
        if other.number == self.number {
            return self.next_protocol_id();
        }
        let counter = self.pair_counters.get(&other.number).copied().unwrap_or(0);
        let next = counter
            .checked_add(1)
            .ok_or(QuorumError::IdsExhausted(self.number))?;
        self.pair_counters.insert(other.number, next);
        other.pair_counters.insert(self.number, next);
        let (a, b) = if self.number < other.number {
            (self.number, other.number)
        } else {
            (other.number, self.number)
        };
        Ok(ProtocolId::two_quorum(a, b, counter))
    }
}

impl PartialEq for Quorum {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for Quorum {}

impl Hash for Quorum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.number.hash(state);
    }
}

/// Draws `count` quorums of `size` distinct parties each, numbered `0..count`.
///
/// Every party draws the same quorums for the same `seed`. The whole set is redrawn until every
/// party is a member of at least one quorum.
pub fn generate_quorums(
    parties: &[PartyId],
    count: usize,
    size: usize,
    seed: u64,
) -> Result<Vec<Quorum>, QuorumError> {
    let parties: Vec<PartyId> = parties
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if parties.is_empty() {
        return Err(QuorumError::NoParties);
    }
    if count == 0 || size == 0 {
        return Err(QuorumError::Empty);
    }
    if count > usize::from(u16::MAX) + 1 {
        return Err(QuorumError::TooMany(count));
    }
    if size > parties.len() {
        return Err(QuorumError::TooLarge {
            size,
            parties: parties.len(),
        });
    }
    if count.saturating_mul(size) < parties.len() {
        return Err(QuorumError::Uncoverable {
            count,
            size,
            parties: parties.len(),
        });
    }

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    for attempt in 1..=MAX_ATTEMPTS {
        let mut covered = vec![false; parties.len()];
        let quorums: Vec<Quorum> = (0..count)
            .map(|number| {
                let mut members = BTreeSet::new();
                while members.len() < size {
                    let position = rng.random_range(0..parties.len());
                    if members.insert(parties[position]) {
                        covered[position] = true;
                    }
                }
                Quorum::new(number as u16, members)
            })
            .collect();
        if covered.iter().all(|c| *c) {
            debug!(attempt, count, size, "generated quorums");
            return Ok(quorums);
        }
    }
    Err(QuorumError::CoverageFailed(MAX_ATTEMPTS))
}

/// The assignment of every gate of a circuit to one quorum.
#[derive(Debug, Clone)]
pub struct GateQuorumMapping {
    quorums: Vec<Quorum>,
    assignment: HashMap<GateId, usize>,
    gates: Vec<Vec<GateId>>,
}

impl GateQuorumMapping {
    /// Assigns the gate at topological position `i` to quorum `i % quorums.len()`.
    pub fn round_robin(circuit: &Circuit, quorums: Vec<Quorum>) -> Result<Self, Error> {
        if quorums.is_empty() {
            return Err(QuorumError::Empty.into());
        }
        let mut numbers = HashSet::new();
        for quorum in &quorums {
            if !numbers.insert(quorum.number) {
                return Err(QuorumError::DuplicateNumber(quorum.number).into());
            }
        }
        let mut assignment = HashMap::with_capacity(circuit.gate_count());
        let mut gates = vec![Vec::new(); quorums.len()];
        for (i, gate) in circuit.topological_order()?.iter().enumerate() {
            let quorum = i % quorums.len();
            assignment.insert(*gate, quorum);
            gates[quorum].push(*gate);
        }
        Ok(Self {
            quorums,
            assignment,
            gates,
        })
    }

    /// All quorums, indexed by their position.
    pub fn quorums(&self) -> &[Quorum] {
        &self.quorums
    }

    /// The quorum at `index`.
    pub fn quorum(&self, index: usize) -> Option<&Quorum> {
        self.quorums.get(index)
    }

    /// The index of the quorum evaluating `gate`.
    pub fn quorum_index_of(&self, gate: GateId) -> Option<usize> {
        self.assignment.get(&gate).copied()
    }

    /// The quorum evaluating `gate`.
    pub fn quorum_of(&self, gate: GateId) -> Option<&Quorum> {
        self.quorums.get(self.quorum_index_of(gate)?)
    }

    /// The gates assigned to the quorum at `index`, in topological order.
    pub fn gates_of(&self, index: usize) -> &[GateId] {
        self.gates.get(index).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::circuit::sorting::bitonic_sort;

    #[test]
    fn generation_is_deterministic() {
        let parties: Vec<_> = (0..10).collect();
        let a = generate_quorums(&parties, 3, 4, 7).unwrap();
        let b = generate_quorums(&parties, 3, 4, 7).unwrap();
        let members = |qs: &[Quorum]| qs.iter().map(|q| q.members().to_vec()).collect::<Vec<_>>();
        assert_eq!(members(&a), members(&b));
        assert_eq!(
            a.iter().map(Quorum::number).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let parties: Vec<_> = (0..6).collect();
        assert_eq!(
            generate_quorums(&parties, 2, 7, 0).unwrap_err(),
            QuorumError::TooLarge {
                size: 7,
                parties: 6
            }
        );
        assert_eq!(
            generate_quorums(&parties, 2, 2, 0).unwrap_err(),
            QuorumError::Uncoverable {
                count: 2,
                size: 2,
                parties: 6
            }
        );
        assert_eq!(
            generate_quorums(&[], 2, 2, 0).unwrap_err(),
            QuorumError::NoParties
        );
        assert_eq!(
            generate_quorums(&parties, 0, 2, 0).unwrap_err(),
            QuorumError::Empty
        );
    }

    #[test]
    fn membership() {
        let q = Quorum::new(4, [9, 2, 5, 2]);
        assert_eq!(q.members(), &[2, 5, 9]);
        assert!(q.has_member(5));
        assert!(!q.has_member(3));
        assert_eq!(q.position_of(9), Some(2));
        assert_eq!(q, Quorum::new(4, [1]));
    }

    #[test]
    fn protocol_ids_are_never_reused() {
        let mut q = Quorum::new(3, [0, 1]);
        let ids: Vec<_> = (0..100).map(|_| q.next_protocol_id().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| id.quorums() == Some((3, None))));
    }

    #[test]
    fn two_quorum_ids_agree_on_both_sides() {
        let mut a = Quorum::new(1, [0, 1]);
        let mut b = Quorum::new(2, [2, 3]);
        let first = a.next_two_quorum_protocol_id(&mut b).unwrap();
        let second = b.next_two_quorum_protocol_id(&mut a).unwrap();
        assert_eq!(first, ProtocolId::two_quorum(1, 2, 0));
        assert_eq!(second, ProtocolId::two_quorum(1, 2, 1));

        let mut same = Quorum::new(1, [0, 1]);
        assert_eq!(
            a.next_two_quorum_protocol_id(&mut same).unwrap(),
            ProtocolId::quorum(1, 0)
        );
    }

    #[test]
    fn round_robin_follows_the_topological_order() {
        let circuit = bitonic_sort(8, false).unwrap().into_circuit();
        let quorums = vec![Quorum::new(0, [0, 1]), Quorum::new(1, [2, 3])];
        let mapping = GateQuorumMapping::round_robin(&circuit, quorums).unwrap();
        let order = circuit.topological_order().unwrap();
        for (i, gate) in order.iter().enumerate() {
            assert_eq!(mapping.quorum_index_of(*gate), Some(i % 2));
            assert_eq!(mapping.quorum_of(*gate).map(Quorum::number), Some((i % 2) as u16));
        }
        assert_eq!(
            mapping.gates_of(0).len() + mapping.gates_of(1).len(),
            order.len()
        );
        assert!(mapping.gates_of(5).is_empty());
    }

    #[test]
    fn quorum_numbers_must_be_unique() {
        let circuit = bitonic_sort(2, false).unwrap().into_circuit();
        let quorums = vec![Quorum::new(1, [0]), Quorum::new(1, [1])];
        assert!(matches!(
            GateQuorumMapping::round_robin(&circuit, quorums),
            Err(Error::Quorum(QuorumError::DuplicateNumber(1)))
        ));
    }

    proptest! {
        #[test]
        fn every_party_is_covered(
            parties in 1usize..20,
            size in any::<usize>(),
            extra in 0usize..3,
            seed in any::<u64>(),
        ) {
            let ids: Vec<_> = (0..parties).collect();
            let size = 1 + size % parties.min(8);
            // twice as many seats as parties, so a covering draw is likely
            let count = (2 * parties).div_ceil(size) + extra;
            let quorums = generate_quorums(&ids, count, size, seed).unwrap();
            prop_assert_eq!(quorums.len(), count);
            for q in &quorums {
                prop_assert_eq!(q.size(), size);
            }
            for p in ids {
                prop_assert!(quorums.iter().any(|q| q.has_member(p)));
            }
        }

        #[test]
        fn every_gate_is_assigned_exactly_once(log in 1u32..5, quorums in 1usize..5) {
            let circuit = bitonic_sort(1 << log, false).unwrap().into_circuit();
            let quorums: Vec<_> = (0..quorums).map(|n| Quorum::new(n as u16, [n])).collect();
            let count = quorums.len();
            let mapping = GateQuorumMapping::round_robin(&circuit, quorums).unwrap();
            let mut seen = std::collections::HashSet::new();
            for q in 0..count {
                if circuit.gate_count() >= count {
                    prop_assert!(!mapping.gates_of(q).is_empty());
                }
                for gate in mapping.gates_of(q) {
                    prop_assert!(seen.insert(*gate));
                    prop_assert_eq!(mapping.quorum_index_of(*gate), Some(q));
                }
            }
            prop_assert_eq!(seen.len(), circuit.gate_count());
        }
    }
}
