//! The circuit model: gates stored in an arena, addressed by ports, wired by directed connections.
//!
//! Every wire connects exactly one [`OutputGateAddress`] to exactly one [`InputGateAddress`]. Ports
//! that are not connected are the circuit's inputs and outputs: an input address is either a
//! declared circuit input or the target of exactly one connection, never both, and likewise for
//! output addresses.
//!
//! Circuits are built once (possibly by joining smaller circuits), optionally simplified with
//! [`Circuit::collapse_permutation_gates`] and then only read during evaluation. The topological
//! order is computed lazily, cached, and invalidated by every structural mutation.
//!
//! The circuit must be acyclic before it is ordered or evaluated. Wiring a gate to itself (or any
//! other cycle) is accepted while building, but [`Circuit::topological_order`] then fails with
//! [`CircuitError::Cyclic`].
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    sync::OnceLock,
};

use serde::{Deserialize, Serialize};

mod gate;
pub mod network;
pub mod sorting;

pub use gate::{ComputationGateType, Gate, PermutationGate};

/// A handle to a gate in a [`Circuit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateId(usize);

impl GateId {
    /// The raw arena index.
    pub fn index(self) -> usize {
        self.0
    }

    /// The address of input port `port` of this gate.
    pub fn input(self, port: usize) -> InputGateAddress {
        InputGateAddress { gate: self, port }
    }

    /// The address of output port `port` of this gate.
    pub fn output(self, port: usize) -> OutputGateAddress {
        OutputGateAddress { gate: self, port }
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// An input port of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputGateAddress {
    /// The gate the port belongs to.
    pub gate: GateId,
    /// The port index, `0..gate.input_count()`.
    pub port: usize,
}

impl fmt::Display for InputGateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.in{}", self.gate, self.port)
    }
}

/// An output port of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputGateAddress {
    /// The gate the port belongs to.
    pub gate: GateId,
    /// The port index, `0..gate.output_count()`.
    pub port: usize,
}

impl fmt::Display for OutputGateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.out{}", self.gate, self.port)
    }
}

/// A directed wire from an output port to an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateConnection {
    /// The port producing the value.
    pub from: OutputGateAddress,
    /// The port consuming the value.
    pub to: InputGateAddress,
}

impl GateConnection {
    /// Creates a connection `from -> to`.
    pub fn new(from: OutputGateAddress, to: InputGateAddress) -> Self {
        Self { from, to }
    }
}

/// Errors caused by invalid circuit structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    /// The gate is not part of the circuit.
    #[error("gate {0} does not exist in the circuit")]
    UnknownGate(GateId),
    /// The input port is out of range for its gate.
    #[error("invalid input port {0}")]
    InvalidInputPort(InputGateAddress),
    /// The output port is out of range for its gate.
    #[error("invalid output port {0}")]
    InvalidOutputPort(OutputGateAddress),
    /// The circuit is not acyclic, the gate is part of (or depends on) a cycle.
    #[error("the circuit contains a cycle through gate {0}")]
    Cyclic(GateId),
    /// A permutation table is not a bijection.
    #[error("{0:?} is not a permutation")]
    InvalidPermutation(Vec<usize>),
    /// Wires cannot be split into groups of equal size.
    #[error("{count} wires cannot be split into {groups} groups")]
    InvalidGrouping {
        /// Total number of wires.
        count: usize,
        /// Requested number of groups.
        groups: usize,
    },
    /// The network construction requires a power of two wires.
    #[error("{0} wires is not a power of two")]
    NotPowerOfTwo(usize),
    /// A wire index is outside of a permutation network.
    #[error("wire {wire} out of range for a network of {wires} wires")]
    InvalidWire {
        /// The requested wire.
        wire: usize,
        /// The width of the network.
        wires: usize,
    },
    /// A gate or network was appended with the wrong number of wires.
    #[error("expected {expected} wires, got {actual}")]
    WireCountMismatch {
        /// The number of wires required.
        expected: usize,
        /// The number of wires provided.
        actual: usize,
    },
}

#[derive(Debug, Clone)]
struct Ordering {
    order: Vec<GateId>,
    ranks: HashMap<GateId, usize>,
}

/// Translates the handles of a circuit that was moved into another one by [`Circuit::join_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateRemap {
    offset: usize,
}

impl GateRemap {
    /// The new handle of a gate of the joined circuit.
    pub fn gate(&self, gate: GateId) -> GateId {
        GateId(gate.0 + self.offset)
    }

    /// The new address of an input port of the joined circuit.
    pub fn input(&self, addr: InputGateAddress) -> InputGateAddress {
        self.gate(addr.gate).input(addr.port)
    }

    /// The new address of an output port of the joined circuit.
    pub fn output(&self, addr: OutputGateAddress) -> OutputGateAddress {
        self.gate(addr.gate).output(addr.port)
    }
}

/// Circuit boundary addresses moved by [`Circuit::collapse_permutation_gates`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collapsed {
    /// Former circuit input address -> the address that now receives that input.
    pub inputs: BTreeMap<InputGateAddress, InputGateAddress>,
    /// Former circuit output address -> the address that now produces that output.
    pub outputs: BTreeMap<OutputGateAddress, OutputGateAddress>,
    /// Number of permutation gates removed.
    pub removed: usize,
}

impl Collapsed {
    /// The current address of a (possibly moved) circuit input.
    pub fn input(&self, addr: InputGateAddress) -> InputGateAddress {
        self.inputs.get(&addr).copied().unwrap_or(addr)
    }

    /// The current address of a (possibly moved) circuit output.
    pub fn output(&self, addr: OutputGateAddress) -> OutputGateAddress {
        self.outputs.get(&addr).copied().unwrap_or(addr)
    }

    fn move_input(&mut self, from: InputGateAddress, to: InputGateAddress) {
        let mut composed = false;
        for target in self.inputs.values_mut() {
            if *target == from {
                *target = to;
                composed = true;
            }
        }
        if !composed {
            self.inputs.insert(from, to);
        }
    }

    fn move_output(&mut self, from: OutputGateAddress, to: OutputGateAddress) {
        let mut composed = false;
        for target in self.outputs.values_mut() {
            if *target == from {
                *target = to;
                composed = true;
            }
        }
        if !composed {
            self.outputs.insert(from, to);
        }
    }
}

/// A directed graph of gates, see the [module docs](self).
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    gates: BTreeMap<GateId, Gate>,
    next_id: usize,
    input_addrs: BTreeSet<InputGateAddress>,
    output_addrs: BTreeSet<OutputGateAddress>,
    output_to_input: HashMap<OutputGateAddress, InputGateAddress>,
    input_to_output: HashMap<InputGateAddress, OutputGateAddress>,
    order: OnceLock<Result<Ordering, CircuitError>>,
}

impl Circuit {
    /// Creates an empty circuit.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle the next call to [`Circuit::add_gate`] will return, so that connections of the
    /// new gate (including connections to itself) can be built in advance.
    pub fn next_gate_id(&self) -> GateId {
        GateId(self.next_id)
    }

    /// Adds a gate, registers its ports as unconnected, and then applies `connections`.
    ///
    /// All connections are checked before anything is wired: if one of them is invalid, the error
    /// is returned and the circuit is left exactly as it was.
    pub fn add_gate(
        &mut self,
        gate: Gate,
        connections: impl IntoIterator<Item = GateConnection>,
    ) -> Result<GateId, CircuitError> {
        let id = GateId(self.next_id);
        let (input_count, output_count) = (gate.input_count(), gate.output_count());
        let connections: Vec<GateConnection> = connections.into_iter().collect();
        self.gates.insert(id, gate);
        let checked = connections
            .iter()
            .try_for_each(|c| self.check_output(c.from).and(self.check_input(c.to)));
        if let Err(e) = checked {
            self.gates.remove(&id);
            return Err(e);
        }
        self.next_id += 1;
        self.input_addrs
            .extend((0..input_count).map(|port| id.input(port)));
        self.output_addrs
            .extend((0..output_count).map(|port| id.output(port)));
        self.invalidate();

        for connection in connections {
            self.add_connection(connection)?;
        }
        Ok(id)
    }

    /// Connects `connection.from` to `connection.to`.
    ///
    /// Any previous counterparty of either endpoint is detached and becomes an unconnected circuit
    /// input/output again. Adding a connection that already exists changes nothing.
    pub fn add_connection(&mut self, connection: GateConnection) -> Result<(), CircuitError> {
        let GateConnection { from, to } = connection;
        self.check_output(from)?;
        self.check_input(to)?;
        if self.output_to_input.get(&from) == Some(&to) {
            return Ok(());
        }

        if let Some(old_to) = self.output_to_input.remove(&from) {
            self.input_to_output.remove(&old_to);
            self.input_addrs.insert(old_to);
        }
        if let Some(old_from) = self.input_to_output.remove(&to) {
            self.output_to_input.remove(&old_from);
            self.output_addrs.insert(old_from);
        }
        self.output_addrs.remove(&from);
        self.input_addrs.remove(&to);
        self.output_to_input.insert(from, to);
        self.input_to_output.insert(to, from);
        self.invalidate();
        Ok(())
    }

    /// Removes a gate. Its former neighbours keep their ports, now unconnected.
    pub fn remove_gate(&mut self, id: GateId) -> Result<Gate, CircuitError> {
        let gate = self.gates.remove(&id).ok_or(CircuitError::UnknownGate(id))?;
        for port in 0..gate.input_count() {
            let addr = id.input(port);
            self.input_addrs.remove(&addr);
            if let Some(from) = self.input_to_output.remove(&addr) {
                self.output_to_input.remove(&from);
                if from.gate != id {
                    self.output_addrs.insert(from);
                }
            }
        }
        for port in 0..gate.output_count() {
            let addr = id.output(port);
            self.output_addrs.remove(&addr);
            if let Some(to) = self.output_to_input.remove(&addr) {
                self.input_to_output.remove(&to);
                if to.gate != id {
                    self.input_addrs.insert(to);
                }
            }
        }
        self.invalidate();
        Ok(gate)
    }

    /// Moves all gates of `other` into this circuit and wires `joins` (outputs of `self` to inputs
    /// of `other`, in `other`'s addressing).
    ///
    /// The gates of `other` receive fresh handles, so the two gate sets are always disjoint; the
    /// returned [`GateRemap`] translates addresses of `other` into addresses of `self`. The joins
    /// are checked first: on error neither circuit is merged.
    pub fn join_with(
        &mut self,
        other: Circuit,
        joins: &[(OutputGateAddress, InputGateAddress)],
    ) -> Result<GateRemap, CircuitError> {
        for &(from, to) in joins {
            self.check_output(from)?;
            other.check_input(to)?;
        }
        let remap = GateRemap {
            offset: self.next_id,
        };
        debug_assert!(
            other
                .gates
                .keys()
                .all(|g| !self.gates.contains_key(&remap.gate(*g)))
        );
        self.next_id += other.next_id;
        self.gates.extend(
            other
                .gates
                .into_iter()
                .map(|(id, gate)| (remap.gate(id), gate)),
        );
        self.input_addrs
            .extend(other.input_addrs.into_iter().map(|a| remap.input(a)));
        self.output_addrs
            .extend(other.output_addrs.into_iter().map(|a| remap.output(a)));
        for (from, to) in other.output_to_input {
            self.output_to_input
                .insert(remap.output(from), remap.input(to));
            self.input_to_output
                .insert(remap.input(to), remap.output(from));
        }
        self.invalidate();

        for &(from, to) in joins {
            self.add_connection(GateConnection::new(from, remap.input(to)))?;
        }
        Ok(remap)
    }

    /// The gate behind a handle.
    pub fn gate(&self, id: GateId) -> Option<&Gate> {
        self.gates.get(&id)
    }

    /// All gates, in ascending handle order.
    pub fn gates(&self) -> impl Iterator<Item = (GateId, &Gate)> {
        self.gates.iter().map(|(id, gate)| (*id, gate))
    }

    /// The number of gates.
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// The unconnected input addresses, i.e. the declared circuit inputs.
    pub fn input_addrs(&self) -> &BTreeSet<InputGateAddress> {
        &self.input_addrs
    }

    /// The unconnected output addresses, i.e. the declared circuit outputs.
    pub fn output_addrs(&self) -> &BTreeSet<OutputGateAddress> {
        &self.output_addrs
    }

    /// Whether the address is a declared circuit input.
    pub fn is_circuit_input(&self, addr: InputGateAddress) -> bool {
        self.input_addrs.contains(&addr)
    }

    /// Whether the address is a declared circuit output.
    pub fn is_circuit_output(&self, addr: OutputGateAddress) -> bool {
        self.output_addrs.contains(&addr)
    }

    /// The output port wired into `input`, `None` for circuit inputs.
    pub fn source_of(&self, input: InputGateAddress) -> Option<OutputGateAddress> {
        self.input_to_output.get(&input).copied()
    }

    /// The input port fed by `output`, `None` for circuit outputs.
    pub fn consumer_of(&self, output: OutputGateAddress) -> Option<InputGateAddress> {
        self.output_to_input.get(&output).copied()
    }

    /// All connections, sorted by their source address.
    pub fn connections(&self) -> Vec<GateConnection> {
        let mut connections: Vec<_> = self
            .output_to_input
            .iter()
            .map(|(from, to)| GateConnection::new(*from, *to))
            .collect();
        connections.sort();
        connections
    }

    /// The gates in a dependency-respecting order: for every connection `u -> v`, `u` comes
    /// before `v`.
    ///
    /// The order is a Kahn traversal seeded with all gates without connected inputs in ascending
    /// handle order, so every party building the same circuit obtains the same order.
    pub fn topological_order(&self) -> Result<&[GateId], CircuitError> {
        Ok(&self.ordering()?.order)
    }

    /// The position of the gate in [`Circuit::topological_order`], `None` if the gate does not
    /// exist or the circuit is cyclic.
    pub fn rank(&self, id: GateId) -> Option<usize> {
        self.ordering().ok()?.ranks.get(&id).copied()
    }

    fn ordering(&self) -> Result<&Ordering, CircuitError> {
        self.order
            .get_or_init(|| self.compute_order())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn compute_order(&self) -> Result<Ordering, CircuitError> {
        let mut pending: HashMap<GateId, usize> = HashMap::with_capacity(self.gates.len());
        let mut ready = VecDeque::new();
        for (&id, gate) in &self.gates {
            let connected = (0..gate.input_count())
                .filter(|&port| self.input_to_output.contains_key(&id.input(port)))
                .count();
            if connected == 0 {
                ready.push_back(id);
            } else {
                pending.insert(id, connected);
            }
        }

        let mut order = Vec::with_capacity(self.gates.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let outputs = self.gates.get(&id).map_or(0, Gate::output_count);
            for port in 0..outputs {
                let Some(next) = self.output_to_input.get(&id.output(port)) else {
                    continue;
                };
                if let Some(count) = pending.get_mut(&next.gate) {
                    *count -= 1;
                    if *count == 0 {
                        pending.remove(&next.gate);
                        ready.push_back(next.gate);
                    }
                }
            }
        }

        if let Some(stuck) = pending.keys().min() {
            return Err(CircuitError::Cyclic(*stuck));
        }
        let ranks = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Ok(Ordering { order, ranks })
    }

    /// Rewires every permutation gate's neighbours directly to each other and removes the gate, so
    /// that pure routing never incurs cryptographic work.
    ///
    /// Circuit inputs and outputs that were attached to a removed gate move to the neighbouring
    /// gate; the returned [`Collapsed`] records where they went. A permutation gate that routes a
    /// circuit input straight to a circuit output is kept, since the wire needs a gate to exist.
    pub fn collapse_permutation_gates(&mut self) -> Result<Collapsed, CircuitError> {
        let permutations: Vec<(GateId, PermutationGate)> = self
            .gates
            .iter()
            .filter_map(|(id, gate)| match gate {
                Gate::Permutation(p) => Some((*id, p.clone())),
                Gate::Computation(_) => None,
            })
            .collect();

        let mut collapsed = Collapsed::default();
        for (id, permutation) in permutations {
            let wires: Vec<_> = (0..permutation.width())
                .map(|i| {
                    let input = id.input(i);
                    let output = id.output(permutation.permute(i));
                    (
                        input,
                        self.source_of(input),
                        output,
                        self.consumer_of(output),
                    )
                })
                .collect();
            let keep = wires.iter().any(|(_, source, _, dest)| match (source, dest) {
                (None, None) => true,
                (Some(s), _) if s.gate == id => true,
                (_, Some(d)) if d.gate == id => true,
                _ => false,
            });
            if keep {
                continue;
            }

            self.remove_gate(id)?;
            collapsed.removed += 1;
            for (input, source, output, dest) in wires {
                match (source, dest) {
                    (Some(source), Some(dest)) => {
                        self.add_connection(GateConnection::new(source, dest))?
                    }
                    (None, Some(dest)) => collapsed.move_input(input, dest),
                    (Some(source), None) => collapsed.move_output(output, source),
                    (None, None) => unreachable!("pass-through gates are kept"),
                }
            }
        }
        Ok(collapsed)
    }

    fn check_input(&self, addr: InputGateAddress) -> Result<(), CircuitError> {
        let gate = self
            .gates
            .get(&addr.gate)
            .ok_or(CircuitError::UnknownGate(addr.gate))?;
        if addr.port >= gate.input_count() {
            return Err(CircuitError::InvalidInputPort(addr));
        }
        Ok(())
    }

    fn check_output(&self, addr: OutputGateAddress) -> Result<(), CircuitError> {
        let gate = self
            .gates
            .get(&addr.gate)
            .ok_or(CircuitError::UnknownGate(addr.gate))?;
        if addr.port >= gate.output_count() {
            return Err(CircuitError::InvalidOutputPort(addr));
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.order = OnceLock::new();
    }
}
