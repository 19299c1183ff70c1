//! Wire-oriented construction of circuits.
//!
//! A [`PermutationNetwork`] has a fixed number of wires (positions). Appending a gate on some
//! wires connects the gate's input port `k` to whatever last produced a value on `wires[k]` and
//! makes the gate's output port `k` the new end of that wire. Networks can be appended to each
//! other, which is how the recursive constructions in [`super::sorting`] are built.

use super::{
    Circuit, CircuitError, Collapsed, Gate, GateConnection, InputGateAddress, OutputGateAddress,
};

/// A circuit together with the first input and last output address of each wire.
#[derive(Debug, Clone)]
pub struct PermutationNetwork {
    circuit: Circuit,
    first: Vec<Option<InputGateAddress>>,
    last: Vec<Option<OutputGateAddress>>,
}

impl PermutationNetwork {
    /// Creates an empty network of `wire_count` wires.
    pub fn new(wire_count: usize) -> Self {
        Self {
            circuit: Circuit::new(),
            first: vec![None; wire_count],
            last: vec![None; wire_count],
        }
    }

    /// The number of wires.
    pub fn wire_count(&self) -> usize {
        self.first.len()
    }

    /// The underlying circuit.
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// Consumes the network, returning the underlying circuit.
    pub fn into_circuit(self) -> Circuit {
        self.circuit
    }

    /// The input address at which a value enters `wire`, `None` if no gate touches the wire.
    pub fn first(&self, wire: usize) -> Option<InputGateAddress> {
        self.first.get(wire).copied().flatten()
    }

    /// The output address at which the value of `wire` leaves the network.
    pub fn last(&self, wire: usize) -> Option<OutputGateAddress> {
        self.last.get(wire).copied().flatten()
    }

    /// Appends `gate` so that its port `k` sits on `wires[k]`.
    pub fn append_gate(&mut self, gate: Gate, wires: &[usize]) -> Result<(), CircuitError> {
        if gate.input_count() != wires.len() || gate.output_count() != wires.len() {
            return Err(CircuitError::WireCountMismatch {
                expected: gate.input_count(),
                actual: wires.len(),
            });
        }
        self.check_wires(wires)?;

        let id = self.circuit.next_gate_id();
        let connections: Vec<_> = wires
            .iter()
            .enumerate()
            .filter_map(|(port, &wire)| {
                self.last[wire].map(|from| GateConnection::new(from, id.input(port)))
            })
            .collect();
        self.circuit.add_gate(gate, connections)?;
        for (port, &wire) in wires.iter().enumerate() {
            self.last[wire] = Some(id.output(port));
            self.first[wire].get_or_insert(id.input(port));
        }
        Ok(())
    }

    /// Appends `gate` on the consecutive wires starting at `start`.
    pub fn append_gate_at(&mut self, gate: Gate, start: usize) -> Result<(), CircuitError> {
        let wires: Vec<usize> = (start..start + gate.input_count()).collect();
        self.append_gate(gate, &wires)
    }

    /// Appends `other` so that its wire `i` continues wire `wires[i]` of this network.
    pub fn append_network(
        &mut self,
        other: PermutationNetwork,
        wires: &[usize],
    ) -> Result<(), CircuitError> {
        if other.wire_count() != wires.len() {
            return Err(CircuitError::WireCountMismatch {
                expected: other.wire_count(),
                actual: wires.len(),
            });
        }
        self.check_wires(wires)?;

        let PermutationNetwork {
            circuit,
            first,
            last,
        } = other;
        let joins: Vec<_> = wires
            .iter()
            .zip(&first)
            .filter_map(|(&wire, first)| Some((self.last[wire]?, (*first)?)))
            .collect();
        let remap = self.circuit.join_with(circuit, &joins)?;
        for ((&wire, first), last) in wires.iter().zip(first).zip(last) {
            if let Some(last) = last {
                self.last[wire] = Some(remap.output(last));
            }
            if self.first[wire].is_none() {
                self.first[wire] = first.map(|f| remap.input(f));
            }
        }
        Ok(())
    }

    /// Appends `other` on the consecutive wires starting at `start`.
    pub fn append_network_at(
        &mut self,
        other: PermutationNetwork,
        start: usize,
    ) -> Result<(), CircuitError> {
        let wires: Vec<usize> = (start..start + other.wire_count()).collect();
        self.append_network(other, &wires)
    }

    /// Removes all permutation gates (see [`Circuit::collapse_permutation_gates`]) and moves the
    /// wire boundaries along.
    pub fn collapse_permutation_gates(&mut self) -> Result<Collapsed, CircuitError> {
        let collapsed = self.circuit.collapse_permutation_gates()?;
        for first in self.first.iter_mut().flatten() {
            *first = collapsed.input(*first);
        }
        for last in self.last.iter_mut().flatten() {
            *last = collapsed.output(*last);
        }
        Ok(collapsed)
    }

    fn check_wires(&self, wires: &[usize]) -> Result<(), CircuitError> {
        let mut used = vec![false; self.wire_count()];
        for &wire in wires {
            match used.get_mut(wire) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => return Err(CircuitError::InvalidPermutation(wires.to_vec())),
                None => {
                    return Err(CircuitError::InvalidWire {
                        wire,
                        wires: self.wire_count(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::PermutationGate;

    #[test]
    fn appended_gates_chain_along_wires() {
        let mut net = PermutationNetwork::new(3);
        net.append_gate(Gate::compare_and_swap(), &[0, 2]).unwrap();
        net.append_gate_at(Gate::compare_and_swap(), 1).unwrap();
        let c = net.circuit();
        let order = c.topological_order().unwrap();
        assert_eq!(order.len(), 2);
        let (a, b) = (order[0], order[1]);

        assert_eq!(net.first(0), Some(a.input(0)));
        assert_eq!(net.first(1), Some(b.input(0)));
        assert_eq!(net.first(2), Some(a.input(1)));
        assert_eq!(net.last(0), Some(a.output(0)));
        assert_eq!(net.last(1), Some(b.output(0)));
        assert_eq!(net.last(2), Some(b.output(1)));
        assert_eq!(c.source_of(b.input(1)), Some(a.output(1)));
    }

    #[test]
    fn appended_networks_are_joined_on_their_wires() {
        let mut inner = PermutationNetwork::new(2);
        inner.append_gate_at(Gate::compare_and_swap(), 0).unwrap();

        let mut outer = PermutationNetwork::new(4);
        outer.append_gate(Gate::compare_and_swap(), &[1, 3]).unwrap();
        outer.append_network(inner, &[3, 0]).unwrap();

        let c = outer.circuit();
        assert_eq!(c.gate_count(), 2);
        let order = c.topological_order().unwrap();
        let (a, b) = (order[0], order[1]);
        // wire 3 of the outer network feeds port 0 of the inner gate
        assert_eq!(c.source_of(b.input(0)), Some(a.output(1)));
        assert!(c.is_circuit_input(b.input(1)));
        assert_eq!(outer.first(0), Some(b.input(1)));
        assert_eq!(outer.last(0), Some(b.output(1)));
        assert_eq!(outer.last(3), Some(b.output(0)));
        assert_eq!(outer.first(2), None);
    }

    #[test]
    fn invalid_wires_are_rejected() {
        let mut net = PermutationNetwork::new(2);
        assert_eq!(
            net.append_gate(Gate::compare_and_swap(), &[0, 2]),
            Err(CircuitError::InvalidWire { wire: 2, wires: 2 })
        );
        assert_eq!(
            net.append_gate(Gate::compare_and_swap(), &[1, 1]),
            Err(CircuitError::InvalidPermutation(vec![1, 1]))
        );
        assert_eq!(
            net.append_gate(Gate::compare_and_swap(), &[0]),
            Err(CircuitError::WireCountMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(net.circuit().gate_count(), 0);
    }

    #[test]
    fn collapsing_updates_wire_boundaries() {
        let mut net = PermutationNetwork::new(2);
        net.append_gate_at(Gate::Permutation(PermutationGate::Swap), 0)
            .unwrap();
        net.append_gate_at(Gate::compare_and_swap(), 0).unwrap();
        net.append_gate_at(Gate::Permutation(PermutationGate::Invert(2)), 0)
            .unwrap();
        let collapsed = net.collapse_permutation_gates().unwrap();
        assert_eq!(collapsed.removed, 2);

        let c = net.circuit();
        assert_eq!(c.gate_count(), 1);
        let cas = c.topological_order().unwrap()[0];
        // a swap in front exchanges the entry points, an inversion behind the exit points
        assert_eq!(net.first(0), Some(cas.input(1)));
        assert_eq!(net.first(1), Some(cas.input(0)));
        assert_eq!(net.last(0), Some(cas.output(1)));
        assert_eq!(net.last(1), Some(cas.output(0)));
    }
}
