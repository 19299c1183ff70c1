//! Gate kinds: computation gates evaluated by a quorum and permutation gates that only route wires.

use serde::{Deserialize, Serialize};

use super::CircuitError;

/// The operation computed by a [`Gate::Computation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ComputationGateType {
    /// Outputs the smaller input on port 0 and the larger input on port 1.
    CompareAndSwap,
}

impl ComputationGateType {
    /// The number of input ports of gates of this type.
    pub fn input_count(self) -> usize {
        match self {
            ComputationGateType::CompareAndSwap => 2,
        }
    }

    /// The number of output ports of gates of this type.
    pub fn output_count(self) -> usize {
        match self {
            ComputationGateType::CompareAndSwap => 2,
        }
    }
}

/// A bijection on port indices: the value entering input port `i` leaves on output port
/// `permute(i)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermutationGate {
    /// An explicit permutation table, `table[i]` is the output port of input `i`.
    Table(Vec<usize>),
    /// Exchanges two wires.
    Swap,
    /// A single wire passed through unchanged.
    Nop,
    /// Reverses the order of `n` wires.
    Invert(usize),
    /// Interleaves `groups` consecutive groups of equal size: the inverse of
    /// [`PermutationGate::Unshuffle`].
    Shuffle {
        /// Total number of wires.
        count: usize,
        /// Number of groups, must divide `count`.
        groups: usize,
    },
    /// Deals wires round-robin into `groups` consecutive groups.
    Unshuffle {
        /// Total number of wires.
        count: usize,
        /// Number of groups, must divide `count`.
        groups: usize,
    },
    /// Expects `groups` groups of `group_size` wires followed by `groups` extra wires and moves
    /// the `k`-th extra wire to the front of the `k`-th group.
    MultiGroupInsert {
        /// Wires per group before insertion.
        group_size: usize,
        /// Number of groups.
        groups: usize,
    },
}

impl PermutationGate {
    /// Creates a table permutation, checking that it is a bijection.
    pub fn table(table: Vec<usize>) -> Result<Self, CircuitError> {
        let mut seen = vec![false; table.len()];
        for &target in &table {
            match seen.get_mut(target) {
                Some(slot) if !*slot => *slot = true,
                _ => return Err(CircuitError::InvalidPermutation(table)),
            }
        }
        Ok(PermutationGate::Table(table))
    }

    /// Creates a shuffle permutation, checking that `groups` divides `count`.
    pub fn shuffle(count: usize, groups: usize) -> Result<Self, CircuitError> {
        if groups == 0 || count % groups != 0 {
            return Err(CircuitError::InvalidGrouping { count, groups });
        }
        Ok(PermutationGate::Shuffle { count, groups })
    }

    /// Creates an unshuffle permutation, checking that `groups` divides `count`.
    pub fn unshuffle(count: usize, groups: usize) -> Result<Self, CircuitError> {
        if groups == 0 || count % groups != 0 {
            return Err(CircuitError::InvalidGrouping { count, groups });
        }
        Ok(PermutationGate::Unshuffle { count, groups })
    }

    /// Moves the wires listed in `group` to the top (or bottom) of `count` wires, keeping the
    /// relative order inside both the group and the remaining wires.
    pub fn split(count: usize, group: &[usize], to_top: bool) -> Result<Self, CircuitError> {
        let mut in_group = vec![false; count];
        for &wire in group {
            match in_group.get_mut(wire) {
                Some(slot) if !*slot => *slot = true,
                _ => return Err(CircuitError::InvalidPermutation(group.to_vec())),
            }
        }
        let (mut next_group, mut next_rest) = if to_top {
            (0, group.len())
        } else {
            (count - group.len(), 0)
        };
        let mut table = vec![0; count];
        for (wire, target) in table.iter_mut().enumerate() {
            if in_group[wire] {
                *target = next_group;
                next_group += 1;
            } else {
                *target = next_rest;
                next_rest += 1;
            }
        }
        Ok(PermutationGate::Table(table))
    }

    /// The number of wires this permutation acts on.
    pub fn width(&self) -> usize {
        match self {
            PermutationGate::Table(table) => table.len(),
            PermutationGate::Swap => 2,
            PermutationGate::Nop => 1,
            PermutationGate::Invert(n) => *n,
            PermutationGate::Shuffle { count, .. } | PermutationGate::Unshuffle { count, .. } => {
                *count
            }
            PermutationGate::MultiGroupInsert { group_size, groups } => groups * (group_size + 1),
        }
    }

    /// The output port reached by input port `input`.
    pub fn permute(&self, input: usize) -> usize {
        match self {
            PermutationGate::Table(table) => table[input],
            PermutationGate::Swap => 1 - input,
            PermutationGate::Nop => 0,
            PermutationGate::Invert(n) => n - 1 - input,
            PermutationGate::Shuffle { count, groups } => {
                let per_group = count / groups;
                (input % per_group) * groups + input / per_group
            }
            PermutationGate::Unshuffle { count, groups } => {
                let per_group = count / groups;
                (input % groups) * per_group + input / groups
            }
            PermutationGate::MultiGroupInsert { group_size, groups } => {
                if input < group_size * groups {
                    input + input / group_size + 1
                } else {
                    (input - group_size * groups) * (group_size + 1)
                }
            }
        }
    }

    /// Routes `values` (one per input port) to their output ports.
    pub fn apply<T: Clone>(&self, values: &[T]) -> Vec<T> {
        (0..self.width())
            .map(|output| values[self.inverse(output)].clone())
            .collect()
    }

    /// The input port that reaches output port `output`.
    pub fn inverse(&self, output: usize) -> usize {
        match self {
            PermutationGate::Swap | PermutationGate::Nop | PermutationGate::Invert(_) => {
                self.permute(output)
            }
            PermutationGate::Shuffle { count, groups } => PermutationGate::Unshuffle {
                count: *count,
                groups: *groups,
            }
            .permute(output),
            PermutationGate::Unshuffle { count, groups } => PermutationGate::Shuffle {
                count: *count,
                groups: *groups,
            }
            .permute(output),
            PermutationGate::Table(_) | PermutationGate::MultiGroupInsert { .. } => (0..self
                .width())
                .find(|&input| self.permute(input) == output)
                .unwrap_or(output),
        }
    }
}

/// A node in a [`super::Circuit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gate {
    /// A gate whose outputs require a (cryptographic) evaluation protocol.
    Computation(ComputationGateType),
    /// A gate that only reorders wires and never incurs cryptographic work.
    Permutation(PermutationGate),
}

impl Gate {
    /// A compare-and-swap computation gate.
    pub fn compare_and_swap() -> Self {
        Gate::Computation(ComputationGateType::CompareAndSwap)
    }

    /// A gate exchanging two wires.
    pub fn swap() -> Self {
        Gate::Permutation(PermutationGate::Swap)
    }

    /// The number of input ports.
    pub fn input_count(&self) -> usize {
        match self {
            Gate::Computation(t) => t.input_count(),
            Gate::Permutation(p) => p.width(),
        }
    }

    /// The number of output ports.
    pub fn output_count(&self) -> usize {
        match self {
            Gate::Computation(t) => t.output_count(),
            Gate::Permutation(p) => p.width(),
        }
    }

    /// Whether this is a permutation gate.
    pub fn is_permutation(&self) -> bool {
        matches!(self, Gate::Permutation(_))
    }
}
