//! Recursive sorting network constructions over compare-and-swap gates.
//!
//! All constructions require a power-of-two number of wires. A compare-and-swap gate appended on
//! wires `[i, j]` leaves the smaller value on `i` and the larger one on `j`.

use super::{CircuitError, Gate, PermutationGate, network::PermutationNetwork};

fn check_width(wire_count: usize) -> Result<(), CircuitError> {
    if wire_count.is_power_of_two() {
        Ok(())
    } else {
        Err(CircuitError::NotPowerOfTwo(wire_count))
    }
}

/// One round of a butterfly tournament: wire `i` is compared with wire `i + n/2`.
pub fn butterfly_tournament_round(wire_count: usize) -> Result<PermutationNetwork, CircuitError> {
    check_width(wire_count)?;
    let half = wire_count / 2;
    let mut net = PermutationNetwork::new(wire_count);
    for i in 0..half {
        net.append_gate(Gate::compare_and_swap(), &[i, i + half])?;
    }
    Ok(net)
}

/// A butterfly tournament: after it, the first wire holds the minimum and the last wire the
/// maximum of all inputs.
pub fn butterfly_tournament(wire_count: usize) -> Result<PermutationNetwork, CircuitError> {
    check_width(wire_count)?;
    let mut net = PermutationNetwork::new(wire_count);
    if wire_count == 1 {
        return Ok(net);
    }
    net.append_network_at(butterfly_tournament_round(wire_count)?, 0)?;
    if wire_count > 2 {
        let half = wire_count / 2;
        net.append_network_at(butterfly_tournament(half)?, 0)?;
        net.append_network_at(butterfly_tournament(half)?, half)?;
    }
    Ok(net)
}

/// Compares wire `i` with wire `i + n/2`, putting the larger value first if `invert` is set.
pub fn bitonic_split(wire_count: usize, invert: bool) -> Result<PermutationNetwork, CircuitError> {
    check_width(wire_count)?;
    let half = wire_count / 2;
    let mut net = PermutationNetwork::new(wire_count);
    for i in 0..half {
        net.append_gate(Gate::compare_and_swap(), &[i, i + half])?;
        if invert {
            net.append_gate(Gate::Permutation(PermutationGate::Swap), &[i, i + half])?;
        }
    }
    Ok(net)
}

/// Sorts a bitonic sequence, ascending or (if `invert` is set) descending.
pub fn bitonic_merge(wire_count: usize, invert: bool) -> Result<PermutationNetwork, CircuitError> {
    check_width(wire_count)?;
    let mut net = PermutationNetwork::new(wire_count);
    net.append_network_at(bitonic_split(wire_count, invert)?, 0)?;
    if wire_count > 2 {
        let half = wire_count / 2;
        net.append_network_at(bitonic_merge(half, invert)?, 0)?;
        net.append_network_at(bitonic_merge(half, invert)?, half)?;
    }
    Ok(net)
}

/// Batcher's bitonic sorter, ascending or (if `invert` is set) descending.
pub fn bitonic_sort(wire_count: usize, invert: bool) -> Result<PermutationNetwork, CircuitError> {
    check_width(wire_count)?;
    let mut net = PermutationNetwork::new(wire_count);
    if wire_count >= 4 {
        let half = wire_count / 2;
        net.append_network_at(bitonic_sort(half, false)?, 0)?;
        net.append_network_at(bitonic_sort(half, true)?, half)?;
    }
    if wire_count >= 2 {
        net.append_network_at(bitonic_merge(wire_count, invert)?, 0)?;
    }
    Ok(net)
}

/// Binary tree insertion of the element on wire 0: it is compared with the middle wire and the
/// construction recurses into both halves.
pub fn binary_tree_insertion(wire_count: usize) -> Result<PermutationNetwork, CircuitError> {
    check_width(wire_count)?;
    let mut net = PermutationNetwork::new(wire_count);
    if wire_count == 1 {
        return Ok(net);
    }
    let half = wire_count / 2;
    net.append_gate(Gate::compare_and_swap(), &[0, half])?;
    if wire_count > 2 {
        net.append_network_at(binary_tree_insertion(half)?, 0)?;
        net.append_network_at(binary_tree_insertion(half)?, half)?;
    }
    Ok(net)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::plaintext::evaluate_circuit;

    fn run(net: &PermutationNetwork, values: &[u32]) -> Vec<u32> {
        let inputs: BTreeMap<_, _> = values
            .iter()
            .enumerate()
            .map(|(wire, v)| (net.first(wire).unwrap(), *v))
            .collect();
        let outputs = evaluate_circuit(net.circuit(), &inputs).unwrap();
        (0..net.wire_count())
            .map(|wire| outputs[&net.last(wire).unwrap()])
            .collect()
    }

    fn computation_gates(net: &PermutationNetwork) -> usize {
        net.circuit()
            .gates()
            .filter(|(_, gate)| !gate.is_permutation())
            .count()
    }

    #[test]
    fn widths_must_be_powers_of_two() {
        assert_eq!(
            bitonic_sort(6, false).unwrap_err(),
            CircuitError::NotPowerOfTwo(6)
        );
        assert_eq!(
            butterfly_tournament(0).unwrap_err(),
            CircuitError::NotPowerOfTwo(0)
        );
        assert!(binary_tree_insertion(1).unwrap().circuit().gate_count() == 0);
    }

    #[test]
    fn gate_counts() {
        // n/2 * log(n) * (log(n) + 1) / 2 compare-and-swap gates
        assert_eq!(computation_gates(&bitonic_sort(8, false).unwrap()), 24);
        assert_eq!(computation_gates(&butterfly_tournament(8).unwrap()), 12);
        assert_eq!(computation_gates(&binary_tree_insertion(8).unwrap()), 7);
        assert_eq!(butterfly_tournament_round(8).unwrap().circuit().gate_count(), 4);
    }

    #[test]
    fn bitonic_sort_descending() {
        let net = bitonic_sort(4, true).unwrap();
        assert_eq!(run(&net, &[3, 9, 1, 4]), vec![9, 4, 3, 1]);
    }

    #[test]
    fn collapsed_sorter_still_sorts() {
        let mut net = bitonic_sort(8, false).unwrap();
        let before = net.circuit().gate_count();
        let collapsed = net.collapse_permutation_gates().unwrap();
        assert!(collapsed.removed > 0);
        assert_eq!(net.circuit().gate_count(), before - collapsed.removed);
        assert!(net.circuit().gates().all(|(_, gate)| !gate.is_permutation()));
        assert_eq!(
            run(&net, &[5, 7, 1, 0, 9, 3, 3, 2]),
            vec![0, 1, 2, 3, 3, 5, 7, 9]
        );
    }

    proptest! {
        #[test]
        fn bitonic_sort_sorts(values in prop::collection::vec(any::<u32>(), 16)) {
            let net = bitonic_sort(16, false).unwrap();
            let mut expected = values.clone();
            expected.sort();
            prop_assert_eq!(run(&net, &values), expected);
        }

        #[test]
        fn butterfly_tournament_finds_extremes(values in prop::collection::vec(any::<u32>(), 8)) {
            let net = butterfly_tournament(8).unwrap();
            let out = run(&net, &values);
            prop_assert_eq!(out[0], *values.iter().min().unwrap());
            prop_assert_eq!(out[7], *values.iter().max().unwrap());
        }
    }
}
