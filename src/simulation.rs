//! Runs all parties of an evaluation within one process, connected by in-memory channels.

use std::{collections::BTreeMap, sync::Arc};

use futures::future::try_join_all;
use tokio::{runtime::Builder, task};
use tracing::debug;

use crate::{
    channel::{MsgChannel, SimpleChannel},
    circuit::{Circuit, InputGateAddress, OutputGateAddress},
    config::EvaluationConfig,
    evaluation::{EvaluationPlan, Factories},
    party::{Party, drain_queued, drive_party},
    quorum::PartyId,
    runtime::{Error, Value},
};

/// Evaluates `circuit` with `parties` simulated parties and returns the circuit outputs.
///
/// Every party knows all of `inputs`. The outputs reported by the parties are merged and must
/// agree with each other.
pub fn simulate_evaluation<V: Value>(
    circuit: Circuit,
    parties: usize,
    config: &EvaluationConfig,
    inputs: BTreeMap<InputGateAddress, V>,
    factories: &Factories<V>,
) -> Result<BTreeMap<OutputGateAddress, V>, Error> {
    let party_ids: Vec<PartyId> = (0..parties).collect();
    let plan = EvaluationPlan::new(circuit, &party_ids, config)?;
    let tokio = Builder::new_current_thread().enable_time().build()?;
    tokio.block_on(simulate_plan(&plan, parties, inputs, factories))
}

/// Evaluates an already agreed upon plan with `parties` simulated parties, each running as its
/// own task.
pub async fn simulate_plan<V: Value>(
    plan: &EvaluationPlan,
    parties: usize,
    inputs: BTreeMap<InputGateAddress, V>,
    factories: &Factories<V>,
) -> Result<BTreeMap<OutputGateAddress, V>, Error> {
    let inputs = Arc::new(inputs);
    let handles: Vec<_> = SimpleChannel::channels(parties)
        .into_iter()
        .enumerate()
        .map(|(me, channel)| {
            let roots = plan.protocols_for(me, Arc::clone(&inputs), factories);
            let mut party = Party::new(me, roots);
            task::spawn(async move {
                let mut channel = MsgChannel(channel);
                drive_party(&mut party, &mut channel).await?;
                // the channel is kept alive until every party is done
                Ok::<_, Error>((party, channel))
            })
        })
        .collect();
    let finished = try_join_all(handles.into_iter().map(|handle| async move { handle.await? }))
        .await?;

    let mut outputs = BTreeMap::new();
    for (mut party, mut channel) in finished {
        // nobody sends anymore, so whatever is still queued was never consumed
        drain_queued(&mut party, &mut channel)?;
        for (addr, value) in party.take_results()?.into_iter().flatten() {
            match outputs.get(&addr) {
                Some(existing) if *existing != value => {
                    return Err(Error::InconsistentOutput(addr));
                }
                Some(_) => {}
                None => {
                    outputs.insert(addr, value);
                }
            }
        }
    }
    if let Some(&missing) = plan
        .circuit()
        .output_addrs()
        .iter()
        .find(|addr| !outputs.contains_key(*addr))
    {
        return Err(Error::MissingOutput(missing));
    }
    debug!(parties, outputs = outputs.len(), "simulation done");
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit::{Gate, GateConnection, sorting::bitonic_sort},
        evaluation::ResharingFactory,
        plaintext::{IdentityEvaluation, MajorityResharing, PlaintextCompareAndSwap},
        protocol_id::ProtocolId,
        quorum::Quorum,
        runtime::{BoxedProtocol, Composed, Context, Event, Logic, Msg, RoutingError},
    };

    /// A resharing whose destinations take the first share they see and ignore the rest.
    struct FirstShare;

    struct Eager<V> {
        sources: Vec<PartyId>,
        targets: Vec<PartyId>,
        value: Option<V>,
    }

    impl<V: Value> Logic<V> for Eager<V> {
        type Sub = ();
        type Output = Option<V>;

        fn start(&mut self, cx: &mut Context<'_, V, (), Option<V>>) -> Result<(), Error> {
            let me = cx.me();
            if let Some(value) = self.value.take().filter(|_| self.sources.contains(&me)) {
                cx.multicast(&self.targets, Msg::Share(value));
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
            if let Event::Message {
                msg: Msg::Share(value),
                ..
            } = event
            {
                cx.complete(Some(value));
            }
            Ok(())
        }
    }

    impl<V: Value> ResharingFactory<V> for FirstShare {
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
            let logic = Eager {
                sources: from.members().to_vec(),
                targets: to.members().to_vec(),
                value,
            };
            Ok(Box::new(Composed::new(
                ProtocolId::gate_input_sharing(gate_rank, port),
                participants,
                logic,
            )))
        }
    }

    #[tokio::test]
    async fn surplus_shares_fail_the_simulation() {
        let mut circuit = Circuit::new();
        let a = circuit.add_gate(Gate::compare_and_swap(), []).unwrap();
        let b = circuit.next_gate_id();
        circuit
            .add_gate(
                Gate::compare_and_swap(),
                [
                    GateConnection::new(a.output(0), b.input(0)),
                    GateConnection::new(a.output(1), b.input(1)),
                ],
            )
            .unwrap();
        let quorums = vec![Quorum::new(0, [0, 1, 2]), Quorum::new(1, [3, 4, 5])];
        let plan = EvaluationPlan::with_quorums(circuit, quorums).unwrap();
        let inputs = BTreeMap::from([(a.input(0), 1u32), (a.input(1), 2)]);

        let factories = Factories::new(IdentityEvaluation, MajorityResharing);
        let outputs = simulate_plan(&plan, 6, inputs.clone(), &factories)
            .await
            .unwrap();
        assert_eq!(outputs, BTreeMap::from([(b.output(0), 1), (b.output(1), 2)]));

        let factories = Factories::new(IdentityEvaluation, FirstShare);
        let err = simulate_plan(&plan, 6, inputs, &factories)
            .await
            .unwrap_err();
        let sharings = [
            ProtocolId::gate_input_sharing(1, 0),
            ProtocolId::gate_input_sharing(1, 1),
        ];
        assert!(
            matches!(
                &err,
                Error::Routing(RoutingError::Unroutable { ids })
                    if !ids.is_empty() && ids.iter().all(|id| sharings.contains(id))
            ),
            "{err:?}"
        );
    }

    #[test]
    fn empty_circuits_have_no_outputs() {
        let factories = Factories::new(PlaintextCompareAndSwap, MajorityResharing);
        let outputs = simulate_evaluation::<u32>(
            Circuit::new(),
            4,
            &EvaluationConfig {
                quorum_count: 2,
                quorum_size: 2,
                seed: 3,
            },
            BTreeMap::new(),
            &factories,
        )
        .unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn missing_inputs_fail_the_evaluation() {
        let mut circuit = Circuit::new();
        let g = circuit.add_gate(Gate::compare_and_swap(), []).unwrap();
        let factories = Factories::new(IdentityEvaluation, MajorityResharing);
        let err = simulate_evaluation(
            circuit,
            3,
            &EvaluationConfig {
                quorum_count: 1,
                quorum_size: 3,
                seed: 0,
            },
            BTreeMap::from([(g.input(0), "a".to_string())]),
            &factories,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingCircuitInput(addr) if addr == g.input(1)));
    }

    #[test]
    fn sorting_network_on_three_quorums() {
        let net = bitonic_sort(4, false).unwrap();
        let inputs: BTreeMap<_, _> = [13u64, 2, 8, 5]
            .into_iter()
            .enumerate()
            .map(|(wire, v)| (net.first(wire).unwrap(), v))
            .collect();
        let last: Vec<_> = (0..4).map(|wire| net.last(wire).unwrap()).collect();
        let factories = Factories::new(PlaintextCompareAndSwap, MajorityResharing);
        let config = EvaluationConfig {
            quorum_count: 3,
            quorum_size: 3,
            seed: 11,
        };
        let outputs =
            simulate_evaluation(net.into_circuit(), 7, &config, inputs, &factories).unwrap();
        let sorted: Vec<_> = last.iter().map(|addr| outputs[addr]).collect();
        assert_eq!(sorted, vec![2, 5, 8, 13]);
    }
}
