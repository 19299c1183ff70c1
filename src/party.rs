//! Drives the root protocols of one party: routing incoming messages, delivering loopbacks and
//! holding back messages that arrive before the instance they are meant for.

use tracing::{Level, debug, instrument, trace, warn};

use crate::{
    channel::{Channel, MsgChannel},
    quorum::PartyId,
    runtime::{Delivery, Envelope, Error, Outbox, Protocol, RoutingError, Value},
};

/// The protocols run by a single party, together with its outgoing and local message queues.
///
/// Messages that no running instance claims yet are parked and retried after every successful
/// delivery, so instances that start later still receive messages sent to them early.
#[derive(Debug)]
pub struct Party<V: Value, P> {
    outbox: Outbox<V>,
    roots: Vec<P>,
    parked: Vec<Envelope<V>>,
    loopbacks: usize,
}

impl<V: Value, P: Protocol<V>> Party<V, P> {
    /// A party `me` running the given root protocols.
    pub fn new(me: PartyId, roots: Vec<P>) -> Self {
        Self {
            outbox: Outbox::new(me),
            roots,
            parked: vec![],
            loopbacks: 0,
        }
    }

    /// The local party.
    pub fn me(&self) -> PartyId {
        self.outbox.me()
    }

    /// Starts every root protocol.
    pub fn start(&mut self) -> Result<(), Error> {
        for root in self.roots.iter_mut() {
            root.start(&mut self.outbox)?;
        }
        self.retry_parked()?;
        self.process_local()
    }

    /// Handles a message received from another party.
    pub fn deliver(&mut self, envelope: Envelope<V>) -> Result<(), Error> {
        if self.route(envelope)? {
            self.retry_parked()?;
        }
        self.process_local()
    }

    /// Messages waiting to be sent to other parties.
    pub fn take_outgoing(&mut self) -> Vec<Envelope<V>> {
        self.outbox.take_outgoing()
    }

    /// Whether every root protocol has completed.
    pub fn is_completed(&self) -> bool {
        self.roots.iter().all(|root| root.is_completed())
    }

    /// The number of messages the party delivered to itself.
    pub fn loopbacks_delivered(&self) -> usize {
        self.loopbacks
    }

    /// The results of the root protocols, in the order they were given.
    ///
    /// Fails if a message is still parked, since it could never be delivered.
    pub fn take_results(&mut self) -> Result<Vec<P::Output>, Error> {
        if !self.parked.is_empty() {
            let ids = self.parked.iter().map(|env| env.protocol_id).collect();
            return Err(RoutingError::Unroutable { ids }.into());
        }
        self.roots
            .iter_mut()
            .map(|root| root.take_result().ok_or(Error::MissingResult(root.id())))
            .collect()
    }

    fn route(&mut self, envelope: Envelope<V>) -> Result<bool, Error> {
        let id = envelope.protocol_id;
        let Some(root) = self.roots.iter_mut().find(|root| root.routes_to(id)) else {
            trace!(protocol_id = %id, from = envelope.from, "parking message");
            self.parked.push(envelope);
            return Ok(false);
        };
        root.handle_message(&mut self.outbox, envelope.from, id, envelope.msg)?;
        Ok(true)
    }

    fn retry_parked(&mut self) -> Result<(), Error> {
        while let Some(pos) = self.parked.iter().position(|env| {
            self.roots
                .iter()
                .any(|root| root.routes_to(env.protocol_id))
        }) {
            let envelope = self.parked.remove(pos);
            self.route(envelope)?;
        }
        Ok(())
    }

    fn process_local(&mut self) -> Result<(), Error> {
        while let Some(envelope) = self.outbox.pop_local() {
            self.loopbacks += 1;
            if self.route(envelope)? {
                self.retry_parked()?;
            }
        }
        Ok(())
    }
}

/// Runs `party` to completion, exchanging messages over `channel`.
///
/// Envelopes that are already queued on the channel once every root has completed are still
/// delivered, so that a stale message fails the party instead of being dropped.
pub async fn run_party<V, P, C>(
    party: &mut Party<V, P>,
    channel: &mut MsgChannel<C>,
) -> Result<Vec<P::Output>, Error>
where
    V: Value,
    P: Protocol<V>,
    C: Channel,
{
    drive_party(party, channel).await?;
    party.take_results()
}

/// Runs `party` until every root has completed, without taking the results.
///
/// Used when the caller can tell that all other parties are done as well and wants to
/// [`drain_queued`] once more before calling [`Party::take_results`].
#[instrument(level = Level::DEBUG, skip_all, fields(me = party.me()), err)]
pub async fn drive_party<V, P, C>(
    party: &mut Party<V, P>,
    channel: &mut MsgChannel<C>,
) -> Result<(), Error>
where
    V: Value,
    P: Protocol<V>,
    C: Channel,
{
    party.start()?;
    loop {
        for envelope in party.take_outgoing() {
            channel.send_envelope(&envelope).await?;
        }
        if party.is_completed() {
            break;
        }
        let envelope = channel.recv_envelope().await?;
        party.deliver(envelope)?;
    }
    let stale = drain_queued(party, channel)?;
    debug!(loopbacks = party.loopbacks_delivered(), stale, "party done");
    Ok(())
}

/// Delivers every envelope that has already arrived on `channel`, returning how many there were.
///
/// Nothing is left to claim them once the party has completed, so they end up reported by
/// [`Party::take_results`].
pub fn drain_queued<V, P, C>(
    party: &mut Party<V, P>,
    channel: &mut MsgChannel<C>,
) -> Result<usize, Error>
where
    V: Value,
    P: Protocol<V>,
    C: Channel,
{
    let mut drained = 0;
    while let Some(envelope) = channel.try_recv_envelope()? {
        warn!(
            protocol_id = %envelope.protocol_id,
            from = envelope.from,
            "message arrived after completion"
        );
        party.deliver(envelope)?;
        drained += 1;
    }
    Ok(drained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::SimpleChannel,
        protocol_id::ProtocolId,
        runtime::{Composed, Context, Event, Logic, Msg},
    };

    /// Completes with the first share it receives.
    struct Echo;

    impl Logic<u8> for Echo {
        type Sub = ();
        type Output = u8;

        fn start(&mut self, _cx: &mut Context<'_, u8, (), u8>) -> Result<(), Error> {
            Ok(())
        }

        fn handle(
            &mut self,
            cx: &mut Context<'_, u8, (), u8>,
            event: Event<u8, ()>,
        ) -> Result<(), Error> {
            if let Event::Message {
                msg: Msg::Share(v), ..
            } = event
            {
                cx.complete(v);
            }
            Ok(())
        }
    }

    fn echo(id: u32) -> Composed<u8, Echo> {
        Composed::new(ProtocolId::generic(id), vec![0], Echo)
    }

    fn envelope(id: u32, value: u8) -> Envelope<u8> {
        Envelope {
            from: 1,
            to: 0,
            protocol_id: ProtocolId::generic(id),
            msg: Msg::Share(value),
        }
    }

    #[test]
    fn early_messages_are_parked() {
        let mut party = Party::new(0, vec![echo(1)]);
        party.deliver(envelope(1, 3)).unwrap();
        assert!(!party.is_completed());
        party.start().unwrap();
        assert_eq!(party.take_results().unwrap(), vec![3]);

        let mut party = Party::new(0, vec![echo(1), echo(2)]);
        party.deliver(envelope(2, 5)).unwrap();
        party.start().unwrap();
        party.deliver(envelope(1, 4)).unwrap();
        assert!(party.is_completed());
        assert_eq!(party.take_results().unwrap(), vec![4, 5]);
    }

    #[test]
    fn undeliverable_messages_fail_the_party() {
        let mut party = Party::new(0, vec![echo(1)]);
        party.start().unwrap();
        party.deliver(envelope(7, 1)).unwrap();
        party.deliver(envelope(1, 2)).unwrap();
        assert!(party.is_completed());
        let err = party.take_results().unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::Unroutable { ids }) if ids == vec![ProtocolId::generic(7)]
        ));
    }

    #[tokio::test]
    async fn messages_queued_after_completion_are_reported() {
        let mut channels = SimpleChannel::channels(2).into_iter().map(MsgChannel);
        let mut mine = channels.next().unwrap();
        let mut other = channels.next().unwrap();
        other.send_envelope(&envelope(1, 6)).await.unwrap();
        other.send_envelope(&envelope(1, 8)).await.unwrap();

        let mut party = Party::new(0, vec![echo(1)]);
        drive_party(&mut party, &mut mine).await.unwrap();
        assert!(party.is_completed());
        assert_eq!(drain_queued(&mut party, &mut mine).unwrap(), 0);
        let err = party.take_results().unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::Unroutable { ids }) if ids == vec![ProtocolId::generic(1)]
        ));

        let mut party = Party::new(0, vec![echo(2)]);
        other.send_envelope(&envelope(2, 1)).await.unwrap();
        assert_eq!(run_party(&mut party, &mut mine).await.unwrap(), vec![1]);
        other.send_envelope(&envelope(2, 1)).await.unwrap();
        assert_eq!(drain_queued(&mut party, &mut mine).unwrap(), 1);
        assert!(party.take_results().is_err());
    }
}
