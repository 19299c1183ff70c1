//! Composition of protocols out of sub-protocols.
//!
//! Every protocol is a message-driven state machine implementing [`Protocol`]. Most protocols
//! are written as a [`Logic`] (the protocol specific behaviour) wrapped into a [`Composed`], which
//! takes care of the lifecycle, of running batches of sub-protocols and of routing messages to the
//! right (possibly deeply nested) instance:
//!
//! - A logic launches sub-protocols through its [`Context`]. All sub-protocols launched during one
//!   step form a batch; at most one batch runs at a time.
//! - Messages are routed to the batch member that claims the message's [`ProtocolId`], or to the
//!   logic itself if the identifier is its own.
//! - Once every member of the batch has completed, the logic receives a single
//!   [`Event::SubProtocolCompleted`] with all results, in launch order. Sub-protocols that
//!   complete synchronously while being started are handled by the same loop, so a chain of
//!   synchronous steps runs to completion within one call.
//!
//! Outgoing messages go through a [`Delivery`] context passed into every call. There is no global
//! network object and no protocol ever holds a reference to its parent.

use std::{collections::VecDeque, fmt, marker::PhantomData, mem};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::trace;

use crate::{
    channel,
    circuit::{CircuitError, GateId, InputGateAddress, OutputGateAddress},
    config::ConfigError,
    protocol_id::{IdRangeError, ProtocolId},
    quorum::{PartyId, QuorumError},
};

/// An error raised by a sub-protocol implementation outside of this crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Values carried on circuit wires and inside messages.
pub trait Value:
    Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Value for T where
    T: Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Messages could not be delivered to a protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// No live instance claims the identifier.
    #[error("no live protocol instance claims {0}")]
    UnknownProtocol(ProtocolId),
    /// The addressed instance has not been started or has already completed.
    #[error("protocol {0} is not running")]
    Inactive(ProtocolId),
    /// Messages were still waiting for their instance when the party finished.
    #[error("{} message(s) could never be routed: {ids:?}", .ids.len())]
    Unroutable {
        /// The identifiers of the undelivered messages.
        ids: Vec<ProtocolId>,
    },
}

/// Errors during circuit evaluation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A message could not be routed.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// The circuit is malformed.
    #[error(transparent)]
    Circuit(#[from] CircuitError),
    /// Quorums could not be built.
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A message could not be sent or received.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// The circuit is too large for the protocol identifiers.
    #[error(transparent)]
    IdRange(#[from] IdRangeError),
    /// A gate has no quorum assigned.
    #[error("gate {0} is not assigned to any quorum")]
    UnassignedGate(GateId),
    /// No value was provided for a circuit input.
    #[error("no value provided for circuit input {0}")]
    MissingCircuitInput(InputGateAddress),
    /// A gate input port did not receive its value.
    #[error("no value received for gate input {0}")]
    MissingGateInput(InputGateAddress),
    /// An evaluation protocol returned the wrong number of outputs.
    #[error("gate {gate} has {expected} outputs, but its evaluation produced {actual}")]
    WrongArity {
        /// The evaluated gate.
        gate: GateId,
        /// The number of output ports of the gate.
        expected: usize,
        /// The number of values produced.
        actual: usize,
    },
    /// A protocol received a message it cannot handle in its current state.
    #[error("protocol {id} received an unexpected message from party {from}")]
    UnexpectedMessage {
        /// The receiving protocol.
        id: ProtocolId,
        /// The sender.
        from: PartyId,
    },
    /// A gate input port received more than one value.
    #[error("gate input {0} received more than one value")]
    DuplicateInput(InputGateAddress),
    /// A protocol was started twice.
    #[error("protocol {0} was already started")]
    AlreadyStarted(ProtocolId),
    /// A protocol launched sub-protocols while a batch was still running.
    #[error("protocol {0} launched sub-protocols while a batch was still running")]
    SubProtocolBusy(ProtocolId),
    /// A completed sub-protocol did not hand out a result.
    #[error("sub-protocol {0} completed without a result")]
    MissingResult(ProtocolId),
    /// No party produced a declared circuit output.
    #[error("circuit output {0} was not produced")]
    MissingOutput(OutputGateAddress),
    /// Parties produced different values for the same circuit output.
    #[error("parties disagree on circuit output {0}")]
    InconsistentOutput(OutputGateAddress),
    /// The async runtime could not be created.
    #[error("could not start the async runtime: {0}")]
    Runtime(#[from] std::io::Error),
    /// A party task panicked or was cancelled.
    #[error("party task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// An external sub-protocol failed.
    #[error(transparent)]
    SubProtocol(BoxError),
}

/// The payload of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg<V> {
    /// A value for an input port of a gate evaluation coordinator.
    GateInput {
        /// The input port.
        port: usize,
        /// The value (share) for the port.
        value: V,
    },
    /// A single share.
    Share(V),
    /// Several shares.
    Shares(Vec<V>),
    /// Raw bytes, for sub-protocols with their own encoding.
    Bytes(Vec<u8>),
}

/// A message together with its routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<V> {
    /// The sending party.
    pub from: PartyId,
    /// The receiving party.
    pub to: PartyId,
    /// The protocol instance the message is meant for.
    pub protocol_id: ProtocolId,
    /// The payload.
    pub msg: Msg<V>,
}

/// The capability to send messages, handed to protocols on every call.
pub trait Delivery<V: Value> {
    /// The local party.
    fn me(&self) -> PartyId;

    /// Sends `msg` to the instance `protocol_id` at party `to`.
    fn send(&mut self, to: PartyId, protocol_id: ProtocolId, msg: Msg<V>);

    /// Sends `msg` to the instance `protocol_id` at every party in `to`.
    fn multicast(&mut self, protocol_id: ProtocolId, to: &[PartyId], msg: Msg<V>) {
        for party in to {
            self.send(*party, protocol_id, msg.clone());
        }
    }

    /// Delivers `msg` to the instance `protocol_id` at the local party, after the current call
    /// has returned.
    fn loopback(&mut self, protocol_id: ProtocolId, msg: Msg<V>);
}

/// Collects outgoing messages; messages to the local party are queued locally instead.
#[derive(Debug)]
pub struct Outbox<V> {
    me: PartyId,
    outgoing: Vec<Envelope<V>>,
    local: VecDeque<Envelope<V>>,
}

impl<V: Value> Outbox<V> {
    /// Creates an empty outbox for party `me`.
    pub fn new(me: PartyId) -> Self {
        Self {
            me,
            outgoing: vec![],
            local: VecDeque::new(),
        }
    }

    /// Removes and returns all messages for other parties.
    pub fn take_outgoing(&mut self) -> Vec<Envelope<V>> {
        mem::take(&mut self.outgoing)
    }

    /// Removes the oldest message for the local party.
    pub fn pop_local(&mut self) -> Option<Envelope<V>> {
        self.local.pop_front()
    }
}

impl<V: Value> Delivery<V> for Outbox<V> {
    fn me(&self) -> PartyId {
        self.me
    }

    fn send(&mut self, to: PartyId, protocol_id: ProtocolId, msg: Msg<V>) {
        let envelope = Envelope {
            from: self.me,
            to,
            protocol_id,
            msg,
        };
        if to == self.me {
            self.local.push_back(envelope);
        } else {
            trace!(from = self.me, to, %protocol_id, "queueing message");
            self.outgoing.push(envelope);
        }
    }

    fn loopback(&mut self, protocol_id: ProtocolId, msg: Msg<V>) {
        let me = self.me;
        self.send(me, protocol_id, msg);
    }
}

/// A message-driven protocol instance.
pub trait Protocol<V: Value>: Send {
    /// The result of the protocol.
    type Output;

    /// The identifier all parties use for this instance.
    fn id(&self) -> ProtocolId;

    /// Starts the protocol. Must be called exactly once.
    fn start(&mut self, net: &mut dyn Delivery<V>) -> Result<(), Error>;

    /// Handles a message for `protocol_id`, which is either this instance or one it claims
    /// through [`Protocol::routes_to`].
    fn handle_message(
        &mut self,
        net: &mut dyn Delivery<V>,
        from: PartyId,
        protocol_id: ProtocolId,
        msg: Msg<V>,
    ) -> Result<(), Error>;

    /// Whether the protocol has produced its result.
    fn is_completed(&self) -> bool;

    /// Takes the result out of a completed protocol.
    fn take_result(&mut self) -> Option<Self::Output>;

    /// Whether messages for `protocol_id` should currently be handed to this instance.
    fn routes_to(&self, protocol_id: ProtocolId) -> bool;
}

/// A type-erased protocol producing `S`.
pub type BoxedProtocol<V, S> = Box<dyn Protocol<V, Output = S>>;

impl<V: Value, P: Protocol<V> + ?Sized> Protocol<V> for Box<P> {
    type Output = P::Output;

    fn id(&self) -> ProtocolId {
        (**self).id()
    }

    fn start(&mut self, net: &mut dyn Delivery<V>) -> Result<(), Error> {
        (**self).start(net)
    }

    fn handle_message(
        &mut self,
        net: &mut dyn Delivery<V>,
        from: PartyId,
        protocol_id: ProtocolId,
        msg: Msg<V>,
    ) -> Result<(), Error> {
        (**self).handle_message(net, from, protocol_id, msg)
    }

    fn is_completed(&self) -> bool {
        (**self).is_completed()
    }

    fn take_result(&mut self) -> Option<Self::Output> {
        (**self).take_result()
    }

    fn routes_to(&self, protocol_id: ProtocolId) -> bool {
        (**self).routes_to(protocol_id)
    }
}

/// Adapters available on every protocol.
pub trait ProtocolExt<V: Value>: Protocol<V> + Sized {
    /// Converts the output of the protocol with `f`.
    fn map<F, S>(self, f: F) -> Mapped<Self, F, V>
    where
        F: FnOnce(Self::Output) -> S + Send,
    {
        Mapped {
            inner: self,
            f: Some(f),
            _value: PhantomData,
        }
    }

    /// Erases the protocol's type.
    fn boxed(self) -> BoxedProtocol<V, Self::Output>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<V: Value, P: Protocol<V>> ProtocolExt<V> for P {}

/// A protocol with a converted output, see [`ProtocolExt::map`].
pub struct Mapped<P, F, V> {
    inner: P,
    f: Option<F>,
    _value: PhantomData<fn() -> V>,
}

impl<V, P, F, S> Protocol<V> for Mapped<P, F, V>
where
    V: Value,
    P: Protocol<V>,
    F: FnOnce(P::Output) -> S + Send,
{
    type Output = S;

    fn id(&self) -> ProtocolId {
        self.inner.id()
    }

    fn start(&mut self, net: &mut dyn Delivery<V>) -> Result<(), Error> {
        self.inner.start(net)
    }

    fn handle_message(
        &mut self,
        net: &mut dyn Delivery<V>,
        from: PartyId,
        protocol_id: ProtocolId,
        msg: Msg<V>,
    ) -> Result<(), Error> {
        self.inner.handle_message(net, from, protocol_id, msg)
    }

    fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    fn take_result(&mut self) -> Option<S> {
        let output = self.inner.take_result()?;
        self.f.take().map(|f| f(output))
    }

    fn routes_to(&self, protocol_id: ProtocolId) -> bool {
        self.inner.routes_to(protocol_id)
    }
}

/// A protocol that completes with a fixed value as soon as it is started.
#[derive(Debug)]
pub struct Immediate<S> {
    id: ProtocolId,
    started: bool,
    value: Option<S>,
}

impl<S> Immediate<S> {
    /// Creates a protocol completing with `value`.
    pub fn new(id: ProtocolId, value: S) -> Self {
        Self {
            id,
            started: false,
            value: Some(value),
        }
    }
}

impl<V: Value, S: Send> Protocol<V> for Immediate<S> {
    type Output = S;

    fn id(&self) -> ProtocolId {
        self.id
    }

    fn start(&mut self, _net: &mut dyn Delivery<V>) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted(self.id));
        }
        self.started = true;
        Ok(())
    }

    fn handle_message(
        &mut self,
        _net: &mut dyn Delivery<V>,
        _from: PartyId,
        _protocol_id: ProtocolId,
        _msg: Msg<V>,
    ) -> Result<(), Error> {
        Err(RoutingError::Inactive(self.id).into())
    }

    fn is_completed(&self) -> bool {
        self.started
    }

    fn take_result(&mut self) -> Option<S> {
        if self.started { self.value.take() } else { None }
    }

    fn routes_to(&self, _protocol_id: ProtocolId) -> bool {
        false
    }
}

/// The result of one member of a completed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SubResult<S> {
    /// The tag given at launch.
    pub tag: u64,
    /// The identifier of the sub-protocol.
    pub id: ProtocolId,
    /// Its output.
    pub result: S,
}

/// Something a [`Logic`] has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<V, S> {
    /// A message addressed to the protocol itself.
    Message {
        /// The sender.
        from: PartyId,
        /// The payload.
        msg: Msg<V>,
    },
    /// Every member of the running batch has completed; results are in launch order.
    SubProtocolCompleted(Vec<SubResult<S>>),
}

/// The behaviour of a protocol built with [`Composed`].
pub trait Logic<V: Value>: Send + Sized {
    /// The output type of the sub-protocols this logic launches.
    type Sub: Send + 'static;
    /// The result of the protocol.
    type Output: Send;

    /// Called once when the protocol starts.
    fn start(&mut self, cx: &mut Context<'_, V, Self::Sub, Self::Output>) -> Result<(), Error>;

    /// Called for every message addressed to this protocol and every completed batch.
    fn handle(
        &mut self,
        cx: &mut Context<'_, V, Self::Sub, Self::Output>,
        event: Event<V, Self::Sub>,
    ) -> Result<(), Error>;
}

/// What a [`Logic`] may do while handling a step.
pub struct Context<'a, V: Value, S, O> {
    net: &'a mut dyn Delivery<V>,
    id: ProtocolId,
    participants: &'a [PartyId],
    busy: bool,
    launched: &'a mut Vec<(u64, BoxedProtocol<V, S>)>,
    output: &'a mut Option<O>,
}

impl<V: Value, S, O> Context<'_, V, S, O> {
    /// The local party.
    pub fn me(&self) -> PartyId {
        self.net.me()
    }

    /// The identifier of the protocol.
    pub fn id(&self) -> ProtocolId {
        self.id
    }

    /// The parties taking part in the protocol.
    pub fn participants(&self) -> &[PartyId] {
        self.participants
    }

    /// Sends `msg` to this protocol's instance at party `to`.
    pub fn send(&mut self, to: PartyId, msg: Msg<V>) {
        let id = self.id;
        self.net.send(to, id, msg);
    }

    /// Sends `msg` to this protocol's instance at every party in `to`.
    pub fn multicast(&mut self, to: &[PartyId], msg: Msg<V>) {
        let id = self.id;
        self.net.multicast(id, to, msg);
    }

    /// Delivers `msg` to the instance `protocol_id` at the local party.
    pub fn loopback(&mut self, protocol_id: ProtocolId, msg: Msg<V>) {
        self.net.loopback(protocol_id, msg);
    }

    /// Launches a sub-protocol; its result is reported with `tag`.
    pub fn execute(
        &mut self,
        tag: u64,
        sub: impl Protocol<V, Output = S> + 'static,
    ) -> Result<(), Error> {
        if self.busy {
            return Err(Error::SubProtocolBusy(self.id));
        }
        self.launched.push((tag, Box::new(sub)));
        Ok(())
    }

    /// Launches several sub-protocols as one batch.
    pub fn execute_all<P>(&mut self, subs: impl IntoIterator<Item = (u64, P)>) -> Result<(), Error>
    where
        P: Protocol<V, Output = S> + 'static,
    {
        for (tag, sub) in subs {
            self.execute(tag, sub)?;
        }
        Ok(())
    }

    /// Completes the protocol with `output`.
    pub fn complete(&mut self, output: O) {
        *self.output = Some(output);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Completed,
}

/// A [`Logic`] turned into a [`Protocol`], see the [module docs](self).
pub struct Composed<V: Value, L: Logic<V>> {
    id: ProtocolId,
    participants: Vec<PartyId>,
    logic: L,
    lifecycle: Lifecycle,
    batch: Vec<(u64, BoxedProtocol<V, L::Sub>)>,
    output: Option<L::Output>,
}

impl<V: Value, L: Logic<V>> Composed<V, L> {
    /// Wraps `logic` into a protocol with identifier `id`.
    pub fn new(id: ProtocolId, participants: Vec<PartyId>, logic: L) -> Self {
        Self {
            id,
            participants,
            logic,
            lifecycle: Lifecycle::NotStarted,
            batch: vec![],
            output: None,
        }
    }

    /// The wrapped logic.
    pub fn logic(&self) -> &L {
        &self.logic
    }

    fn step(
        &mut self,
        net: &mut dyn Delivery<V>,
        f: impl FnOnce(&mut L, &mut Context<'_, V, L::Sub, L::Output>) -> Result<(), Error>,
    ) -> Result<Vec<(u64, BoxedProtocol<V, L::Sub>)>, Error> {
        let mut launched = vec![];
        let mut cx = Context {
            net,
            id: self.id,
            participants: &self.participants,
            busy: !self.batch.is_empty(),
            launched: &mut launched,
            output: &mut self.output,
        };
        f(&mut self.logic, &mut cx)?;
        Ok(launched)
    }

    /// Starts newly launched batches and turns completed batches into events until nothing
    /// completes synchronously anymore.
    fn drive(
        &mut self,
        net: &mut dyn Delivery<V>,
        mut launched: Vec<(u64, BoxedProtocol<V, L::Sub>)>,
    ) -> Result<(), Error> {
        loop {
            if !launched.is_empty() {
                self.batch = launched;
                for (_, sub) in self.batch.iter_mut() {
                    trace!(parent = %self.id, sub = %sub.id(), "starting sub-protocol");
                    sub.start(net)?;
                }
            }
            if self.batch.is_empty() || !self.batch.iter().all(|(_, sub)| sub.is_completed()) {
                break;
            }
            let mut results = Vec::with_capacity(self.batch.len());
            for (tag, mut sub) in mem::take(&mut self.batch) {
                let id = sub.id();
                let result = sub.take_result().ok_or(Error::MissingResult(id))?;
                results.push(SubResult { tag, id, result });
            }
            launched = self.step(net, |logic, cx| {
                logic.handle(cx, Event::SubProtocolCompleted(results))
            })?;
        }
        if self.output.is_some() {
            self.lifecycle = Lifecycle::Completed;
        }
        Ok(())
    }
}

impl<V: Value, L: Logic<V>> Protocol<V> for Composed<V, L> {
    type Output = L::Output;

    fn id(&self) -> ProtocolId {
        self.id
    }

    fn start(&mut self, net: &mut dyn Delivery<V>) -> Result<(), Error> {
        if self.lifecycle != Lifecycle::NotStarted {
            return Err(Error::AlreadyStarted(self.id));
        }
        self.lifecycle = Lifecycle::Running;
        let launched = self.step(net, |logic, cx| logic.start(cx))?;
        self.drive(net, launched)
    }

    fn handle_message(
        &mut self,
        net: &mut dyn Delivery<V>,
        from: PartyId,
        protocol_id: ProtocolId,
        msg: Msg<V>,
    ) -> Result<(), Error> {
        if self.lifecycle != Lifecycle::Running {
            return Err(RoutingError::Inactive(protocol_id).into());
        }
        let launched = if let Some((_, sub)) = self
            .batch
            .iter_mut()
            .find(|(_, sub)| sub.routes_to(protocol_id))
        {
            sub.handle_message(net, from, protocol_id, msg)?;
            vec![]
        } else if protocol_id == self.id {
            self.step(net, |logic, cx| logic.handle(cx, Event::Message { from, msg }))?
        } else {
            return Err(RoutingError::UnknownProtocol(protocol_id).into());
        };
        self.drive(net, launched)
    }

    fn is_completed(&self) -> bool {
        self.lifecycle == Lifecycle::Completed
    }

    fn take_result(&mut self) -> Option<L::Output> {
        self.output.take()
    }

    fn routes_to(&self, protocol_id: ProtocolId) -> bool {
        self.lifecycle == Lifecycle::Running
            && (protocol_id == self.id
                || self.batch.iter().any(|(_, sub)| sub.routes_to(protocol_id)))
    }
}
