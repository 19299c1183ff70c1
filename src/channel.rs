//! A communication channel used to send/receive messages to/from other parties.

use std::{fmt, future::Future, time::Duration};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel},
    time::timeout,
};
use tracing::trace;

use crate::{
    quorum::PartyId,
    runtime::{Envelope, Value},
};

/// How long a party waits for the next message before giving up.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug, thiserror::Error)]
#[error("{phase}: {reason}")]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    #[error("receive failed: {0}")]
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    #[error("send failed: {0}")]
    SendError(String),
    /// The message could not be (de-)serialized.
    #[error("serialization failed: {0}")]
    SerdeError(String),
    /// The envelope claims to come from a different party than the one that sent it.
    #[error("message from party {actual} claims to be from party {claimed}")]
    UnexpectedSender {
        /// The sender named in the envelope.
        claimed: PartyId,
        /// The party the channel received the message from.
        actual: PartyId,
    },
}

/// A communication channel used to send/receive messages to/from other parties.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given id.
    fn send_bytes_to(
        &mut self,
        party: PartyId,
        msg: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits the next message from any party, returning the sender together with the message.
    fn recv_bytes(
        &mut self,
    ) -> impl Future<Output = Result<(PartyId, Vec<u8>), Self::RecvError>> + Send;

    /// Returns a message that has already arrived, or `None` without waiting if there is none.
    fn try_recv_bytes(&mut self) -> Result<Option<(PartyId, Vec<u8>)>, Self::RecvError>;
}

/// A wrapper around [`Channel`] that takes care of (de-)serializing envelopes.
#[derive(Debug)]
pub struct MsgChannel<C: Channel>(pub C);

impl<C: Channel> MsgChannel<C> {
    /// Serializes and sends an envelope to its recipient.
    pub async fn send_envelope<V: Value>(&mut self, envelope: &Envelope<V>) -> Result<(), Error> {
        let phase = envelope.protocol_id.to_string();
        let msg = bincode::serialize(envelope).map_err(|e| Error {
            phase: format!("sending {phase}"),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })?;
        trace!(to = envelope.to, bytes = msg.len(), %phase, "sending envelope");
        self.0
            .send_bytes_to(envelope.to, msg)
            .await
            .map_err(|e| Error {
                phase,
                reason: ErrorKind::SendError(format!("{e:?}")),
            })
    }

    /// Receives and deserializes the next envelope, checking that its sender is genuine.
    pub async fn recv_envelope<V: Value>(&mut self) -> Result<Envelope<V>, Error> {
        let (sender, msg) = self.0.recv_bytes().await.map_err(recv_error)?;
        open(sender, &msg)
    }

    /// Like [`MsgChannel::recv_envelope`], but only returns an envelope that has already arrived.
    pub fn try_recv_envelope<V: Value>(&mut self) -> Result<Option<Envelope<V>>, Error> {
        match self.0.try_recv_bytes().map_err(recv_error)? {
            Some((sender, msg)) => open(sender, &msg).map(Some),
            None => Ok(None),
        }
    }
}

fn recv_error(e: impl fmt::Debug) -> Error {
    Error {
        phase: "receiving".to_string(),
        reason: ErrorKind::RecvError(format!("{e:?}")),
    }
}

fn open<V: Value>(sender: PartyId, msg: &[u8]) -> Result<Envelope<V>, Error> {
    let envelope: Envelope<V> = bincode::deserialize(msg).map_err(|e| Error {
        phase: format!("receiving from party {sender}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    if envelope.from != sender {
        return Err(Error {
            phase: format!("receiving {}", envelope.protocol_id),
            reason: ErrorKind::UnexpectedSender {
                claimed: envelope.from,
                actual: sender,
            },
        });
    }
    Ok(envelope)
}

/// A simple in-memory channel using unbounded tokio [`mpsc`](tokio::sync::mpsc) queues, one
/// inbox per party.
#[derive(Debug)]
pub struct SimpleChannel {
    me: PartyId,
    s: Vec<UnboundedSender<(PartyId, Vec<u8>)>>,
    r: UnboundedReceiver<(PartyId, Vec<u8>)>,
    recv_timeout: Duration,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let (s, r): (Vec<_>, Vec<_>) = (0..parties).map(|_| unbounded_channel()).unzip();
        r.into_iter()
            .enumerate()
            .map(|(me, r)| SimpleChannel {
                me,
                s: s.clone(),
                r,
                recv_timeout: DEFAULT_RECV_TIMEOUT,
            })
            .collect()
    }

    /// Replaces the receive timeout.
    pub fn with_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }
}

/// The error raised by `send` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum SimpleSendError {
    /// There is no party with this id.
    UnknownParty(PartyId),
    /// The receiving party has dropped its channel.
    Closed(PartyId),
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncRecvError {
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
}

impl Channel for SimpleChannel {
    type SendError = SimpleSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&mut self, p: PartyId, msg: Vec<u8>) -> Result<(), SimpleSendError> {
        self.s
            .get(p)
            .ok_or(SimpleSendError::UnknownParty(p))?
            .send((self.me, msg))
            .map_err(|_| SimpleSendError::Closed(p))
    }

    async fn recv_bytes(&mut self) -> Result<(PartyId, Vec<u8>), AsyncRecvError> {
        match timeout(self.recv_timeout, self.r.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(AsyncRecvError::Closed),
            Err(_) => Err(AsyncRecvError::TimeoutElapsed),
        }
    }

    fn try_recv_bytes(&mut self) -> Result<Option<(PartyId, Vec<u8>)>, AsyncRecvError> {
        match self.r.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(AsyncRecvError::Closed),
        }
    }
}
