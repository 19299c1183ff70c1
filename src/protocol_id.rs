//! Flat addressing of protocol instances.
//!
//! Every message carries a [`ProtocolId`], a single `u64` that encodes the role of the protocol
//! instance it is meant for together with the parameters identifying that instance (gate rank,
//! port, quorum numbers). Both sides of a sub-protocol derive the same identifier from data they
//! already agree on, so messages can be routed to the right live instance without any
//! registration or lookup table keyed by object identity.
//!
//! Layout (most significant bits first):
//!
//! | bits    | content                                   |
//! |---------|-------------------------------------------|
//! | 56..64  | role prefix, see [`Role`]                 |
//! | 55      | nested flag, see [`ProtocolId::nested`]   |
//! | 0..55   | role specific fields                      |
//!
//! Role specific fields:
//!
//! - generic: `id` in bits 0..32
//! - quorum: quorum number in bits 32..48, intra-quorum counter in bits 0..32
//! - gate input sharing: gate rank in bits 32..55, port in bits 0..32
//! - gate evaluation: gate rank in bits 0..32
//! - result broadcast: output number in bits 0..32
//! - two-quorum: first quorum in bits 32..48, second quorum in bits 16..32, counter in 0..16

use std::fmt;

use serde::{Deserialize, Serialize};

const ROLE_SHIFT: u32 = 56;
const NESTED_FLAG: u64 = 1 << 55;
const LOW_32: u64 = 0xFFFF_FFFF;
const LOW_16: u64 = 0xFFFF;
const RANK_BITS: u32 = 23;

/// The largest gate rank that fits into a gate input sharing identifier.
pub const MAX_SHARING_RANK: usize = (1 << RANK_BITS) - 1;

/// A gate rank or port that does not fit into its identifier field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdRangeError {
    /// The circuit has more gates than gate ranks can be encoded.
    #[error("gate rank {0} exceeds the largest encodable rank {max}", max = MAX_SHARING_RANK)]
    Rank(usize),
    /// A gate has more input ports than ports can be encoded.
    #[error("gate input port {0} exceeds the encodable port range")]
    Port(usize),
}

/// Checks that gates with ranks below `gates` and input ports below `ports` all receive distinct
/// gate input sharing and gate evaluation identifiers.
pub fn check_sharing_range(gates: usize, ports: usize) -> Result<(), IdRangeError> {
    if gates > MAX_SHARING_RANK + 1 {
        return Err(IdRangeError::Rank(gates - 1));
    }
    if ports as u64 > LOW_32 + 1 {
        return Err(IdRangeError::Port(ports - 1));
    }
    Ok(())
}

/// The role a protocol instance plays, stored in the identifier's prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// A protocol addressed by a plain number agreed on out of band.
    Generic = 0x00,
    /// A protocol run within a single quorum.
    Quorum = 0x01,
    /// The sharing of a value into a gate input port.
    GateInputSharing = 0x02,
    /// The evaluation of a single gate.
    GateEvaluation = 0x03,
    /// The broadcast of a reconstructed circuit output.
    ResultBroadcast = 0x04,
    /// A protocol run jointly by two quorums.
    TwoQuorum = 0x05,
}

impl Role {
    fn from_prefix(prefix: u8) -> Option<Self> {
        match prefix {
            0x00 => Some(Role::Generic),
            0x01 => Some(Role::Quorum),
            0x02 => Some(Role::GateInputSharing),
            0x03 => Some(Role::GateEvaluation),
            0x04 => Some(Role::ResultBroadcast),
            0x05 => Some(Role::TwoQuorum),
            _ => None,
        }
    }

    const fn prefix(self) -> u64 {
        (self as u64) << ROLE_SHIFT
    }
}

/// Identifies a protocol instance across all parties, see the [module docs](self) for the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(u64);

impl ProtocolId {
    /// Wraps a raw identifier (as received from the wire).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw `u64` representation.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// A generic identifier, used for protocols that all parties know by a fixed number.
    pub const fn generic(id: u32) -> Self {
        Self(Role::Generic.prefix() | id as u64)
    }

    /// The `counter`-th protocol run inside the quorum with the given number.
    pub const fn quorum(quorum: u16, counter: u32) -> Self {
        Self(Role::Quorum.prefix() | (quorum as u64) << 32 | counter as u64)
    }

    /// The sharing of a value into input `port` of the gate with topological rank `rank`.
    ///
    /// Out of range values are masked and collide with other identifiers, so callers outside of
    /// an [`EvaluationPlan`](crate::evaluation::EvaluationPlan) should use
    /// [`check_sharing_range`] first.
    pub fn gate_input_sharing(rank: usize, port: usize) -> Self {
        debug_assert!(rank <= MAX_SHARING_RANK, "gate rank {rank} out of range");
        debug_assert!(port as u64 <= LOW_32, "port {port} out of range");
        Self(Role::GateInputSharing.prefix() | (rank as u64) << 32 | (port as u64 & LOW_32))
    }

    /// The coordinator evaluating the gate with topological rank `rank`.
    pub fn gate_eval(rank: usize) -> Self {
        debug_assert!(rank as u64 <= LOW_32, "gate rank {rank} out of range");
        Self(Role::GateEvaluation.prefix() | (rank as u64 & LOW_32))
    }

    /// The broadcast of the `output`-th circuit result.
    pub const fn result_broadcast(output: u32) -> Self {
        Self(Role::ResultBroadcast.prefix() | output as u64)
    }

    /// The `counter`-th protocol run jointly by quorums `a` and `b` (in this order).
    pub const fn two_quorum(a: u16, b: u16, counter: u16) -> Self {
        Self(Role::TwoQuorum.prefix() | (a as u64) << 32 | (b as u64) << 16 | counter as u64)
    }

    /// Derives a second identifier from this one, for a protocol that is started by the
    /// instance owning `self` and needs its own address.
    pub const fn nested(self) -> Self {
        Self(self.0 | NESTED_FLAG)
    }

    /// Whether this identifier was derived through [`ProtocolId::nested`].
    pub const fn is_nested(self) -> bool {
        self.0 & NESTED_FLAG != 0
    }

    /// The role encoded in the prefix, `None` for unknown prefixes.
    pub fn role(self) -> Option<Role> {
        Role::from_prefix((self.0 >> ROLE_SHIFT) as u8)
    }

    /// The gate rank for gate input sharing and gate evaluation identifiers.
    pub fn gate_rank(self) -> Option<usize> {
        let fields = self.0 & !NESTED_FLAG;
        match self.role()? {
            Role::GateInputSharing => Some(((fields >> 32) & ((1 << RANK_BITS) - 1)) as usize),
            Role::GateEvaluation => Some((fields & LOW_32) as usize),
            _ => None,
        }
    }

    /// The port of a gate input sharing identifier.
    pub fn port(self) -> Option<usize> {
        match self.role()? {
            Role::GateInputSharing => Some((self.0 & LOW_32) as usize),
            _ => None,
        }
    }

    /// The quorum number(s) of quorum and two-quorum identifiers.
    pub fn quorums(self) -> Option<(u16, Option<u16>)> {
        match self.role()? {
            Role::Quorum => Some((((self.0 >> 32) & LOW_16) as u16, None)),
            Role::TwoQuorum => Some((
                ((self.0 >> 32) & LOW_16) as u16,
                Some(((self.0 >> 16) & LOW_16) as u16),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nested = if self.is_nested() { "/nested" } else { "" };
        match self.role() {
            Some(Role::Generic) => write!(f, "generic({}){nested}", self.0 & LOW_32),
            Some(Role::Quorum) => write!(
                f,
                "quorum({}#{}){nested}",
                (self.0 >> 32) & LOW_16,
                self.0 & LOW_32
            ),
            Some(Role::GateInputSharing) => write!(
                f,
                "gate-input({}:{}){nested}",
                self.gate_rank().unwrap_or_default(),
                self.0 & LOW_32
            ),
            Some(Role::GateEvaluation) => {
                write!(f, "gate-eval({}){nested}", self.0 & LOW_32)
            }
            Some(Role::ResultBroadcast) => {
                write!(f, "result({}){nested}", self.0 & LOW_32)
            }
            Some(Role::TwoQuorum) => write!(
                f,
                "two-quorum({},{}#{}){nested}",
                (self.0 >> 32) & LOW_16,
                (self.0 >> 16) & LOW_16,
                self.0 & LOW_16
            ),
            None => write!(f, "unknown({:#018x})", self.0),
        }
    }
}
