//! Multi-quorum evaluation of circuits among many parties.
//!
//! Instead of having all parties evaluate every gate, the parties are split into several
//! (possibly overlapping) quorums and every gate of the circuit is evaluated by only one of them.
//! Values flowing between gates of different quorums are moved with a resharing protocol. The
//! crate does not implement any cryptography itself: gate evaluation and resharing are provided
//! through factory traits, see [`evaluation`].
//!
//! ## Main Components
//!
//! * [`circuit`]: Circuits of compare-and-swap and permutation gates, topological ordering,
//!   permutation gate collapsing and sorting network builders.
//! * [`quorum`]: Deterministic quorum generation and the gate to quorum assignment.
//! * [`runtime`]: The protocol abstraction and the composition of protocols out of sub-protocols.
//! * [`evaluation`]: The orchestrators and per-gate coordinators of a multi-quorum evaluation.
//! * [`party`] and [`channel`]: Running the protocols of one party over a message channel.
//! * [`plaintext`]: Insecure reference sub-protocols on clear values.
//! * [`simulation`]: All parties of an evaluation in one process, for tests and benchmarks.
//!
//! ## Example
//!
//! ```
//! use std::collections::BTreeMap;
//!
//! use multiquorum::{
//!     circuit::sorting::bitonic_sort,
//!     config::EvaluationConfig,
//!     evaluation::Factories,
//!     plaintext::{MajorityResharing, PlaintextCompareAndSwap},
//!     simulation::simulate_evaluation,
//! };
//!
//! # fn main() -> Result<(), multiquorum::Error> {
//! let net = bitonic_sort(4, false)?;
//! let inputs: BTreeMap<_, _> = [3u32, 1, 4, 2]
//!     .into_iter()
//!     .enumerate()
//!     .filter_map(|(wire, v)| Some((net.first(wire)?, v)))
//!     .collect();
//! let last: Vec<_> = (0..4).filter_map(|wire| net.last(wire)).collect();
//!
//! let config = EvaluationConfig {
//!     quorum_count: 2,
//!     quorum_size: 3,
//!     seed: 42,
//! };
//! let factories = Factories::new(PlaintextCompareAndSwap, MajorityResharing);
//! let outputs = simulate_evaluation(net.into_circuit(), 5, &config, inputs, &factories)?;
//! let sorted: Vec<_> = last.iter().map(|addr| outputs[addr]).collect();
//! assert_eq!(sorted, vec![1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod circuit;
pub mod config;
pub mod evaluation;
pub mod party;
pub mod plaintext;
pub mod protocol_id;
pub mod quorum;
pub mod runtime;
pub mod simulation;

pub use runtime::Error;
