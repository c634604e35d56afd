//! flowsync CRDT
//!
//! Causally ordered changes and a convergent merge core for flow documents.
//!
//! # Core Concepts
//!
//! - [`Change`]: atomic batch of [`Operation`]s stamped with an [`OpId`], a
//!   Lamport time and the author's [`CausalContext`]
//! - [`ChangeLog`]: releases changes in causal order, drops duplicates
//! - [`MergeCore`]: pluggable conflict resolution; [`ObservedCore`] is the
//!   default, with per-field [`MvRegister`]s and permanent tombstones
//! - [`Replica`]: validated mutation API over a merge core
//!
//! # Example
//!
//! ```rust
//! use flowsync_crdt::Replica;
//! use flowsync_model::{Node, ReplicaId, Workspace};
//!
//! let mut a = Replica::new(ReplicaId::new());
//! let mut b = Replica::new(ReplicaId::new());
//!
//! a.add_node(Workspace::new("ws1", "Flow 1").into()).unwrap();
//! a.add_node(Node::new("n1", "inject").on("ws1").into()).unwrap();
//!
//! for change in a.changes_since(&b.state_vector()) {
//!     b.apply_remote(change).unwrap();
//! }
//! assert_eq!(a.snapshot(), b.snapshot());
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod change;
mod clock;
mod error;
mod log;
mod merge;
mod observed;
mod register;
mod replica;

pub use change::{Change, ChangeBuilder, Operation};
pub use clock::{CausalContext, OpId, Stamp};
pub use error::MergeError;
pub use log::{ChangeLog, Offer};
pub use merge::{ApplyOutcome, MergeCore};
pub use observed::ObservedCore;
pub use register::MvRegister;
pub use replica::Replica;
