//! flowsync Model
//!
//! Entity schema and document snapshots for the replicated flow document.
//!
//! # Core Concepts
//!
//! - [`Entity`]: a node, workspace (tab), subflow or group
//! - [`EntityId`] / [`ReplicaId`]: identifiers for entities and replicas
//! - [`Document`]: serializable snapshot `{ nodes, workspaces, subflows, groups, workspaceOrder }`
//! - [`DocumentDigest`]: Blake3 digest used to compare snapshots
//!
//! # Example
//!
//! ```rust
//! use flowsync_model::{Document, Node, Workspace};
//!
//! let mut doc = Document::new();
//! doc.insert(Workspace::new("ws1", "Flow 1").into());
//! doc.insert(Node::new("n1", "inject").with_name("tick").on("ws1").into());
//!
//! assert_eq!(doc.len(), 2);
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod document;
mod entity;
mod hash;
mod id;

pub use document::Document;
pub use entity::{
    Entity, EntityKind, Fields, Group, ModelError, Node, PositionUpdate, Subflow, Workspace,
    ID_FIELD, TYPE_FIELD,
};
pub use hash::{DigestError, DocumentDigest};
pub use id::{EntityId, ReplicaId};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
