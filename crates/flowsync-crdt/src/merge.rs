//! Merge core trait
//!
//! Provides the [`MergeCore`] trait so the conflict resolution engine behind a
//! [`Replica`](crate::Replica) can be swapped without touching callers.

use crate::change::{Change, Operation};
use crate::clock::{CausalContext, OpId};
use crate::error::MergeError;
use flowsync_model::{Document, Entity, EntityId, EntityKind, ReplicaId};
use serde_json::Value;
use std::collections::BTreeSet;

/// Convergent store of flow entities
///
/// # Safety
/// Implementations must be deterministic: two cores that have applied the
/// same set of changes produce equal snapshots, whatever the delivery order
/// and however many times each change was delivered.
pub trait MergeCore: Send + std::fmt::Debug {
    /// Replica this core authors changes as
    fn actor(&self) -> ReplicaId;

    /// Stamp `ops` as the next local change and apply it
    ///
    /// # Preconditions
    /// Callers validate the operations against the current state; the core
    /// applies whatever it is given.
    ///
    /// # Errors
    /// Returns error if `ops` is empty
    fn apply_local(&mut self, ops: Vec<Operation>) -> Result<Change, MergeError>;

    /// Merge a change authored elsewhere
    ///
    /// # Errors
    /// Returns error if the change is malformed
    fn apply_remote(&mut self, change: Change) -> Result<ApplyOutcome, MergeError>;

    /// Deep copy of the current document
    fn snapshot(&self) -> Document;

    /// Live entity with this id
    fn get(&self, id: &EntityId) -> Option<Entity>;

    /// Kind of the live entity with this id
    fn kind_of(&self, id: &EntityId) -> Option<EntityKind> {
        self.get(id).map(|e| e.kind())
    }

    /// Whether the id was removed at some point
    fn is_tombstoned(&self, id: &EntityId) -> bool;

    /// Whether the id has ever been used, live, removed or hidden
    ///
    /// Ids are unique for the lifetime of the document, so a known id can
    /// never be added again.
    fn is_known(&self, id: &EntityId) -> bool {
        self.get(id).is_some() || self.is_tombstoned(id)
    }

    /// Live entities whose `z` points at `container`
    fn children_of(&self, container: &EntityId) -> Vec<EntityId>;

    /// Changes applied so far
    fn state_vector(&self) -> CausalContext;

    /// Applied changes that `context` does not describe, in causal order
    fn changes_since(&self, context: &CausalContext) -> Vec<Change>;

    /// All concurrent values of one field, lowest stamp first
    ///
    /// A single element means there is no conflict.
    fn conflicts(&self, id: &EntityId, field: &str) -> Vec<Value>;

    /// Number of remote changes waiting for missing dependencies
    fn pending(&self) -> usize;

    /// Core name (for debugging)
    fn name(&self) -> &'static str;
}

/// Result of merging a remote change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change, and any buffered changes it unblocked, were applied
    Applied {
        /// Applied changes, in application order
        changes: Vec<OpId>,
        /// Entities touched by those changes
        touched: BTreeSet<EntityId>,
    },
    /// Waiting for missing dependencies
    Buffered,
    /// Already applied or already buffered
    Duplicate,
}

impl ApplyOutcome {
    /// Whether the document may have changed
    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Number of changes applied
    #[must_use]
    pub fn applied_count(&self) -> usize {
        match self {
            Self::Applied { changes, .. } => changes.len(),
            _ => 0,
        }
    }
}
