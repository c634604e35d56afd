//! Changes and operations
//!
//! A [`Change`] is one atomic batch of [`Operation`]s authored by one replica.
//! It carries everything a remote replica needs to merge it without
//! coordination: its identity, a Lamport time and the author's causal context
//! at the moment it was made.

use crate::clock::{CausalContext, OpId, Stamp};
use crate::error::MergeError;
use flowsync_model::{EntityId, EntityKind, Fields, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single structural or field-level edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create an entity with its initial fields
    Add {
        /// New entity
        id: EntityId,
        /// Kind derived from the entity's `type`
        kind: EntityKind,
        /// Complete field map, `type` included
        fields: Fields,
    },

    /// Overwrite some fields of an entity, leaving the rest untouched
    Update {
        /// Target entity
        id: EntityId,
        /// Fields to write; `null` clears a field
        fields: Fields,
    },

    /// Tombstone an entity
    Remove {
        /// Entity to remove
        id: EntityId,
    },

    /// Replace the whole workspace order list
    SetWorkspaceOrder {
        /// Workspace ids, first tab first
        order: Vec<EntityId>,
    },
}

impl Operation {
    /// Entity targeted by this operation
    #[inline]
    #[must_use]
    pub fn target(&self) -> Option<&EntityId> {
        match self {
            Self::Add { id, .. } | Self::Update { id, .. } | Self::Remove { id } => Some(id),
            Self::SetWorkspaceOrder { .. } => None,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
            Self::SetWorkspaceOrder { .. } => "set_workspace_order",
        }
    }
}

/// Atomic batch of operations from one replica
///
/// # Invariants
/// - `ops` is non-empty
/// - `deps` does not contain `id`, and contains `(id.actor, id.seq - 1)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    id: OpId,
    lamport: u64,
    deps: CausalContext,
    ops: Vec<Operation>,
}

impl Change {
    /// Change identity
    #[inline]
    #[must_use]
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Authoring replica
    #[inline]
    #[must_use]
    pub fn actor(&self) -> ReplicaId {
        self.id.actor
    }

    /// Lamport time of the first operation
    #[inline]
    #[must_use]
    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    /// Causal context of the author when the change was made
    #[inline]
    #[must_use]
    pub fn deps(&self) -> &CausalContext {
        &self.deps
    }

    /// Operations in application order
    #[inline]
    #[must_use]
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Stamp of the operation at `index`
    #[inline]
    #[must_use]
    pub fn stamp(&self, index: u32) -> Stamp {
        Stamp {
            lamport: self.lamport,
            actor: self.id.actor,
            index,
        }
    }

    /// Ids of all entities touched by this change
    #[must_use]
    pub fn touched(&self) -> BTreeSet<EntityId> {
        self.ops
            .iter()
            .filter_map(Operation::target)
            .cloned()
            .collect()
    }

    /// Check structural invariants of a change received from elsewhere
    ///
    /// # Errors
    /// Returns error if the change is empty, has a zero sequence number, or
    /// its dependencies contradict its own identity.
    pub fn validate(&self) -> Result<(), MergeError> {
        let malformed = |reason: &str| MergeError::MalformedChange {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.ops.is_empty() {
            return Err(MergeError::EmptyChange);
        }
        if self.id.seq == 0 {
            return Err(malformed("sequence numbers start at 1"));
        }
        if self.deps.seq(&self.id.actor) != self.id.seq - 1 {
            return Err(malformed("dependencies must end at the previous change of the author"));
        }
        if self.lamport == 0 {
            return Err(malformed("lamport time starts at 1"));
        }
        Ok(())
    }
}

/// Builder for constructing changes
#[derive(Debug, Default)]
pub struct ChangeBuilder {
    actor: Option<ReplicaId>,
    seq: Option<u64>,
    lamport: Option<u64>,
    deps: Option<CausalContext>,
    ops: Vec<Operation>,
}

impl ChangeBuilder {
    /// Empty builder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set author and sequence number
    #[inline]
    #[must_use]
    pub fn id(mut self, id: OpId) -> Self {
        self.actor = Some(id.actor);
        self.seq = Some(id.seq);
        self
    }

    /// Set the Lamport time
    #[inline]
    #[must_use]
    pub fn lamport(mut self, lamport: u64) -> Self {
        self.lamport = Some(lamport);
        self
    }

    /// Set the causal context
    #[inline]
    #[must_use]
    pub fn deps(mut self, deps: CausalContext) -> Self {
        self.deps = Some(deps);
        self
    }

    /// Append one operation
    #[inline]
    #[must_use]
    pub fn op(mut self, op: Operation) -> Self {
        self.ops.push(op);
        self
    }

    /// Append several operations
    #[inline]
    #[must_use]
    pub fn ops(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.ops.extend(ops);
        self
    }

    /// Build change
    ///
    /// # Errors
    /// Returns error if any required part is missing or the result violates
    /// [`Change::validate`]
    pub fn build(self) -> Result<Change, MergeError> {
        let actor = self.actor.ok_or(MergeError::Incomplete("actor"))?;
        let seq = self.seq.ok_or(MergeError::Incomplete("seq"))?;
        let lamport = self.lamport.ok_or(MergeError::Incomplete("lamport"))?;
        let deps = self.deps.ok_or(MergeError::Incomplete("deps"))?;

        let change = Change {
            id: OpId::new(actor, seq),
            lamport,
            deps,
            ops: self.ops,
        };
        change.validate()?;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actor() -> ReplicaId {
        ReplicaId::from_u128(1)
    }

    fn remove(id: &str) -> Operation {
        Operation::Remove { id: id.into() }
    }

    #[test]
    fn builder_success() {
        let change = ChangeBuilder::new()
            .id(OpId::new(actor(), 1))
            .lamport(1)
            .deps(CausalContext::new())
            .op(remove("n1"))
            .op(remove("n2"))
            .build()
            .unwrap();

        assert_eq!(change.id().seq, 1);
        assert_eq!(change.ops().len(), 2);
        assert_eq!(change.stamp(1).index, 1);
        assert_eq!(change.touched().len(), 2);
    }

    #[test]
    fn builder_missing_lamport() {
        let result = ChangeBuilder::new()
            .id(OpId::new(actor(), 1))
            .deps(CausalContext::new())
            .op(remove("n1"))
            .build();
        assert!(matches!(result, Err(MergeError::Incomplete("lamport"))));
    }

    #[test]
    fn empty_change_is_rejected() {
        let result = ChangeBuilder::new()
            .id(OpId::new(actor(), 1))
            .lamport(1)
            .deps(CausalContext::new())
            .build();
        assert!(matches!(result, Err(MergeError::EmptyChange)));
    }

    #[test]
    fn gap_in_own_history_is_rejected() {
        let result = ChangeBuilder::new()
            .id(OpId::new(actor(), 3))
            .lamport(3)
            .deps(CausalContext::new())
            .op(remove("n1"))
            .build();
        assert!(matches!(result, Err(MergeError::MalformedChange { .. })));
    }

    #[test]
    fn operation_wire_format_is_tagged() {
        let op = Operation::Update {
            id: "n1".into(),
            fields: match json!({"name": "renamed-node"}) {
                serde_json::Value::Object(m) => m,
                _ => unreachable!(),
            },
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], json!("update"));
        assert_eq!(value["id"], json!("n1"));
        assert_eq!(value["fields"]["name"], json!("renamed-node"));
    }

    #[test]
    fn operation_targets() {
        assert_eq!(remove("n1").target(), Some(&EntityId::new("n1")));
        assert!(Operation::SetWorkspaceOrder { order: vec![] }.target().is_none());
    }
}
