//! Merge and mutation errors

use crate::clock::OpId;
use flowsync_model::{EntityId, EntityKind, ModelError};

/// Errors raised while building or applying changes
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Local add for an id that is live or tombstoned
    #[error("duplicate entity id: {0}")]
    DuplicateId(EntityId),

    /// Entity is not live on this replica
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    /// Node refers to a container that is not live
    #[error("{kind} '{id}' references unknown workspace '{workspace}'")]
    UnknownWorkspace {
        /// Entity being written
        id: EntityId,
        /// Its kind
        kind: EntityKind,
        /// Missing container
        workspace: EntityId,
    },

    /// Attempt to change `id` or `type`
    #[error("field '{field}' of '{id}' cannot be changed")]
    ImmutableField {
        /// Entity being written
        id: EntityId,
        /// `id` or `type`
        field: String,
    },

    /// Change carries no operations
    #[error("change has no operations")]
    EmptyChange,

    /// Change is structurally invalid
    #[error("malformed change {id}: {reason}")]
    MalformedChange {
        /// Offending change
        id: OpId,
        /// What is wrong with it
        reason: String,
    },

    /// Builder is missing a required part
    #[error("incomplete change: missing {0}")]
    Incomplete(&'static str),

    /// Entity conversion failed
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

impl MergeError {
    /// Whether the error means the target entity is absent
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
