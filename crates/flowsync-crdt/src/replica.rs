//! Replica: validated mutations over a merge core
//!
//! [`Replica`] is the document store of one editor. Local mutations are
//! checked against the current state before they become changes; remote
//! changes are passed straight to the core and never rejected.

use crate::change::{Change, Operation};
use crate::clock::CausalContext;
use crate::error::MergeError;
use crate::merge::{ApplyOutcome, MergeCore};
use crate::observed::ObservedCore;
use flowsync_model::{
    Document, Entity, EntityId, EntityKind, Fields, ModelError, PositionUpdate, ReplicaId,
    ID_FIELD, TYPE_FIELD,
};
use serde_json::Value;
use tracing::{debug, warn};

/// One replica of the flow document
#[derive(Debug, Clone)]
pub struct Replica<C: MergeCore = ObservedCore> {
    core: C,
}

impl Replica<ObservedCore> {
    /// Create an empty replica with the default merge core
    #[must_use]
    pub fn new(actor: ReplicaId) -> Self {
        Self::with_core(ObservedCore::new(actor))
    }
}

impl<C: MergeCore> Replica<C> {
    /// Wrap an existing merge core
    #[must_use]
    pub fn with_core(core: C) -> Self {
        Self { core }
    }

    /// Replica this store authors changes as
    #[inline]
    #[must_use]
    pub fn actor(&self) -> ReplicaId {
        self.core.actor()
    }

    /// Underlying merge core
    #[inline]
    #[must_use]
    pub fn core(&self) -> &C {
        &self.core
    }

    /// Live entity with this id
    #[inline]
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.core.get(id)
    }

    /// Deep copy of the document
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Document {
        self.core.snapshot()
    }

    /// Add an entity of any kind
    ///
    /// # Errors
    /// - `DuplicateId` if the id is live, was removed before, or is held by
    ///   an entity hidden inside a removed container
    /// - `UnknownWorkspace` if `z` names no live workspace or subflow
    pub fn add_node(&mut self, entity: Entity) -> Result<Change, MergeError> {
        let id = entity.id().clone();
        if id.is_empty() {
            return Err(ModelError::EmptyId.into());
        }
        if self.core.is_known(&id) {
            return Err(MergeError::DuplicateId(id));
        }
        if let Some(z) = entity.parent() {
            self.check_container(&id, entity.kind(), z)?;
        }

        let kind = entity.kind();
        let fields = entity.into_fields()?;
        let change = self
            .core
            .apply_local(vec![Operation::Add { id, kind, fields }])?;
        Ok(change)
    }

    /// Overwrite some fields of a live entity
    ///
    /// Fields whose value is unchanged are dropped; `None` is returned when
    /// nothing is left to write.
    ///
    /// # Errors
    /// - `NotFound` if the entity is not live
    /// - `ImmutableField` if `id` or `type` would change
    /// - `UnknownWorkspace` if a new `z` names no live container
    /// - `Model` if the result is not a valid entity
    pub fn update_node(
        &mut self,
        id: &EntityId,
        partial: Fields,
    ) -> Result<Option<Change>, MergeError> {
        let current = self
            .core
            .get(id)
            .ok_or_else(|| MergeError::NotFound(id.clone()))?;
        let kind = current.kind();
        let current_type = current.type_name().to_string();
        let mut merged = current.into_fields()?;

        let mut changed = Fields::new();
        for (name, value) in partial {
            let immutable = match name.as_str() {
                ID_FIELD => Some(Value::String(id.to_string())),
                TYPE_FIELD => Some(Value::String(current_type.clone())),
                _ => None,
            };
            if let Some(expected) = immutable {
                if value != expected {
                    return Err(MergeError::ImmutableField {
                        id: id.clone(),
                        field: name,
                    });
                }
                continue;
            }
            if merged.get(&name) == Some(&value) || (value.is_null() && !merged.contains_key(&name))
            {
                continue;
            }
            changed.insert(name, value);
        }

        if changed.is_empty() {
            debug!(entity = %id, "update changes nothing");
            return Ok(None);
        }

        if let Some(Value::String(z)) = changed.get("z") {
            self.check_container(id, kind, &EntityId::new(z.as_str()))?;
        }

        for (name, value) in &changed {
            if value.is_null() {
                merged.remove(name);
            } else {
                merged.insert(name.clone(), value.clone());
            }
        }
        Entity::from_fields(merged)?;

        let change = self.core.apply_local(vec![Operation::Update {
            id: id.clone(),
            fields: changed,
        }])?;
        Ok(Some(change))
    }

    /// Remove an entity
    ///
    /// `kind_hint` is advisory: the kind recorded in the document decides.
    /// Removing a workspace or subflow also removes everything inside it,
    /// in the same change.
    ///
    /// # Errors
    /// `NotFound` if the entity is not live
    pub fn remove_node(
        &mut self,
        id: &EntityId,
        kind_hint: Option<EntityKind>,
    ) -> Result<Change, MergeError> {
        let kind = self
            .core
            .kind_of(id)
            .ok_or_else(|| MergeError::NotFound(id.clone()))?;
        if let Some(hint) = kind_hint {
            if hint != kind {
                debug!(entity = %id, %hint, actual = %kind, "remove kind hint does not match");
            }
        }

        let mut ops = Vec::new();
        if kind.is_container() {
            ops.extend(
                self.core
                    .children_of(id)
                    .into_iter()
                    .map(|child| Operation::Remove { id: child }),
            );
        }
        ops.push(Operation::Remove { id: id.clone() });

        if ops.len() > 1 {
            debug!(entity = %id, children = ops.len() - 1, "removing container with children");
        }
        self.core.apply_local(ops)
    }

    /// Move several entities in one change
    ///
    /// Ids that are not live are skipped. Returns `None` if nothing moved.
    ///
    /// # Errors
    /// Returns error if the merge core rejects the change
    pub fn batch_position_update(
        &mut self,
        updates: &[PositionUpdate],
    ) -> Result<Option<Change>, MergeError> {
        let mut ops = Vec::with_capacity(updates.len());
        for update in updates {
            if self.core.get(&update.id).is_none() {
                warn!(entity = %update.id, "skipping position update for unknown entity");
                continue;
            }
            let mut fields = Fields::new();
            fields.insert("x".to_string(), Value::from(update.x));
            fields.insert("y".to_string(), Value::from(update.y));
            ops.push(Operation::Update {
                id: update.id.clone(),
                fields,
            });
        }

        if ops.is_empty() {
            return Ok(None);
        }
        self.core.apply_local(ops).map(Some)
    }

    /// Replace the workspace order
    ///
    /// The stored list is taken as written; the materialised order drops ids
    /// that are not live workspaces and appends live ones that are missing.
    ///
    /// # Errors
    /// Returns error if the merge core rejects the change
    pub fn set_workspace_order(&mut self, order: Vec<EntityId>) -> Result<Change, MergeError> {
        let unknown = order
            .iter()
            .filter(|id| self.core.kind_of(id) != Some(EntityKind::Workspace))
            .count();
        if unknown > 0 {
            debug!(unknown, "workspace order names ids that are not live workspaces");
        }
        self.core
            .apply_local(vec![Operation::SetWorkspaceOrder { order }])
    }

    /// Merge a change from another replica
    ///
    /// # Errors
    /// Returns error if the change is malformed
    #[inline]
    pub fn apply_remote(&mut self, change: Change) -> Result<ApplyOutcome, MergeError> {
        self.core.apply_remote(change)
    }

    /// Changes applied so far
    #[inline]
    #[must_use]
    pub fn state_vector(&self) -> CausalContext {
        self.core.state_vector()
    }

    /// Applied changes that `context` lacks, in causal order
    #[inline]
    #[must_use]
    pub fn changes_since(&self, context: &CausalContext) -> Vec<Change> {
        self.core.changes_since(context)
    }

    /// Concurrent values of one field
    #[inline]
    #[must_use]
    pub fn conflicts(&self, id: &EntityId, field: &str) -> Vec<Value> {
        self.core.conflicts(id, field)
    }

    fn check_container(
        &self,
        id: &EntityId,
        kind: EntityKind,
        z: &EntityId,
    ) -> Result<(), MergeError> {
        match self.core.kind_of(z) {
            Some(k) if k.is_container() => Ok(()),
            _ => Err(MergeError::UnknownWorkspace {
                id: id.clone(),
                kind,
                workspace: z.clone(),
            }),
        }
    }
}
