//! Default merge core
//!
//! [`ObservedCore`] keeps one [`MvRegister`] per entity field and resolves
//! writes by observation: a write replaces what its author had seen and
//! coexists with what it had not. Removal is a permanent tombstone.
//!
//! A materialised [`Document`] is kept alongside the registers and refreshed
//! for the entities each change touches, so reads never rebuild the whole
//! document.

use crate::change::{Change, ChangeBuilder, Operation};
use crate::clock::{CausalContext, OpId, Stamp};
use crate::error::MergeError;
use crate::log::{ChangeLog, Offer};
use crate::merge::{ApplyOutcome, MergeCore};
use crate::register::MvRegister;
use flowsync_model::{
    Document, Entity, EntityId, EntityKind, Fields, ModelError, ReplicaId, ID_FIELD, TYPE_FIELD,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Default)]
struct EntityRecord {
    created: Option<Stamp>,
    removed: Option<Stamp>,
    fields: BTreeMap<String, MvRegister<Value>>,
}

impl EntityRecord {
    fn is_live(&self) -> bool {
        self.created.is_some() && self.removed.is_none()
    }

    /// Visible field values as an entity; `null` values are treated as unset
    fn materialise(&self, id: &EntityId) -> Result<Entity, ModelError> {
        let mut fields: Fields = self
            .fields
            .iter()
            .filter_map(|(name, reg)| match reg.value() {
                None | Some(Value::Null) => None,
                Some(v) => Some((name.clone(), v.clone())),
            })
            .collect();
        fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        Entity::from_fields(fields)
    }
}

/// Type name implied by a container kind when an add omits `type`
fn implied_type(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Workspace => Some("tab"),
        EntityKind::Subflow => Some("subflow"),
        EntityKind::Group => Some("group"),
        EntityKind::Node => None,
    }
}

/// Observed-remove merge core with per-field multi-value registers
#[derive(Debug, Clone)]
pub struct ObservedCore {
    actor: ReplicaId,
    lamport: u64,
    log: ChangeLog,
    entities: BTreeMap<EntityId, EntityRecord>,
    order: MvRegister<Vec<EntityId>>,
    view: Document,
}

impl ObservedCore {
    /// Create an empty core authoring as `actor`
    #[must_use]
    pub fn new(actor: ReplicaId) -> Self {
        Self {
            actor,
            lamport: 0,
            log: ChangeLog::new(),
            entities: BTreeMap::new(),
            order: MvRegister::new(),
            view: Document::new(),
        }
    }

    fn is_removed(&self, id: &EntityId) -> bool {
        self.entities.get(id).is_some_and(|r| r.removed.is_some())
    }

    fn apply_change(&mut self, change: &Change) -> BTreeSet<EntityId> {
        self.lamport = self.lamport.max(change.lamport());

        let mut touched = BTreeSet::new();
        for (index, op) in change.ops().iter().enumerate() {
            let stamp = change.stamp(u32::try_from(index).unwrap_or(u32::MAX));
            self.apply_op(change.id(), stamp, change.deps(), op, &mut touched);
        }

        for id in &touched {
            self.refresh(id);
        }
        self.refresh_order();

        trace!(
            change = %change.id(),
            ops = change.ops().len(),
            touched = touched.len(),
            "change applied"
        );
        touched
    }

    fn apply_op(
        &mut self,
        origin: OpId,
        stamp: Stamp,
        deps: &CausalContext,
        op: &Operation,
        touched: &mut BTreeSet<EntityId>,
    ) {
        match op {
            Operation::Add { id, kind, fields } => {
                let record = self.entities.entry(id.clone()).or_default();
                if record.removed.is_some() {
                    debug!(entity = %id, "ignoring add for removed entity");
                    return;
                }
                record.created = Some(record.created.map_or(stamp, |c| c.min(stamp)));
                for (name, value) in fields {
                    if name != ID_FIELD {
                        record
                            .fields
                            .entry(name.clone())
                            .or_default()
                            .write(origin, stamp, deps, value.clone());
                    }
                }
                if !fields.contains_key(TYPE_FIELD) {
                    if let Some(type_name) = implied_type(*kind) {
                        record.fields.entry(TYPE_FIELD.to_string()).or_default().write(
                            origin,
                            stamp,
                            deps,
                            Value::String(type_name.to_string()),
                        );
                    }
                }
                touched.insert(id.clone());
            }
            Operation::Update { id, fields } => {
                let record = self.entities.entry(id.clone()).or_default();
                if record.removed.is_some() {
                    debug!(entity = %id, "ignoring update for removed entity");
                    return;
                }
                for (name, value) in fields {
                    if name == ID_FIELD || name == TYPE_FIELD {
                        debug!(entity = %id, field = %name, "ignoring write to immutable field");
                        continue;
                    }
                    record
                        .fields
                        .entry(name.clone())
                        .or_default()
                        .write(origin, stamp, deps, value.clone());
                }
                touched.insert(id.clone());
            }
            Operation::Remove { id } => {
                let record = self.entities.entry(id.clone()).or_default();
                if record.removed.is_none() {
                    record.removed = Some(stamp);
                    record.fields.clear();
                }
                // Children of a removed container disappear with it
                touched.extend(self.view.children_of(id));
                touched.insert(id.clone());
            }
            Operation::SetWorkspaceOrder { order } => {
                self.order.write(origin, stamp, deps, order.clone());
            }
        }
    }

    /// Rebuild the materialised entry for one id
    fn refresh(&mut self, id: &EntityId) {
        self.view.remove(id);

        let Some(record) = self.entities.get(id) else {
            return;
        };
        if !record.is_live() {
            return;
        }
        match record.materialise(id) {
            Ok(entity) => {
                if entity.parent().is_some_and(|z| self.is_removed(z)) {
                    trace!(entity = %id, "hiding entity of removed container");
                    return;
                }
                self.view.insert(entity);
            }
            Err(err) => warn!(entity = %id, error = %err, "entity cannot be materialised"),
        }
    }

    /// Live workspaces in the last written order, then the rest by creation
    fn refresh_order(&mut self) {
        let live = &self.view.workspaces;
        let mut seen = BTreeSet::new();
        let mut order = Vec::with_capacity(live.len());

        if let Some(written) = self.order.value() {
            for id in written {
                if live.contains_key(id) && seen.insert(id.clone()) {
                    order.push(id.clone());
                }
            }
        }

        let mut rest: Vec<_> = live
            .keys()
            .filter(|id| !seen.contains(*id))
            .map(|id| (self.entities.get(id).and_then(|r| r.created), id.clone()))
            .collect();
        rest.sort();
        order.extend(rest.into_iter().map(|(_, id)| id));

        self.view.workspace_order = order;
    }
}

impl MergeCore for ObservedCore {
    fn actor(&self) -> ReplicaId {
        self.actor
    }

    fn apply_local(&mut self, ops: Vec<Operation>) -> Result<Change, MergeError> {
        if ops.is_empty() {
            return Err(MergeError::EmptyChange);
        }

        let id = OpId::new(self.actor, self.log.context().seq(&self.actor) + 1);
        let change = ChangeBuilder::new()
            .id(id)
            .lamport(self.lamport + 1)
            .deps(self.log.context().clone())
            .ops(ops)
            .build()?;

        match self.log.offer(change.clone())? {
            Offer::Ready(released) => {
                for c in &released {
                    self.apply_change(c);
                }
            }
            Offer::Buffered | Offer::Duplicate => {
                return Err(MergeError::MalformedChange {
                    id,
                    reason: "local change is not causally ready".to_string(),
                });
            }
        }

        debug!(change = %id, ops = change.ops().len(), "local change applied");
        Ok(change)
    }

    fn apply_remote(&mut self, change: Change) -> Result<ApplyOutcome, MergeError> {
        let id = change.id();
        match self.log.offer(change)? {
            Offer::Duplicate => {
                trace!(change = %id, "duplicate change ignored");
                Ok(ApplyOutcome::Duplicate)
            }
            Offer::Buffered => {
                debug!(
                    change = %id,
                    pending = self.log.pending_len(),
                    "change buffered until its dependencies arrive"
                );
                Ok(ApplyOutcome::Buffered)
            }
            Offer::Ready(released) => {
                let mut touched = BTreeSet::new();
                let mut changes = Vec::with_capacity(released.len());
                for c in &released {
                    touched.extend(self.apply_change(c));
                    changes.push(c.id());
                }
                debug!(
                    change = %id,
                    applied = changes.len(),
                    touched = touched.len(),
                    "remote change merged"
                );
                Ok(ApplyOutcome::Applied { changes, touched })
            }
        }
    }

    fn snapshot(&self) -> Document {
        self.view.clone()
    }

    fn get(&self, id: &EntityId) -> Option<Entity> {
        self.view.get(id)
    }

    fn kind_of(&self, id: &EntityId) -> Option<EntityKind> {
        self.view.kind_of(id)
    }

    fn is_tombstoned(&self, id: &EntityId) -> bool {
        self.is_removed(id)
    }

    fn is_known(&self, id: &EntityId) -> bool {
        // Entities hidden inside a removed container still hold a record
        self.entities.contains_key(id)
    }

    fn children_of(&self, container: &EntityId) -> Vec<EntityId> {
        self.view.children_of(container)
    }

    fn state_vector(&self) -> CausalContext {
        self.log.context().clone()
    }

    fn changes_since(&self, context: &CausalContext) -> Vec<Change> {
        self.log.since(context)
    }

    fn conflicts(&self, id: &EntityId, field: &str) -> Vec<Value> {
        self.entities
            .get(id)
            .and_then(|r| r.fields.get(field))
            .map(|reg| reg.values().cloned().collect())
            .unwrap_or_default()
    }

    fn pending(&self) -> usize {
        self.log.pending_len()
    }

    fn name(&self) -> &'static str {
        "observed"
    }
}
