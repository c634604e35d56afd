//! Document snapshots
//!
//! [`Document`] is the serializable, deep-copyable view of one replica at a
//! point in time. It has the same JSON shape the editor reads:
//! `{ nodes, workspaces, subflows, groups, workspaceOrder }`.

use crate::entity::{Entity, EntityKind, Group, Node, Subflow, Workspace};
use crate::hash::{DigestError, DocumentDigest};
use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of the shared flow document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Flow nodes, including config nodes
    #[serde(default)]
    pub nodes: BTreeMap<EntityId, Node>,

    /// Workspaces (tabs)
    #[serde(default)]
    pub workspaces: BTreeMap<EntityId, Workspace>,

    /// Subflow definitions
    #[serde(default)]
    pub subflows: BTreeMap<EntityId, Subflow>,

    /// Node groups
    #[serde(default)]
    pub groups: BTreeMap<EntityId, Group>,

    /// Tab display order; contains exactly the ids in `workspaces`
    #[serde(default)]
    pub workspace_order: Vec<EntityId>,
}

impl Document {
    /// Empty document
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entity of any kind
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        if let Some(n) = self.nodes.get(id) {
            return Some(Entity::Node(n.clone()));
        }
        if let Some(w) = self.workspaces.get(id) {
            return Some(Entity::Workspace(w.clone()));
        }
        if let Some(s) = self.subflows.get(id) {
            return Some(Entity::Subflow(s.clone()));
        }
        self.groups.get(id).cloned().map(Entity::Group)
    }

    /// Kind of the entity with this id, if present
    #[must_use]
    pub fn kind_of(&self, id: &EntityId) -> Option<EntityKind> {
        if self.nodes.contains_key(id) {
            Some(EntityKind::Node)
        } else if self.workspaces.contains_key(id) {
            Some(EntityKind::Workspace)
        } else if self.subflows.contains_key(id) {
            Some(EntityKind::Subflow)
        } else if self.groups.contains_key(id) {
            Some(EntityKind::Group)
        } else {
            None
        }
    }

    /// Whether a live entity has this id
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.kind_of(id).is_some()
    }

    /// Insert an entity into the map matching its kind
    ///
    /// Returns the previous entity stored under the same id in that map.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        match entity {
            Entity::Node(n) => self.nodes.insert(n.id.clone(), n).map(Entity::Node),
            Entity::Workspace(w) => self
                .workspaces
                .insert(w.id.clone(), w)
                .map(Entity::Workspace),
            Entity::Subflow(s) => self.subflows.insert(s.id.clone(), s).map(Entity::Subflow),
            Entity::Group(g) => self.groups.insert(g.id.clone(), g).map(Entity::Group),
        }
    }

    /// Remove the entity with this id, whatever its kind
    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        if let Some(n) = self.nodes.remove(id) {
            return Some(Entity::Node(n));
        }
        if let Some(w) = self.workspaces.remove(id) {
            return Some(Entity::Workspace(w));
        }
        if let Some(s) = self.subflows.remove(id) {
            return Some(Entity::Subflow(s));
        }
        self.groups.remove(id).map(Entity::Group)
    }

    /// Total number of entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.workspaces.len() + self.subflows.len() + self.groups.len()
    }

    /// Whether the document holds no entities
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all entity ids, grouped by kind
    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.nodes
            .keys()
            .chain(self.workspaces.keys())
            .chain(self.subflows.keys())
            .chain(self.groups.keys())
    }

    /// Entities whose `z` points at the given container
    #[must_use]
    pub fn children_of(&self, container: &EntityId) -> Vec<EntityId> {
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.z.as_ref() == Some(container))
            .map(|n| n.id.clone());
        let groups = self
            .groups
            .values()
            .filter(|g| g.z.as_ref() == Some(container))
            .map(|g| g.id.clone());
        nodes.chain(groups).collect()
    }

    /// Digest of the whole snapshot, for convergence checks
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn digest(&self) -> Result<DocumentDigest, DigestError> {
        DocumentDigest::compute_serializable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Document {
        let mut doc = Document::new();
        doc.insert(Workspace::new("ws1", "Flow 1").into());
        doc.insert(Node::new("n1", "inject").on("ws1").into());
        doc.insert(Group::new("g1", "ws1").into());
        doc.insert(Subflow::new("sf1", "Sub").into());
        doc.workspace_order.push(EntityId::new("ws1"));
        doc
    }

    #[test]
    fn get_finds_every_kind() {
        let doc = sample();
        assert_eq!(doc.get(&"n1".into()).unwrap().kind(), EntityKind::Node);
        assert_eq!(doc.get(&"ws1".into()).unwrap().kind(), EntityKind::Workspace);
        assert_eq!(doc.get(&"sf1".into()).unwrap().kind(), EntityKind::Subflow);
        assert_eq!(doc.get(&"g1".into()).unwrap().kind(), EntityKind::Group);
        assert!(doc.get(&"missing".into()).is_none());
        assert_eq!(doc.len(), 4);
    }

    #[test]
    fn remove_any_kind() {
        let mut doc = sample();
        assert!(matches!(doc.remove(&"sf1".into()), Some(Entity::Subflow(_))));
        assert!(doc.remove(&"sf1".into()).is_none());
        assert!(!doc.contains(&"sf1".into()));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn children_of_workspace() {
        let doc = sample();
        let mut children = doc.children_of(&"ws1".into());
        children.sort();
        assert_eq!(children, vec![EntityId::new("g1"), EntityId::new("n1")]);
    }

    #[test]
    fn serializes_with_editor_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert!(value.get("workspaceOrder").is_some());
        assert_eq!(value["workspaceOrder"], json!(["ws1"]));
        assert_eq!(value["nodes"]["n1"]["type"], json!("inject"));
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let doc = sample();
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes, doc.nodes);
        assert_eq!(back.workspace_order, doc.workspace_order);
    }

    #[test]
    fn equal_documents_share_a_digest() {
        assert_eq!(sample().digest().unwrap(), sample().digest().unwrap());

        let mut other = sample();
        other.workspace_order.clear();
        assert_ne!(sample().digest().unwrap(), other.digest().unwrap());
    }
}
