//! Flow entities
//!
//! Entities are stored field-by-field by the replication layer, so every
//! typed view here converts to and from a flat JSON field map. Properties the
//! typed view does not know about are kept in `extra` and survive the round
//! trip untouched.

use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat field map of one entity
pub type Fields = serde_json::Map<String, Value>;

/// Field holding the entity id
pub const ID_FIELD: &str = "id";

/// Field holding the entity type name
pub const TYPE_FIELD: &str = "type";

/// Kind of entity, derived from its `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Flow node (any type that is not one of the container kinds)
    Node,
    /// Workspace, shown as a tab (`type == "tab"`)
    Workspace,
    /// Subflow definition (`type == "subflow"`)
    Subflow,
    /// Visual group of nodes (`type == "group"`)
    Group,
}

impl EntityKind {
    /// Classify an entity by its type name
    #[must_use]
    pub fn from_type(type_name: &str) -> Self {
        match type_name {
            "tab" => Self::Workspace,
            "subflow" => Self::Subflow,
            "group" => Self::Group,
            _ => Self::Node,
        }
    }

    /// Name used in logs and error messages
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Workspace => "workspace",
            Self::Subflow => "subflow",
            Self::Group => "group",
        }
    }

    /// Whether other entities can live inside this one via `z`
    #[inline]
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Workspace | Self::Subflow)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique entity id
    pub id: EntityId,

    /// Node type, such as `inject` or `debug`
    #[serde(rename = "type")]
    pub node_type: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Canvas position
    #[serde(default)]
    pub x: f64,

    /// Canvas position
    #[serde(default)]
    pub y: f64,

    /// Owning workspace or subflow; config nodes have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<EntityId>,

    /// Output ports, each a list of target node ids
    #[serde(default)]
    pub wires: Vec<Vec<EntityId>>,

    /// Type-specific properties
    #[serde(flatten)]
    pub extra: Fields,
}

impl Node {
    /// Create a node of the given type at the origin
    #[must_use]
    pub fn new(id: impl Into<EntityId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            x: 0.0,
            y: 0.0,
            z: None,
            wires: Vec::new(),
            extra: Fields::new(),
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Place the node on the canvas
    #[must_use]
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    /// Put the node on a workspace or subflow
    #[must_use]
    pub fn on(mut self, z: impl Into<EntityId>) -> Self {
        self.z = Some(z.into());
        self
    }

    /// Set the output wiring
    #[must_use]
    pub fn with_wires(mut self, wires: Vec<Vec<EntityId>>) -> Self {
        self.wires = wires;
        self
    }
}

/// Workspace (tab)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Unique entity id
    pub id: EntityId,

    /// Tab label
    #[serde(default)]
    pub label: String,

    /// Disabled tabs are not deployed
    #[serde(default)]
    pub disabled: bool,

    /// Description
    #[serde(default)]
    pub info: String,

    /// Other properties
    #[serde(flatten)]
    pub extra: Fields,
}

impl Workspace {
    /// Create an enabled workspace with the given label
    #[must_use]
    pub fn new(id: impl Into<EntityId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            disabled: false,
            info: String::new(),
            extra: Fields::new(),
        }
    }
}

/// Subflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subflow {
    /// Unique entity id
    pub id: EntityId,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Description
    #[serde(default)]
    pub info: String,

    /// Input port descriptors
    #[serde(default, rename = "in")]
    pub inputs: Vec<Value>,

    /// Output port descriptors
    #[serde(default, rename = "out")]
    pub outputs: Vec<Value>,

    /// Other properties
    #[serde(flatten)]
    pub extra: Fields,
}

impl Subflow {
    /// Create a subflow without ports
    #[must_use]
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            info: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            extra: Fields::new(),
        }
    }
}

/// Group of nodes on a workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique entity id
    pub id: EntityId,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Workspace the group is drawn on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<EntityId>,

    /// Member entity ids
    #[serde(default)]
    pub nodes: Vec<EntityId>,

    /// Editor styling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,

    /// Other properties
    #[serde(flatten)]
    pub extra: Fields,
}

impl Group {
    /// Create an empty group on a workspace
    #[must_use]
    pub fn new(id: impl Into<EntityId>, z: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            z: Some(z.into()),
            nodes: Vec::new(),
            style: None,
            extra: Fields::new(),
        }
    }
}

/// Any flow entity
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// `type` is anything else
    Node(Node),
    /// `type == "tab"`
    Workspace(Workspace),
    /// `type == "subflow"`
    Subflow(Subflow),
    /// `type == "group"`
    Group(Group),
}

impl Entity {
    /// Build an entity from its flat field map
    ///
    /// # Errors
    /// Returns error if `id` or `type` is missing, or a known field has the
    /// wrong shape.
    pub fn from_fields(mut fields: Fields) -> Result<Self, ModelError> {
        let id = match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::String(_)) => return Err(ModelError::EmptyId),
            _ => return Err(ModelError::MissingField(ID_FIELD)),
        };
        let kind = match fields.get(TYPE_FIELD) {
            Some(Value::String(t)) => EntityKind::from_type(t),
            _ => return Err(ModelError::MissingField(TYPE_FIELD)),
        };

        // Container kinds have a fixed type name; keep it out of `extra`
        if kind != EntityKind::Node {
            fields.remove(TYPE_FIELD);
        }

        let value = Value::Object(fields);
        let invalid = |source| ModelError::InvalidEntity {
            id: id.clone(),
            kind,
            source,
        };

        Ok(match kind {
            EntityKind::Node => Self::Node(serde_json::from_value(value).map_err(invalid)?),
            EntityKind::Workspace => {
                Self::Workspace(serde_json::from_value(value).map_err(invalid)?)
            }
            EntityKind::Subflow => Self::Subflow(serde_json::from_value(value).map_err(invalid)?),
            EntityKind::Group => Self::Group(serde_json::from_value(value).map_err(invalid)?),
        })
    }

    /// Flatten into a field map, always including `id` and `type`
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn into_fields(self) -> Result<Fields, ModelError> {
        let type_name = self.type_name().to_string();
        let value = match self {
            Self::Node(n) => serde_json::to_value(n),
            Self::Workspace(w) => serde_json::to_value(w),
            Self::Subflow(s) => serde_json::to_value(s),
            Self::Group(g) => serde_json::to_value(g),
        }?;

        match value {
            Value::Object(mut fields) => {
                fields.insert(TYPE_FIELD.to_string(), Value::String(type_name));
                Ok(fields)
            }
            _ => Err(ModelError::NotAnObject),
        }
    }

    /// Entity id
    #[must_use]
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Node(n) => &n.id,
            Self::Workspace(w) => &w.id,
            Self::Subflow(s) => &s.id,
            Self::Group(g) => &g.id,
        }
    }

    /// Entity kind
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Node(_) => EntityKind::Node,
            Self::Workspace(_) => EntityKind::Workspace,
            Self::Subflow(_) => EntityKind::Subflow,
            Self::Group(_) => EntityKind::Group,
        }
    }

    /// Value of the `type` field
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Node(n) => &n.node_type,
            Self::Workspace(_) => "tab",
            Self::Subflow(_) => "subflow",
            Self::Group(_) => "group",
        }
    }

    /// Display name (`label` for workspaces, `name` otherwise)
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Node(n) => n.name.as_deref(),
            Self::Workspace(w) => Some(&w.label),
            Self::Subflow(s) => Some(&s.name),
            Self::Group(g) => g.name.as_deref(),
        }
    }

    /// Owning container, if the entity lives inside one
    #[must_use]
    pub fn parent(&self) -> Option<&EntityId> {
        match self {
            Self::Node(n) => n.z.as_ref(),
            Self::Group(g) => g.z.as_ref(),
            Self::Workspace(_) | Self::Subflow(_) => None,
        }
    }

    /// Borrow as a node
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Node(n) => Some(n),
            _ => None,
        }
    }

    /// Borrow as a workspace
    pub fn as_workspace(&self) -> Option<&Workspace> {
        match self {
            Self::Workspace(w) => Some(w),
            _ => None,
        }
    }

    /// Borrow as a subflow
    pub fn as_subflow(&self) -> Option<&Subflow> {
        match self {
            Self::Subflow(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a group
    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Self::Group(g) => Some(g),
            _ => None,
        }
    }
}

impl From<Node> for Entity {
    fn from(n: Node) -> Self {
        Self::Node(n)
    }
}

impl From<Workspace> for Entity {
    fn from(w: Workspace) -> Self {
        Self::Workspace(w)
    }
}

impl From<Subflow> for Entity {
    fn from(s: Subflow) -> Self {
        Self::Subflow(s)
    }
}

impl From<Group> for Entity {
    fn from(g: Group) -> Self {
        Self::Group(g)
    }
}

impl Serialize for Entity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Node(n) => n.serialize(serializer),
            Self::Workspace(w) => w.serialize(serializer),
            Self::Subflow(s) => s.serialize(serializer),
            Self::Group(g) => g.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Fields::deserialize(deserializer)?;
        Self::from_fields(fields).map_err(serde::de::Error::custom)
    }
}

/// One entry of a batch position update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    /// Entity to move
    pub id: EntityId,
    /// New x coordinate
    pub x: f64,
    /// New y coordinate
    pub y: f64,
}

impl PositionUpdate {
    /// Move `id` to `(x, y)`
    #[must_use]
    pub fn new(id: impl Into<EntityId>, x: f64, y: f64) -> Self {
        Self { id: id.into(), x, y }
    }
}

/// Errors from entity conversion
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Required field missing
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// Empty id
    #[error("entity id must not be empty")]
    EmptyId,

    /// Field has the wrong shape
    #[error("invalid {kind} '{id}': {source}")]
    InvalidEntity {
        /// Offending id
        id: String,
        /// Kind implied by `type`
        kind: EntityKind,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Serialization produced something other than an object
    #[error("entity did not serialize to an object")]
    NotAnObject,

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn kind_from_type_name() {
        assert_eq!(EntityKind::from_type("tab"), EntityKind::Workspace);
        assert_eq!(EntityKind::from_type("subflow"), EntityKind::Subflow);
        assert_eq!(EntityKind::from_type("group"), EntityKind::Group);
        assert_eq!(EntityKind::from_type("inject"), EntityKind::Node);
        assert_eq!(EntityKind::from_type("subflow:abc"), EntityKind::Node);
    }

    #[test]
    fn node_from_fields_keeps_extra_properties() {
        let entity = Entity::from_fields(fields(json!({
            "id": "n1",
            "type": "inject",
            "name": "test-sync-node",
            "x": 200,
            "y": 200,
            "z": "ws1",
            "wires": [[]],
            "repeat": "5"
        })))
        .unwrap();

        let node = entity.as_node().unwrap();
        assert_eq!(node.name.as_deref(), Some("test-sync-node"));
        assert_eq!(node.x, 200.0);
        assert_eq!(node.z, Some(EntityId::new("ws1")));
        assert_eq!(node.wires, vec![Vec::<EntityId>::new()]);
        assert_eq!(node.extra.get("repeat"), Some(&json!("5")));
    }

    #[test]
    fn workspace_from_fields() {
        let entity = Entity::from_fields(fields(json!({
            "id": "t1",
            "type": "tab",
            "label": "Sync Test Tab",
            "disabled": false,
            "info": ""
        })))
        .unwrap();

        assert_eq!(entity.kind(), EntityKind::Workspace);
        assert_eq!(entity.name(), Some("Sync Test Tab"));
        assert!(!entity.as_workspace().unwrap().disabled);
        assert!(entity.as_workspace().unwrap().extra.is_empty());
    }

    #[test]
    fn subflow_ports_use_editor_field_names() {
        let entity = Entity::from_fields(fields(json!({
            "id": "s1",
            "type": "subflow",
            "name": "Sync Test Subflow",
            "in": [{"x": 50, "y": 30, "wires": []}],
            "out": []
        })))
        .unwrap();

        let sf = entity.as_subflow().unwrap();
        assert_eq!(sf.inputs.len(), 1);
        assert!(sf.outputs.is_empty());
    }

    #[test]
    fn into_fields_includes_type() {
        let ws = Entity::from(Workspace::new("t1", "Flow 1"));
        let f = ws.into_fields().unwrap();
        assert_eq!(f.get("type"), Some(&json!("tab")));
        assert_eq!(f.get("id"), Some(&json!("t1")));
        assert_eq!(f.get("label"), Some(&json!("Flow 1")));
    }

    #[test]
    fn node_fields_roundtrip() {
        let node = Node::new("n1", "debug")
            .with_name("update-test")
            .at(150.0, 150.0)
            .on("ws1");
        let entity = Entity::from(node.clone());
        let back = Entity::from_fields(entity.into_fields().unwrap()).unwrap();
        assert_eq!(back, Entity::Node(node));
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = Entity::from_fields(fields(json!({"type": "inject"}))).unwrap_err();
        assert!(matches!(err, ModelError::MissingField("id")));
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = Entity::from_fields(fields(json!({"id": "n1"}))).unwrap_err();
        assert!(matches!(err, ModelError::MissingField("type")));
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let err = Entity::from_fields(fields(json!({
            "id": "n1",
            "type": "inject",
            "x": "not a number"
        })))
        .unwrap_err();
        assert!(matches!(err, ModelError::InvalidEntity { .. }));
    }

    #[test]
    fn entity_deserializes_by_type() {
        let entity: Entity =
            serde_json::from_value(json!({"id": "g1", "type": "group", "z": "ws1"})).unwrap();
        assert_eq!(entity.kind(), EntityKind::Group);
        assert_eq!(entity.parent(), Some(&EntityId::new("ws1")));
    }

    #[test]
    fn position_update_parses_from_editor_json() {
        let updates: Vec<PositionUpdate> =
            serde_json::from_str(r#"[{"id":"n1","x":350,"y":250}]"#).unwrap();
        assert_eq!(updates[0].id.as_str(), "n1");
        assert_eq!(updates[0].x, 350.0);
    }
}
