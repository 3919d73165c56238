//! Port model: typed endpoints and the edge state between them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::value::{ChangeKind, Key, Value, ValueKind};

/// Pass counter. `-1` means dirty; `v >= 0` means coherent as of pass `v`.
pub type Version = i64;

/// The dirty sentinel.
pub const DIRTY: Version = -1;

/// Identifies a port in a graph.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortId(pub Uuid);

impl PortId {
    pub(crate) fn fresh() -> Self {
        PortId(Uuid::new_v4())
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Direction of a port. `InOut` is a pass-through: simultaneously a sink
/// and a source, registered in both of a node's namespaces.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Source,
    Sink,
    InOut,
}

impl PortDirection {
    pub fn source_capable(self) -> bool {
        matches!(self, PortDirection::Source | PortDirection::InOut)
    }

    pub fn sink_capable(self) -> bool {
        matches!(self, PortDirection::Sink | PortDirection::InOut)
    }
}

/// Shape of the value a port carries. Keyed ports hold a `Value::Map` and
/// support per-key invalidation on top of the scalar protocol.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortShape {
    Scalar,
    Keyed,
}

/// Declaration of a named port on a node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PortDecl {
    /// Name used for wiring (e.g. "in", "items_out").
    pub name: String,
    pub direction: PortDirection,
    pub shape: PortShape,
    pub kind: ValueKind,
}

impl PortDecl {
    pub fn source(name: &str, kind: ValueKind) -> Self {
        Self::new(name, PortDirection::Source, kind)
    }

    pub fn sink(name: &str, kind: ValueKind) -> Self {
        Self::new(name, PortDirection::Sink, kind)
    }

    pub fn inout(name: &str, kind: ValueKind) -> Self {
        Self::new(name, PortDirection::InOut, kind)
    }

    fn new(name: &str, direction: PortDirection, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            direction,
            shape: PortShape::Scalar,
            kind,
        }
    }

    /// Mark this declaration as map-shaped with per-key invalidation.
    pub fn keyed(mut self) -> Self {
        self.shape = PortShape::Keyed;
        self.kind = ValueKind::Map;
        self
    }
}

/// Runtime state of one port.
///
/// Edges are id pairs kept consistent on both sides: a sink holds at most
/// one `input`, a source holds a fan-out `outputs` list. The keyed state
/// (`dirty`, `derived`) is unused on scalar ports.
#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    /// Owning node, `None` for free-standing ports.
    pub owner: Option<crate::model::node::NodeId>,
    /// Declared name ("" for free-standing ports created from a bare decl
    /// with an empty name).
    pub name: String,
    pub direction: PortDirection,
    pub shape: PortShape,
    pub kind: ValueKind,
    pub version: Version,
    /// Cached value; absent until the first settle or set.
    pub value: Option<Value>,
    /// Bound upstream source, if any. Single-assignment: rebinding goes
    /// through an explicit unbind.
    pub input: Option<PortId>,
    /// Bound downstream sinks, in bind order.
    pub outputs: Vec<PortId>,
    /// Currently-invalid keys and why. Invariant: contains a key exactly
    /// while that key is awaiting settle_key.
    pub dirty: IndexMap<Key, ChangeKind>,
    /// Cached single-key projection ports, created on demand and never
    /// auto-evicted.
    pub derived: IndexMap<Key, PortId>,
    /// Set on projection ports: the keyed parent and the observed key.
    pub derived_from: Option<(PortId, Key)>,
}

impl Port {
    pub(crate) fn from_decl(decl: &PortDecl, owner: Option<crate::model::node::NodeId>) -> Self {
        Self {
            id: PortId::fresh(),
            owner,
            name: decl.name.clone(),
            direction: decl.direction,
            shape: decl.shape,
            kind: decl.kind,
            version: DIRTY,
            value: None,
            input: None,
            outputs: Vec::new(),
            dirty: IndexMap::new(),
            derived: IndexMap::new(),
            derived_from: None,
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.shape == PortShape::Keyed
    }

    pub fn is_coherent(&self) -> bool {
        self.version >= 0
    }

    /// Map entry of a keyed port's cached value.
    pub fn value_at(&self, key: &str) -> Option<&Value> {
        self.value.as_ref().and_then(|v| v.get(key))
    }
}
