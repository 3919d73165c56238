//! Node model: a computational unit owning named ports.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::port::{DIRTY, PortDecl, PortId, Version};

/// Identifies a node in a graph.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub(crate) fn fresh() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An ordered list of port declarations for a node type.
///
/// Layouts compose explicitly: a "subtype" starts from its base layout and
/// extends it with more declarations, instead of any field scanning. A
/// later declaration with the same name shadows the earlier one.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PortLayout {
    decls: Vec<PortDecl>,
}

impl PortLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, decl: PortDecl) -> Self {
        self.push(decl);
        self
    }

    pub fn push(&mut self, decl: PortDecl) {
        self.decls.retain(|d| d.name != decl.name);
        self.decls.push(decl);
    }

    /// Append every declaration of `base` (explicit composition in place
    /// of declaration inheritance).
    pub fn extend(&mut self, base: &PortLayout) {
        for decl in &base.decls {
            self.push(decl.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&PortDecl> {
        self.decls.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortDecl> {
        self.decls.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

/// Runtime state of one node: its declared layout, the ports realized so
/// far (created lazily on first lookup), and the node's own pass version
/// tracking whether its scalar aggregate state is current.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    /// Free-form type label, e.g. "math.double" (used for logs only).
    pub label: String,
    pub layout: PortLayout,
    /// Realized sink-capable ports by declared name.
    pub sinks: IndexMap<String, PortId>,
    /// Realized source-capable ports by declared name. An `InOut` port
    /// appears in both maps under the same name.
    pub sources: IndexMap<String, PortId>,
    pub version: Version,
}

impl Node {
    pub(crate) fn new(label: &str, layout: PortLayout) -> Self {
        Self {
            id: NodeId::fresh(),
            label: label.to_string(),
            layout,
            sinks: IndexMap::new(),
            sources: IndexMap::new(),
            version: DIRTY,
        }
    }
}
