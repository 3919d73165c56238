//! Graph storage, wiring and the named-port registry.
//!
//! The graph owns every port, node and behavior in flat id-keyed maps and
//! all protocol operations are methods on it; edges are id pairs kept
//! consistent on both endpoints. One graph is single-threaded: every
//! mutating operation takes `&mut self`, so host serialization (one graph
//! per actor, typically) is a compile-time fact rather than a locking
//! discipline.
//!
//! The bind graph must stay acyclic. No cycle detection is performed;
//! `invalidate`/`settle` recurse along edges and will overflow the stack
//! on a cyclic graph. Rejecting cycles at wiring time is the host's job.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::GraphError;
use crate::model::node::{Node, NodeId, PortLayout};
use crate::model::port::{Port, PortDecl, PortId, PortShape, Version};
use crate::model::value::{ChangeKind, Key, Value, ValueKind};

use super::behavior::{NodeBehavior, NodeContext};

/// An incremental recomputation graph.
#[derive(Default)]
pub struct Graph {
    pub(crate) ports: IndexMap<PortId, Port>,
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) behaviors: HashMap<NodeId, Box<dyn NodeBehavior>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- construction ----------------------------------------------------

    /// Add a free-standing port (a root source, a probe sink, a relay).
    pub fn add_port(&mut self, decl: PortDecl) -> PortId {
        let port = Port::from_decl(&decl, None);
        let id = port.id;
        log::debug!("add port {} '{}' ({:?})", id, decl.name, decl.direction);
        self.ports.insert(id, port);
        id
    }

    /// Add a node with the given declared layout. Ports are realized
    /// lazily on first lookup.
    pub fn add_node(&mut self, label: &str, layout: PortLayout) -> NodeId {
        let node = Node::new(label, layout);
        let id = node.id;
        log::debug!("add node {} '{}'", id, label);
        self.nodes.insert(id, node);
        id
    }

    /// Install (or replace) the recompute hooks of a node.
    pub fn set_behavior(&mut self, node: NodeId, behavior: Box<dyn NodeBehavior>) {
        self.behaviors.insert(node, behavior);
    }

    // ---- named-port registry ---------------------------------------------

    /// The node's sink port with the declared name, realized on demand.
    pub fn sink(&mut self, node: NodeId, name: &str) -> Result<PortId, GraphError> {
        if let Some(id) = self.node_state(node)?.sinks.get(name) {
            return Ok(*id);
        }
        self.realize_port(node, name, true)
    }

    /// The node's source port with the declared name, realized on demand.
    pub fn source(&mut self, node: NodeId, name: &str) -> Result<PortId, GraphError> {
        if let Some(id) = self.node_state(node)?.sources.get(name) {
            return Ok(*id);
        }
        self.realize_port(node, name, false)
    }

    fn realize_port(
        &mut self,
        node: NodeId,
        name: &str,
        want_sink: bool,
    ) -> Result<PortId, GraphError> {
        let state = self.node_state(node)?;
        let decl = state
            .layout
            .get(name)
            .ok_or_else(|| GraphError::UndeclaredPort(name.to_string()))?;
        let capable = if want_sink {
            decl.direction.sink_capable()
        } else {
            decl.direction.source_capable()
        };
        if !capable {
            return Err(GraphError::UndeclaredPort(name.to_string()));
        }

        let port = Port::from_decl(decl, Some(node));
        let id = port.id;
        let direction = port.direction;
        self.ports.insert(id, port);

        let state = self.node_state_mut(node)?;
        if direction.sink_capable() {
            state.sinks.insert(name.to_string(), id);
        }
        if direction.source_capable() {
            state.sources.insert(name.to_string(), id);
        }
        log::debug!("realize port '{}' on node {}", name, node);
        Ok(id)
    }

    // ---- wiring ----------------------------------------------------------

    /// Bind an edge from a source port to a sink port.
    ///
    /// Single-assignment on the sink side: binding a sink that is already
    /// bound to a different source is a wiring error (use [`Graph::rebind`]
    /// to replace an edge). Binding the same pair twice is a no-op. The
    /// graph is left unmodified on any error.
    pub fn bind(&mut self, source: PortId, sink: PortId) -> Result<(), GraphError> {
        if source == sink {
            return Err(GraphError::Wiring(format!("cannot bind port {source} to itself")));
        }
        let src = self.port_state(source)?;
        if !src.direction.source_capable() {
            return Err(GraphError::Wiring(format!("port '{}' is not a source", src.name)));
        }
        let src_kind = src.kind;
        let dst = self.port_state(sink)?;
        if !dst.direction.sink_capable() {
            return Err(GraphError::Wiring(format!("port '{}' is not a sink", dst.name)));
        }
        if !src_kind.compatible(dst.kind) {
            return Err(GraphError::TypeMismatch {
                source_kind: src_kind,
                sink_kind: dst.kind,
            });
        }
        match dst.input {
            Some(existing) if existing == source => return Ok(()),
            Some(_) => {
                return Err(GraphError::Wiring(format!(
                    "sink '{}' is already bound",
                    dst.name
                )));
            }
            None => {}
        }

        self.port_state_mut(sink)?.input = Some(source);
        self.port_state_mut(source)?.outputs.push(sink);
        log::debug!("bind {source} -> {sink}");

        // Late binding of an already-populated keyed source: re-mark its
        // keys so the new sink catches up through the per-key path.
        if self.port_state(sink)?.is_keyed() {
            let src = self.port_state(source)?;
            if src.is_keyed() {
                let keys: Vec<Key> = src
                    .value
                    .as_ref()
                    .and_then(|v| v.as_map())
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                for key in keys {
                    self.invalidate_key(sink, &key, ChangeKind::Update)?;
                }
            }
        }

        // The sink's cached value cannot be trusted across a rewire.
        self.invalidate(sink)?;
        Ok(())
    }

    /// Replace whatever edge the sink currently has with `source -> sink`.
    pub fn rebind(&mut self, source: PortId, sink: PortId) -> Result<(), GraphError> {
        if self.port_state(sink)?.input.is_some() {
            self.unbind(sink)?;
        }
        self.bind(source, sink)
    }

    /// Remove the sink's input edge, if any.
    pub fn unbind(&mut self, sink: PortId) -> Result<(), GraphError> {
        let Some(source) = self.port_state_mut(sink)?.input.take() else {
            return Ok(());
        };
        if let Ok(src) = self.port_state_mut(source) {
            src.outputs.retain(|out| *out != sink);
        }
        log::debug!("unbind {source} -> {sink}");
        Ok(())
    }

    /// Wire `src_node.src_port -> dst_node.dst_port` by declared names.
    pub fn bind_by_name(
        &mut self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        let source = self.source(src_node, src_port)?;
        let sink = self.sink(dst_node, dst_port)?;
        self.bind(source, sink)
    }

    /// Bind a node's named sink to the given source, replacing any
    /// existing edge.
    pub fn bind_sink(&mut self, node: NodeId, name: &str, source: PortId) -> Result<(), GraphError> {
        let sink = self.sink(node, name)?;
        self.rebind(source, sink)
    }

    /// Unbind a node's named sink. A name that was never realized is a
    /// no-op.
    pub fn unbind_sink(&mut self, node: NodeId, name: &str) -> Result<(), GraphError> {
        let Some(sink) = self.node_state(node)?.sinks.get(name).copied() else {
            return Ok(());
        };
        self.unbind(sink)
    }

    // ---- derived per-key projection ports --------------------------------

    /// The single-key projection port of a keyed port, created and cached
    /// on first request.
    ///
    /// A derived port is a plain scalar source whose value tracks the
    /// keyed port's value at `key`; it is driven exclusively by the keyed
    /// port's per-key protocol. Derived ports are never evicted from the
    /// cache except by a [`Graph::disconnect_outputs`] teardown sweep, so a
    /// churning key set grows this cache; eviction policy is the host's
    /// call.
    pub fn derived(&mut self, port: PortId, key: &str) -> Result<PortId, GraphError> {
        let state = self.port_state(port)?;
        if !state.is_keyed() {
            return Err(GraphError::ShapeMismatch(state.name.clone()));
        }
        if let Some(existing) = state.derived.get(key) {
            return Ok(*existing);
        }

        let name = format!("{}[{}]", state.name, key);
        let mut projection = Port::from_decl(&PortDecl::source(&name, ValueKind::Any), None);
        projection.derived_from = Some((port, key.to_string()));
        let id = projection.id;
        self.ports.insert(id, projection);
        self.port_state_mut(port)?.derived.insert(key.to_string(), id);
        log::debug!("derive {port}[{key}] as {id}");
        Ok(id)
    }

    // ---- mutation entry points -------------------------------------------

    /// Set a root source port's value and start an invalidation wave.
    ///
    /// On a keyed port, the new map is diffed against the cached one and
    /// each difference flows through the per-key protocol, so wholesale
    /// replacement keeps downstream recomputation fine-grained.
    pub fn set_value(&mut self, port: PortId, value: Value) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        if !value.kind().compatible(state.kind) {
            return Err(GraphError::TypeMismatch {
                source_kind: value.kind(),
                sink_kind: state.kind,
            });
        }

        if state.is_keyed() {
            let source_kind = value.kind();
            let Value::Map(new) = value else {
                return Err(GraphError::TypeMismatch {
                    source_kind,
                    sink_kind: ValueKind::Map,
                });
            };
            let old: Vec<Key> = state
                .value
                .as_ref()
                .and_then(|v| v.as_map())
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            for key in old {
                if !new.contains_key(&key) {
                    self.remove_key(port, &key)?;
                }
            }
            for (key, entry) in new {
                if self.port_state(port)?.value_at(&key) != Some(&entry) {
                    self.set_key(port, &key, entry)?;
                }
            }
            return Ok(());
        }

        self.port_state_mut(port)?.value = Some(value);
        self.invalidate(port)
    }

    /// Set one key of a keyed root port and mark it updated.
    pub fn set_key(&mut self, port: PortId, key: &str, value: Value) -> Result<(), GraphError> {
        self.store_key(port, key, value)?;
        self.invalidate_key(port, key, ChangeKind::Update)
    }

    /// Remove one key of a keyed root port and mark it removed. Removing
    /// an absent key is a no-op.
    pub fn remove_key(&mut self, port: PortId, key: &str) -> Result<(), GraphError> {
        if self.remove_stored_key(port, key)? {
            self.invalidate_key(port, key, ChangeKind::Remove)?;
        }
        Ok(())
    }

    pub(crate) fn store_key(&mut self, port: PortId, key: &str, value: Value) -> Result<(), GraphError> {
        let state = self.port_state_mut(port)?;
        if state.shape != PortShape::Keyed {
            return Err(GraphError::ShapeMismatch(state.name.clone()));
        }
        let map = match state.value.get_or_insert_with(|| Value::Map(IndexMap::new())) {
            Value::Map(m) => m,
            other => {
                return Err(GraphError::TypeMismatch {
                    source_kind: other.kind(),
                    sink_kind: ValueKind::Map,
                });
            }
        };
        map.insert(key.to_string(), value);
        Ok(())
    }

    /// Returns whether the key was present.
    pub(crate) fn remove_stored_key(&mut self, port: PortId, key: &str) -> Result<bool, GraphError> {
        let state = self.port_state_mut(port)?;
        if state.shape != PortShape::Keyed {
            return Err(GraphError::ShapeMismatch(state.name.clone()));
        }
        let Some(map) = state.value.as_mut().and_then(|v| v.as_map_mut()) else {
            return Ok(false);
        };
        Ok(map.shift_remove(key).is_some())
    }

    // ---- reads -----------------------------------------------------------

    /// Cached value of a port. Callers wanting a value current for pass
    /// `v` settle first, then read.
    pub fn value(&self, port: PortId) -> Result<Option<&Value>, GraphError> {
        Ok(self.port_state(port)?.value.as_ref())
    }

    /// Cached entry of a keyed port at `key`.
    pub fn value_at(&self, port: PortId, key: &str) -> Result<Option<&Value>, GraphError> {
        Ok(self.port_state(port)?.value_at(key))
    }

    pub fn version(&self, port: PortId) -> Result<Version, GraphError> {
        Ok(self.port_state(port)?.version)
    }

    pub fn is_dirty(&self, port: PortId) -> Result<bool, GraphError> {
        Ok(!self.port_state(port)?.is_coherent())
    }

    /// Currently-dirty keys of a keyed port, in drain order.
    pub fn dirty_keys(&self, port: PortId) -> Result<Vec<(Key, ChangeKind)>, GraphError> {
        let state = self.port_state(port)?;
        if !state.is_keyed() {
            return Err(GraphError::ShapeMismatch(state.name.clone()));
        }
        Ok(state.dirty.iter().map(|(k, c)| (k.clone(), *c)).collect())
    }

    pub fn node_version(&self, node: NodeId) -> Result<Version, GraphError> {
        Ok(self.node_state(node)?.version)
    }

    // ---- internal accessors ----------------------------------------------

    pub fn port_state(&self, id: PortId) -> Result<&Port, GraphError> {
        self.ports.get(&id).ok_or(GraphError::UnknownPort(id.0))
    }

    pub(crate) fn port_state_mut(&mut self, id: PortId) -> Result<&mut Port, GraphError> {
        self.ports.get_mut(&id).ok_or(GraphError::UnknownPort(id.0))
    }

    pub fn node_state(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id.0))
    }

    pub(crate) fn node_state_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id.0))
    }

    // ---- hook dispatch ---------------------------------------------------
    //
    // A behavior is taken out of the map for the duration of its call so
    // the context can hand the hook `&mut Graph` without aliasing the box.
    // A cyclic graph that re-enters the same node finds no behavior and
    // skips the hook.

    pub(crate) fn call_on_invalidate(&mut self, node: NodeId) {
        if let Some(mut behavior) = self.behaviors.remove(&node) {
            let mut ctx = NodeContext { graph: self, node };
            behavior.on_invalidate(&mut ctx);
            self.behaviors.insert(node, behavior);
        }
    }

    pub(crate) fn call_on_invalidate_key(
        &mut self,
        node: NodeId,
        port: &str,
        key: &str,
        change: ChangeKind,
    ) {
        if let Some(mut behavior) = self.behaviors.remove(&node) {
            let mut ctx = NodeContext { graph: self, node };
            behavior.on_invalidate_key(&mut ctx, port, key, change);
            self.behaviors.insert(node, behavior);
        }
    }

    pub(crate) fn call_on_settle(&mut self, node: NodeId, version: Version) -> Result<(), GraphError> {
        let Some(mut behavior) = self.behaviors.remove(&node) else {
            return Ok(());
        };
        let mut ctx = NodeContext { graph: self, node };
        let result = behavior.on_settle(&mut ctx, version);
        self.behaviors.insert(node, behavior);
        result
    }

    pub(crate) fn call_on_settle_key(
        &mut self,
        node: NodeId,
        port: &str,
        key: &str,
        change: ChangeKind,
        version: Version,
    ) -> Result<(), GraphError> {
        let Some(mut behavior) = self.behaviors.remove(&node) else {
            return Ok(());
        };
        let mut ctx = NodeContext { graph: self, node };
        let result = behavior.on_settle_key(&mut ctx, port, key, change, version);
        self.behaviors.insert(node, behavior);
        result
    }
}
