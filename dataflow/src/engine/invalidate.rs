//! Eager downstream invalidation.
//!
//! An invalidation wave starts at a mutated root and pushes "your cached
//! value is stale" through every bound edge. Waves are idempotent: a port
//! that is already dirty stops the recursion, so each edge is traversed at
//! most once per wave and a wave costs O(edges). The per-key variant
//! dedupes on the stored [`ChangeKind`] instead of the scalar version.

use crate::error::GraphError;
use crate::model::node::NodeId;
use crate::model::port::{DIRTY, PortId};
use crate::model::value::ChangeKind;

use super::graph::Graph;

impl Graph {
    /// Mark a port dirty and propagate downstream. No-op when the port is
    /// already dirty.
    pub fn invalidate(&mut self, port: PortId) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        if !state.is_coherent() {
            return Ok(());
        }
        log::trace!("invalidate {} '{}'", port, state.name);

        let owner = state.owner;
        let crosses_node = state.direction.sink_capable();
        let outputs = state.outputs.clone();
        let derived: Vec<PortId> = state.derived.values().copied().collect();
        self.port_state_mut(port)?.version = DIRTY;

        if let Some(node) = owner {
            self.mark_node_dirty(node, true);
            if crosses_node {
                // A stale input makes every output of the node stale.
                for source in self.node_sources(node)? {
                    if source != port {
                        self.invalidate(source)?;
                    }
                }
            }
        }

        for sink in outputs {
            self.invalidate(sink)?;
        }
        for projection in derived {
            self.invalidate(projection)?;
        }
        Ok(())
    }

    /// Mark one key of a keyed port dirty and propagate downstream.
    ///
    /// No-op when the key is already dirty with the same change. The
    /// scalar version is forced dirty as well so a later scalar settle
    /// knows there is pending per-key work. Non-keyed consumers get a
    /// conservative whole-port invalidation.
    pub fn invalidate_key(
        &mut self,
        port: PortId,
        key: &str,
        change: ChangeKind,
    ) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        if !state.is_keyed() {
            return Err(GraphError::ShapeMismatch(state.name.clone()));
        }
        if state.dirty.get(key) == Some(&change) {
            return Ok(());
        }
        log::trace!("invalidate {} '{}' key '{}' ({:?})", port, state.name, key, change);

        let owner = state.owner;
        let crosses_node = state.direction.sink_capable();
        let port_name = state.name.clone();
        let outputs = state.outputs.clone();
        let projection = state.derived.get(key).copied();

        let state = self.port_state_mut(port)?;
        state.dirty.insert(key.to_string(), change);
        state.version = DIRTY;

        if let Some(node) = owner {
            self.mark_node_dirty(node, false);
            self.call_on_invalidate_key(node, &port_name, key, change);
            if crosses_node {
                for source in self.node_sources(node)? {
                    if source == port {
                        continue;
                    }
                    if self.port_state(source)?.is_keyed() {
                        self.invalidate_key(source, key, change)?;
                    } else {
                        self.invalidate(source)?;
                    }
                }
            }
        }

        for sink in outputs {
            if self.port_state(sink)?.is_keyed() {
                self.invalidate_key(sink, key, change)?;
            } else {
                self.invalidate(sink)?;
            }
        }
        if let Some(projection) = projection {
            self.invalidate(projection)?;
        }
        Ok(())
    }

    /// Propagate a per-key change produced *during* a settle (a scalar
    /// recompute emitting keyed deltas) to downstream edges only; the
    /// emitting port itself was just recomputed and stays clean.
    pub(crate) fn propagate_key_downstream(
        &mut self,
        port: PortId,
        key: &str,
        change: ChangeKind,
    ) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        let outputs = state.outputs.clone();
        let projection = state.derived.get(key).copied();

        for sink in outputs {
            if self.port_state(sink)?.is_keyed() {
                self.invalidate_key(sink, key, change)?;
            } else {
                self.invalidate(sink)?;
            }
        }
        if let Some(projection) = projection {
            self.invalidate(projection)?;
        }
        Ok(())
    }

    /// Force the node dirty; `with_hook` runs `on_invalidate` on the
    /// coherent to dirty transition (per-key invalidation skips the scalar
    /// hook; `on_invalidate_key` is the notification there).
    fn mark_node_dirty(&mut self, node: NodeId, with_hook: bool) {
        let Some(state) = self.nodes.get_mut(&node) else {
            return;
        };
        if state.version < 0 {
            return;
        }
        state.version = DIRTY;
        if with_hook {
            self.call_on_invalidate(node);
        }
    }

    pub(crate) fn node_sources(&self, node: NodeId) -> Result<Vec<PortId>, GraphError> {
        Ok(self.node_state(node)?.sources.values().copied().collect())
    }

    pub(crate) fn node_sinks(&self, node: NodeId) -> Result<Vec<PortId>, GraphError> {
        Ok(self.node_state(node)?.sinks.values().copied().collect())
    }
}
