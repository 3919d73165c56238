//! Recompute hooks, the only surface a concrete node implements.
//!
//! All propagation and memoization bookkeeping lives in the engine; a
//! behavior just reads its sink values and writes its source values when
//! asked. Hooks run synchronously inside an in-flight wave and must not
//! rewire the graph.

use crate::error::GraphError;
use crate::model::node::NodeId;
use crate::model::port::Version;
use crate::model::value::{ChangeKind, Key, Value, ValueKind};

use super::graph::Graph;

/// Hook set invoked by the invalidate/settle protocol.
///
/// The keyed hooks carry the declared name of the owned port that fired,
/// since one node may own several keyed ports. Settle hooks are fallible;
/// a returned error leaves the port and node dirty so the next pass
/// retries (already-propagated sibling work is not rolled back).
pub trait NodeBehavior: Send {
    /// The node transitioned coherent → dirty.
    fn on_invalidate(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Scalar recompute. Runs at most once per node per pass, after every
    /// sink has been pulled current and every keyed port drained.
    fn on_settle(&mut self, _ctx: &mut NodeContext<'_>, _version: Version) -> Result<(), GraphError> {
        Ok(())
    }

    /// A key of an owned keyed port was marked dirty.
    fn on_invalidate_key(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        _port: &str,
        _key: &str,
        _change: ChangeKind,
    ) {
    }

    /// Per-key recompute. The upstream value for `key` is already current;
    /// `change` is the reason carried through the invalidation chain, so an
    /// aggregate can adjust by delta instead of re-scanning.
    ///
    /// Only the node's keyed sinks are pulled for the key before this
    /// runs. A scalar sink read from here may still be stale; it is
    /// current by the time [`NodeBehavior::on_settle`] runs.
    fn on_settle_key(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        _port: &str,
        _key: &str,
        _change: ChangeKind,
        _version: Version,
    ) -> Result<(), GraphError> {
        Ok(())
    }
}

/// Handle a hook uses to reach its own node's ports.
///
/// Reads return clones of cached values; per-key accessors avoid cloning
/// whole maps. Output writes update the cached value directly; downstream
/// ports were already marked dirty by the invalidation wave, except for
/// per-key writes, which mark their keys downstream themselves so scalar
/// recomputes can emit fine-grained deltas.
pub struct NodeContext<'a> {
    pub(crate) graph: &'a mut Graph,
    pub(crate) node: NodeId,
}

impl NodeContext<'_> {
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Cached value of the named sink.
    pub fn input(&mut self, name: &str) -> Result<Option<Value>, GraphError> {
        let id = self.graph.sink(self.node, name)?;
        Ok(self.graph.port_state(id)?.value.clone())
    }

    /// Entry of a keyed sink's cached map.
    pub fn input_at(&mut self, name: &str, key: &str) -> Result<Option<Value>, GraphError> {
        let id = self.graph.sink(self.node, name)?;
        Ok(self.graph.port_state(id)?.value_at(key).cloned())
    }

    /// Previously cached value of the named source (for delta updates).
    pub fn output(&mut self, name: &str) -> Result<Option<Value>, GraphError> {
        let id = self.graph.source(self.node, name)?;
        Ok(self.graph.port_state(id)?.value.clone())
    }

    pub fn output_at(&mut self, name: &str, key: &str) -> Result<Option<Value>, GraphError> {
        let id = self.graph.source(self.node, name)?;
        Ok(self.graph.port_state(id)?.value_at(key).cloned())
    }

    /// Write the named source's value.
    ///
    /// A whole-map write to a keyed source is diffed against the cached
    /// map and each difference flows downstream per key, the same way
    /// [`Graph::set_value`] handles a keyed root, so downstream keyed
    /// sinks never settle over a stale cache.
    pub fn set_output(&mut self, name: &str, value: Value) -> Result<(), GraphError> {
        let id = self.graph.source(self.node, name)?;
        let port = self.graph.port_state(id)?;
        if !value.kind().compatible(port.kind) {
            return Err(GraphError::TypeMismatch {
                source_kind: value.kind(),
                sink_kind: port.kind,
            });
        }

        if port.is_keyed() {
            let source_kind = value.kind();
            let Value::Map(new) = value else {
                return Err(GraphError::TypeMismatch {
                    source_kind,
                    sink_kind: ValueKind::Map,
                });
            };
            let old: Vec<Key> = port
                .value
                .as_ref()
                .and_then(|v| v.as_map())
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            for key in old {
                if !new.contains_key(&key) {
                    self.remove_output_key(name, &key)?;
                }
            }
            for (key, entry) in new {
                if self.graph.port_state(id)?.value_at(&key) != Some(&entry) {
                    self.graph.store_key(id, &key, entry)?;
                    self.graph.propagate_key_downstream(id, &key, ChangeKind::Update)?;
                }
            }
            return Ok(());
        }

        self.graph.port_state_mut(id)?.value = Some(value);
        Ok(())
    }

    /// Write one key of a keyed source and mark that key dirty downstream.
    pub fn set_output_key(&mut self, name: &str, key: &str, value: Value) -> Result<(), GraphError> {
        let id = self.graph.source(self.node, name)?;
        self.graph.store_key(id, key, value)?;
        self.graph.propagate_key_downstream(id, key, ChangeKind::Update)
    }

    /// Remove one key of a keyed source and mark the removal downstream.
    pub fn remove_output_key(&mut self, name: &str, key: &str) -> Result<(), GraphError> {
        let id = self.graph.source(self.node, name)?;
        if self.graph.remove_stored_key(id, key)? {
            self.graph.propagate_key_downstream(id, key, ChangeKind::Remove)?;
        }
        Ok(())
    }

    /// Dirty reasons of a keyed sink that have not been drained yet.
    pub fn pending_keys(&mut self, name: &str) -> Result<Vec<(Key, ChangeKind)>, GraphError> {
        let id = self.graph.sink(self.node, name)?;
        let port = self.graph.port_state(id)?;
        Ok(port.dirty.iter().map(|(k, c)| (k.clone(), *c)).collect())
    }
}
