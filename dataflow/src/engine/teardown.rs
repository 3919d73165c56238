//! Graph teardown: releasing edges without yanking values out from under
//! live observers.
//!
//! Inputs are released only from ports nothing depends on any more (no
//! outputs, no live projections), and the release walks upstream through
//! sources that become orphaned. Output teardown goes the other way:
//! every downstream sink is unbound and its own outputs torn down
//! transitively. The output sweep is the one place cached derived
//! projection ports are evicted.

use crate::error::GraphError;
use crate::model::node::NodeId;
use crate::model::port::PortId;

use super::graph::Graph;

impl Graph {
    /// Release the port's input edge, provided nothing downstream still
    /// depends on this port; then release now-orphaned upstream edges
    /// transitively. A port that still has outputs or live projections is
    /// left untouched.
    pub fn disconnect_inputs(&mut self, port: PortId) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        if !state.outputs.is_empty() || !state.derived.is_empty() {
            log::debug!("keep inputs of {port}: still observed");
            return Ok(());
        }
        let Some(source) = state.input else {
            return Ok(());
        };
        self.unbind(port)?;

        let src = self.port_state(source)?;
        if src.outputs.is_empty() && src.derived.is_empty() {
            match src.owner {
                Some(node) => self.disconnect_node_inputs(node)?,
                None => self.disconnect_inputs(source)?,
            }
        }
        Ok(())
    }

    /// Release every input edge of a node whose sources are all orphaned.
    /// A node still observed through any source keeps all of its inputs.
    pub fn disconnect_node_inputs(&mut self, node: NodeId) -> Result<(), GraphError> {
        for source in self.node_sources(node)? {
            let state = self.port_state(source)?;
            if !state.outputs.is_empty() || !state.derived.is_empty() {
                return Ok(());
            }
        }
        for sink in self.node_sinks(node)? {
            self.disconnect_inputs(sink)?;
        }
        Ok(())
    }

    /// Tear down every output edge of the port, transitively continuing
    /// through each downstream sink's own outputs, and evict the port's
    /// derived projections.
    pub fn disconnect_outputs(&mut self, port: PortId) -> Result<(), GraphError> {
        let outputs = std::mem::take(&mut self.port_state_mut(port)?.outputs);
        for sink in &outputs {
            log::debug!("tear down {port} -> {sink}");
            self.port_state_mut(*sink)?.input = None;
            match self.port_state(*sink)?.owner {
                Some(node) => self.disconnect_node_outputs(node)?,
                None => self.disconnect_outputs(*sink)?,
            }
        }

        let projections: Vec<PortId> = {
            let state = self.port_state_mut(port)?;
            state.derived.drain(..).map(|(_, id)| id).collect()
        };
        for projection in projections {
            self.disconnect_outputs(projection)?;
            self.ports.shift_remove(&projection);
        }
        Ok(())
    }

    /// Tear down the output edges of every source port of a node.
    pub fn disconnect_node_outputs(&mut self, node: NodeId) -> Result<(), GraphError> {
        for source in self.node_sources(node)? {
            self.disconnect_outputs(source)?;
        }
        Ok(())
    }

    /// Destroy a node: sweep its downstream edges, release its inputs,
    /// drop its ports and behavior.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.disconnect_node_outputs(node)?;
        for sink in self.node_sinks(node)? {
            self.unbind(sink)?;
        }

        let state = self
            .nodes
            .shift_remove(&node)
            .ok_or(GraphError::UnknownNode(node.0))?;
        log::debug!("remove node {} '{}'", node, state.label);
        for id in state.sinks.values().chain(state.sources.values()) {
            self.ports.shift_remove(id);
        }
        self.behaviors.remove(&node);
        Ok(())
    }
}
