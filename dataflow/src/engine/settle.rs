//! Lazy, memoized settle: pull a port (and everything upstream of it) to a
//! requested pass version.
//!
//! Settling propagates upstream first, recomputes, then eagerly notifies
//! downstream edges that they, too, may settle. Memoization is the
//! persistent `version` field: a coherent port is never recomputed, so a
//! recompute hook runs at most once per node per pass no matter how many
//! pull paths reach it. Keyed ports drain their dirty keys in insertion
//! order before any scalar recompute.

use crate::error::GraphError;
use crate::model::node::NodeId;
use crate::model::port::{DIRTY, PortId, Version};
use crate::model::value::ChangeKind;

use super::graph::Graph;

impl Graph {
    /// Bring a port to `version`. No-op on a coherent port.
    pub fn settle(&mut self, port: PortId, version: Version) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        if state.is_coherent() {
            return Ok(());
        }
        log::trace!("settle {} '{}' to pass {}", port, state.name, version);

        // Upstream first.
        if let Some(source) = state.input {
            self.settle(source, version)?;
            // Upstream's eager downstream pass may have finished this port.
            if self.port_state(port)?.is_coherent() {
                return Ok(());
            }
        }

        self.drain_dirty_keys(port, version)?;

        // A projection mirrors its keyed parent at one key.
        if let Some((parent, key)) = self.port_state(port)?.derived_from.clone() {
            if self.port_state(parent)?.dirty.contains_key(&key) {
                self.settle_key(parent, &key, version)?;
            }
            let value = self.port_state(parent)?.value_at(&key).cloned();
            self.port_state_mut(port)?.value = value;
        }

        self.apply_default_copy(port)?;

        if let Some(node) = self.port_state(port)?.owner {
            self.settle_node(node, version)?;
            if self.port_state(port)?.is_coherent() {
                return Ok(());
            }
        }

        self.port_state_mut(port)?.version = version;

        // Eager downstream: everything below may now settle.
        let outputs = self.port_state(port)?.outputs.clone();
        for sink in outputs {
            self.settle(sink, version)?;
        }
        let projections: Vec<PortId> = self.port_state(port)?.derived.values().copied().collect();
        for projection in projections {
            self.settle(projection, version)?;
        }
        Ok(())
    }

    /// Bring one key of a keyed port to `version`. No-op when the key is
    /// not dirty.
    pub fn settle_key(&mut self, port: PortId, key: &str, version: Version) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        if !state.is_keyed() {
            return Err(GraphError::ShapeMismatch(state.name.clone()));
        }
        if !state.dirty.contains_key(key) {
            return Ok(());
        }
        log::trace!("settle {} '{}' key '{}' to pass {}", port, state.name, key, version);

        let owner = state.owner;
        let input = state.input;
        let port_name = state.name.clone();
        let pulls_node_sinks = input.is_none() && state.direction.source_capable();

        // Pull upstream for this key only.
        if let Some(source) = input {
            if self.port_state(source)?.is_keyed() {
                self.settle_key(source, key, version)?;
            } else {
                self.settle(source, version)?;
            }
        } else if pulls_node_sinks {
            if let Some(node) = owner {
                for sink in self.node_sinks(node)? {
                    if sink != port && self.port_state(sink)?.is_keyed() {
                        self.settle_key(sink, key, version)?;
                    }
                }
            }
        }

        // The dirty map only ever holds currently-invalid keys: drop the
        // entry before recomputing.
        let Some(change) = self.port_state_mut(port)?.dirty.shift_remove(key) else {
            return Ok(());
        };

        // Default per-key copy across a keyed edge.
        if let Some(source) = input {
            if self.port_state(source)?.is_keyed() {
                let upstream = self.port_state(source)?.value_at(key).cloned();
                match (change, upstream) {
                    (ChangeKind::Update, Some(value)) => {
                        self.store_key(port, key, value)?;
                    }
                    (ChangeKind::Update, None) | (ChangeKind::Remove, _) => {
                        self.remove_stored_key(port, key)?;
                    }
                }
            }
        }

        if let Some(node) = owner {
            if let Err(err) = self.call_on_settle_key(node, &port_name, key, change, version) {
                // Re-mark the key so the next pass retries the recompute.
                self.port_state_mut(port)?.dirty.insert(key.to_string(), change);
                return Err(err);
            }
        }

        // Per-key propagation reaches keyed consumers and the projection
        // for this key; scalar consumers settle on their own pull.
        let outputs = self.port_state(port)?.outputs.clone();
        for sink in outputs {
            if self.port_state(sink)?.is_keyed() {
                self.settle_key(sink, key, version)?;
            }
        }
        if let Some(projection) = self.port_state(port)?.derived.get(key).copied() {
            self.settle(projection, version)?;
        }
        Ok(())
    }

    /// Drain a keyed port's dirty set in insertion order. Recompute hooks
    /// run once per drained key.
    pub(crate) fn drain_dirty_keys(&mut self, port: PortId, version: Version) -> Result<(), GraphError> {
        loop {
            let Some(key) = self.port_state(port)?.dirty.keys().next().cloned() else {
                return Ok(());
            };
            self.settle_key(port, &key, version)?;
        }
    }

    /// Settle a node: pull every sink current, drain keyed sources, run
    /// the scalar recompute once, then release the node's sources
    /// downstream.
    pub(crate) fn settle_node(&mut self, node: NodeId, version: Version) -> Result<(), GraphError> {
        let state = self.node_state(node)?;
        if state.version >= 0 {
            return Ok(());
        }
        log::trace!("settle node {} '{}' to pass {}", node, state.label, version);

        // Marking up front memoizes the pass: every pull path that reaches
        // this node again stops here.
        self.node_state_mut(node)?.version = version;
        let result = self.settle_node_inner(node, version);
        if result.is_err() {
            // A failed recompute leaves the node dirty; the next pass
            // re-drives it. Sibling work already settled stays settled.
            self.node_state_mut(node)?.version = DIRTY;
        }
        result
    }

    fn settle_node_inner(&mut self, node: NodeId, version: Version) -> Result<(), GraphError> {
        for sink in self.node_sinks(node)? {
            self.settle(sink, version)?;
        }
        for source in self.node_sources(node)? {
            self.drain_dirty_keys(source, version)?;
        }
        self.call_on_settle(node, version)?;
        for source in self.node_sources(node)? {
            self.settle(source, version)?;
        }
        Ok(())
    }

    /// A bound scalar sink mirrors its source's cached value. Keyed-to-
    /// keyed edges move data per key in `settle_key` instead.
    fn apply_default_copy(&mut self, port: PortId) -> Result<(), GraphError> {
        let state = self.port_state(port)?;
        let Some(source) = state.input else {
            return Ok(());
        };
        if state.is_keyed() && self.port_state(source)?.is_keyed() {
            return Ok(());
        }
        let value = self.port_state(source)?.value.clone();
        self.port_state_mut(port)?.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::behavior::{NodeBehavior, NodeContext};
    use crate::model::node::PortLayout;
    use crate::model::port::PortDecl;
    use crate::model::value::{Value, ValueKind};
    use indexmap::IndexMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn relay_layout(kind: ValueKind) -> PortLayout {
        PortLayout::new()
            .with(PortDecl::sink("in", kind))
            .with(PortDecl::source("out", kind))
    }

    fn keyed_relay_layout() -> PortLayout {
        PortLayout::new()
            .with(PortDecl::sink("in", ValueKind::Map).keyed())
            .with(PortDecl::source("out", ValueKind::Map).keyed())
    }

    /// Doubles its integer input; optionally records settles.
    struct Double {
        settles: Arc<AtomicUsize>,
    }

    impl NodeBehavior for Double {
        fn on_settle(&mut self, ctx: &mut NodeContext<'_>, _version: i64) -> Result<(), GraphError> {
            self.settles.fetch_add(1, Ordering::SeqCst);
            if let Some(v) = ctx.input("in")?.and_then(|v| v.as_int()) {
                ctx.set_output("out", Value::Int(v * 2))?;
            }
            Ok(())
        }
    }

    /// Records its label on every scalar settle.
    struct Trace {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl NodeBehavior for Trace {
        fn on_settle(&mut self, ctx: &mut NodeContext<'_>, _version: i64) -> Result<(), GraphError> {
            self.order.lock().unwrap().push(self.label);
            if let Some(v) = ctx.input("in")? {
                ctx.set_output("out", v)?;
            }
            Ok(())
        }
    }

    /// Forwards per-key changes from "in" to "out", counting the keys it
    /// recomputed.
    struct KeyedRelay {
        recomputed: Arc<Mutex<Vec<String>>>,
    }

    impl NodeBehavior for KeyedRelay {
        fn on_settle_key(
            &mut self,
            ctx: &mut NodeContext<'_>,
            port: &str,
            key: &str,
            change: ChangeKind,
            _version: i64,
        ) -> Result<(), GraphError> {
            if port != "out" {
                return Ok(());
            }
            self.recomputed.lock().unwrap().push(key.to_string());
            match change {
                ChangeKind::Update => match ctx.input_at("in", key)? {
                    Some(value) => ctx.set_output_key("out", key, value)?,
                    None => ctx.remove_output_key("out", key)?,
                },
                ChangeKind::Remove => ctx.remove_output_key("out", key)?,
            }
            Ok(())
        }
    }

    /// Rewrites its whole keyed output from its scalar input.
    struct Explode;

    impl NodeBehavior for Explode {
        fn on_settle(&mut self, ctx: &mut NodeContext<'_>, _version: i64) -> Result<(), GraphError> {
            let n = ctx.input("in")?.and_then(|v| v.as_int()).unwrap_or(0);
            let mut out = IndexMap::new();
            out.insert("value".to_string(), Value::Int(n));
            if n < 10 {
                out.insert("small".to_string(), Value::Bool(true));
            }
            ctx.set_output("out", Value::Map(out))
        }
    }

    #[test]
    fn test_whole_map_output_refreshes_keyed_sink() {
        init_logs();
        let mut graph = Graph::new();
        let s = graph.add_port(PortDecl::source("s", ValueKind::Int));
        let n = graph.add_node(
            "map.explode",
            PortLayout::new()
                .with(PortDecl::sink("in", ValueKind::Int))
                .with(PortDecl::source("out", ValueKind::Map).keyed()),
        );
        graph.set_behavior(n, Box::new(Explode));
        graph.bind_sink(n, "in", s).unwrap();
        let out = graph.source(n, "out").unwrap();
        let k = graph.add_port(PortDecl::sink("k", ValueKind::Map).keyed());
        graph.bind(out, k).unwrap();

        graph.set_value(s, Value::Int(7)).unwrap();
        graph.settle(k, 1).unwrap();
        assert!(!graph.is_dirty(k).unwrap());
        assert_eq!(graph.value_at(k, "value").unwrap(), Some(&Value::Int(7)));
        assert_eq!(graph.value_at(k, "small").unwrap(), Some(&Value::Bool(true)));

        // A key dropped by the rewrite is removed downstream too.
        graph.set_value(s, Value::Int(12)).unwrap();
        graph.settle(k, 2).unwrap();
        assert!(!graph.is_dirty(k).unwrap());
        assert_eq!(graph.value_at(k, "value").unwrap(), Some(&Value::Int(12)));
        assert_eq!(graph.value_at(k, "small").unwrap(), None);
    }

    #[test]
    fn test_scalar_double_scenario() {
        init_logs();
        let mut graph = Graph::new();
        let s = graph.add_port(PortDecl::source("s", ValueKind::Int));
        let d = graph.add_node("math.double", relay_layout(ValueKind::Int));
        let settles = Arc::new(AtomicUsize::new(0));
        graph.set_behavior(d, Box::new(Double { settles: settles.clone() }));
        graph.bind_sink(d, "in", s).unwrap();
        let out = graph.source(d, "out").unwrap();

        graph.set_value(s, Value::Int(5)).unwrap();
        assert!(graph.is_dirty(out).unwrap());

        graph.settle(out, 1).unwrap();
        assert_eq!(graph.value(out).unwrap(), Some(&Value::Int(10)));
        assert_eq!(graph.version(s).unwrap(), 1);
        assert_eq!(graph.version(out).unwrap(), 1);
        assert_eq!(settles.load(Ordering::SeqCst), 1);

        // Coherent: settling again recomputes nothing.
        graph.settle(out, 1).unwrap();
        assert_eq!(settles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_settle_is_memoized_across_fanout() {
        init_logs();
        let mut graph = Graph::new();
        let s = graph.add_port(PortDecl::source("s", ValueKind::Int));
        let counters: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        // Diamond: s -> a -> c, s -> b -> c.
        let a = graph.add_node("a", relay_layout(ValueKind::Int));
        let b = graph.add_node("b", relay_layout(ValueKind::Int));
        graph.set_behavior(a, Box::new(Double { settles: counters[0].clone() }));
        graph.set_behavior(b, Box::new(Double { settles: counters[1].clone() }));
        let c_layout = PortLayout::new()
            .with(PortDecl::sink("in", ValueKind::Int))
            .with(PortDecl::sink("in2", ValueKind::Int))
            .with(PortDecl::source("out", ValueKind::Int));
        let c = graph.add_node("c", c_layout);
        graph.set_behavior(c, Box::new(Double { settles: counters[2].clone() }));

        graph.bind_sink(a, "in", s).unwrap();
        graph.bind_sink(b, "in", s).unwrap();
        graph.bind_by_name(a, "out", c, "in").unwrap();
        graph.bind_by_name(b, "out", c, "in2").unwrap();
        let c_out = graph.source(c, "out").unwrap();

        graph.set_value(s, Value::Int(3)).unwrap();
        graph.settle(c_out, 1).unwrap();

        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        // c doubles a's doubled value (first sink wins the "in" read).
        assert_eq!(graph.value(c_out).unwrap(), Some(&Value::Int(12)));
    }

    #[test]
    fn test_chain_settles_in_topological_order() {
        init_logs();
        let mut graph = Graph::new();
        let s = graph.add_port(PortDecl::source("s", ValueKind::Int));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut prev = s;
        for label in ["a", "b", "c"] {
            let n = graph.add_node(label, relay_layout(ValueKind::Int));
            graph.set_behavior(n, Box::new(Trace { label, order: order.clone() }));
            graph.bind_sink(n, "in", prev).unwrap();
            prev = graph.source(n, "out").unwrap();
        }

        graph.set_value(s, Value::Int(1)).unwrap();
        graph.settle(prev, 7).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(graph.version(s).unwrap(), 7);
        assert_eq!(graph.version(prev).unwrap(), 7);
        assert_eq!(graph.value(prev).unwrap(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_pass_through_chain_default_copy() {
        // Free-standing pass-through ports forward without any behavior.
        let mut graph = Graph::new();
        let s = graph.add_port(PortDecl::source("s", ValueKind::Text));
        let relay = graph.add_port(PortDecl::inout("relay", ValueKind::Text));
        let probe = graph.add_port(PortDecl::sink("probe", ValueKind::Text));
        graph.bind(s, relay).unwrap();
        graph.bind(relay, probe).unwrap();

        graph.set_value(s, Value::Text("hello".into())).unwrap();
        graph.settle(probe, 1).unwrap();
        assert_eq!(graph.value(probe).unwrap(), Some(&Value::Text("hello".into())));
        assert_eq!(graph.version(relay).unwrap(), 1);
    }

    #[test]
    fn test_keyed_root_scenario() {
        init_logs();
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        graph.set_key(m, "x", Value::Int(1)).unwrap();
        graph.set_key(m, "y", Value::Int(2)).unwrap();
        graph.settle(m, 1).unwrap();
        assert!(!graph.is_dirty(m).unwrap());

        graph.set_key(m, "x", Value::Int(5)).unwrap();
        assert_eq!(
            graph.dirty_keys(m).unwrap(),
            vec![("x".to_string(), ChangeKind::Update)]
        );
        assert_eq!(graph.version(m).unwrap(), DIRTY);

        graph.settle_key(m, "x", 2).unwrap();
        assert!(graph.dirty_keys(m).unwrap().is_empty());
        assert_eq!(graph.value_at(m, "x").unwrap(), Some(&Value::Int(5)));
        assert_eq!(graph.value_at(m, "y").unwrap(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_per_key_isolation() {
        init_logs();
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        let relay = graph.add_node("relay", keyed_relay_layout());
        let recomputed = Arc::new(Mutex::new(Vec::new()));
        graph.set_behavior(relay, Box::new(KeyedRelay { recomputed: recomputed.clone() }));
        graph.bind_sink(relay, "in", m).unwrap();
        let out = graph.source(relay, "out").unwrap();

        graph.set_key(m, "a", Value::Int(1)).unwrap();
        graph.set_key(m, "b", Value::Int(2)).unwrap();
        graph.settle(out, 1).unwrap();
        recomputed.lock().unwrap().clear();

        graph.set_key(m, "a", Value::Int(10)).unwrap();
        graph.settle(out, 2).unwrap();

        assert_eq!(*recomputed.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(graph.value_at(out, "a").unwrap(), Some(&Value::Int(10)));
        assert_eq!(graph.value_at(out, "b").unwrap(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_key_removal_flows_downstream() {
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        let relay = graph.add_node("relay", keyed_relay_layout());
        graph.set_behavior(relay, Box::new(KeyedRelay { recomputed: Arc::new(Mutex::new(Vec::new())) }));
        graph.bind_sink(relay, "in", m).unwrap();
        let out = graph.source(relay, "out").unwrap();

        graph.set_key(m, "gone", Value::Int(9)).unwrap();
        graph.settle(out, 1).unwrap();
        assert_eq!(graph.value_at(out, "gone").unwrap(), Some(&Value::Int(9)));

        graph.remove_key(m, "gone").unwrap();
        graph.settle(out, 2).unwrap();
        assert_eq!(graph.value_at(out, "gone").unwrap(), None);
        assert!(graph.dirty_keys(out).unwrap().is_empty());
    }

    #[test]
    fn test_keyed_chain_drains_deterministically() {
        // Keys drain in insertion order, upstream before downstream.
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        let sink = graph.add_port(PortDecl::sink("copy", ValueKind::Map).keyed());
        graph.bind(m, sink).unwrap();

        let mut seed = IndexMap::new();
        seed.insert("one".to_string(), Value::Int(1));
        seed.insert("two".to_string(), Value::Int(2));
        seed.insert("three".to_string(), Value::Int(3));
        graph.set_value(m, Value::Map(seed)).unwrap();

        let pending: Vec<String> = graph
            .dirty_keys(sink)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(pending, ["one", "two", "three"]);

        graph.settle(sink, 1).unwrap();
        assert!(graph.dirty_keys(sink).unwrap().is_empty());
        let map = graph.value(sink).unwrap().unwrap().as_map().unwrap().clone();
        let keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, ["one", "two", "three"]);
    }

    #[test]
    fn test_derived_port_tracks_one_key() {
        init_logs();
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        graph.set_key(m, "x", Value::Int(1)).unwrap();
        graph.set_key(m, "y", Value::Int(2)).unwrap();

        let dx = graph.derived(m, "x").unwrap();
        let probe = graph.add_port(PortDecl::sink("probe", ValueKind::Any));
        graph.bind(dx, probe).unwrap();

        graph.settle(probe, 1).unwrap();
        assert_eq!(graph.value(probe).unwrap(), Some(&Value::Int(1)));

        graph.set_key(m, "x", Value::Int(42)).unwrap();
        assert!(graph.is_dirty(dx).unwrap());
        assert!(graph.is_dirty(probe).unwrap());

        // Settling just the projection does per-key work only.
        graph.settle(dx, 2).unwrap();
        assert_eq!(graph.value(dx).unwrap(), Some(&Value::Int(42)));
        assert_eq!(graph.value(probe).unwrap(), Some(&Value::Int(42)));
        // "y" was never drained by the projection pull.
        assert_eq!(graph.value_at(m, "y").unwrap(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_derived_port_sees_removal() {
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        graph.set_key(m, "x", Value::Int(1)).unwrap();
        let dx = graph.derived(m, "x").unwrap();
        graph.settle(dx, 1).unwrap();
        assert_eq!(graph.value(dx).unwrap(), Some(&Value::Int(1)));

        graph.remove_key(m, "x").unwrap();
        graph.settle(dx, 2).unwrap();
        assert_eq!(graph.value(dx).unwrap(), None);
    }

    /// Fails its first recompute, succeeds afterwards.
    struct FailOnce {
        failed: bool,
    }

    impl NodeBehavior for FailOnce {
        fn on_settle(&mut self, ctx: &mut NodeContext<'_>, _version: i64) -> Result<(), GraphError> {
            if !self.failed {
                self.failed = true;
                return Err(GraphError::Recompute("transient".into()));
            }
            if let Some(v) = ctx.input("in")? {
                ctx.set_output("out", v)?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_recompute_stays_dirty_and_retries() {
        init_logs();
        let mut graph = Graph::new();
        let s = graph.add_port(PortDecl::source("s", ValueKind::Int));
        let n = graph.add_node("flaky", relay_layout(ValueKind::Int));
        graph.set_behavior(n, Box::new(FailOnce { failed: false }));
        graph.bind_sink(n, "in", s).unwrap();
        let out = graph.source(n, "out").unwrap();

        graph.set_value(s, Value::Int(7)).unwrap();
        assert!(matches!(graph.settle(out, 1), Err(GraphError::Recompute(_))));
        assert!(graph.is_dirty(out).unwrap());
        assert_eq!(graph.node_version(n).unwrap(), DIRTY);
        // The pulled source settled and stays settled.
        assert_eq!(graph.version(s).unwrap(), 1);

        // Re-driving the settle on a later pass retries the recompute.
        graph.settle(out, 2).unwrap();
        assert_eq!(graph.value(out).unwrap(), Some(&Value::Int(7)));
        assert_eq!(graph.version(out).unwrap(), 2);
    }

    /// Keyed aggregate: maintains a running sum of "items" by delta.
    struct Sum {
        seen: IndexMap<String, i64>,
        total: i64,
        full_scans: Arc<AtomicUsize>,
    }

    impl NodeBehavior for Sum {
        fn on_settle_key(
            &mut self,
            ctx: &mut NodeContext<'_>,
            port: &str,
            key: &str,
            change: ChangeKind,
            _version: i64,
        ) -> Result<(), GraphError> {
            if port != "items" {
                return Ok(());
            }
            let old = self.seen.shift_remove(key).unwrap_or(0);
            let new = match change {
                ChangeKind::Remove => 0,
                ChangeKind::Update => ctx
                    .input_at("items", key)?
                    .and_then(|v| v.as_int())
                    .unwrap_or(0),
            };
            self.total += new - old;
            if new != 0 {
                self.seen.insert(key.to_string(), new);
            }
            Ok(())
        }

        fn on_settle(&mut self, ctx: &mut NodeContext<'_>, _version: i64) -> Result<(), GraphError> {
            self.full_scans.fetch_add(1, Ordering::SeqCst);
            ctx.set_output("total", Value::Int(self.total))
        }
    }

    #[test]
    fn test_keyed_aggregate_adjusts_by_delta() {
        init_logs();
        let mut graph = Graph::new();
        let m = graph.add_port(PortDecl::source("m", ValueKind::Map).keyed());
        let layout = PortLayout::new()
            .with(PortDecl::sink("items", ValueKind::Map).keyed())
            .with(PortDecl::source("total", ValueKind::Int));
        let n = graph.add_node("sum", layout);
        let full_scans = Arc::new(AtomicUsize::new(0));
        graph.set_behavior(
            n,
            Box::new(Sum { seen: IndexMap::new(), total: 0, full_scans: full_scans.clone() }),
        );
        graph.bind_sink(n, "items", m).unwrap();
        let total = graph.source(n, "total").unwrap();

        graph.set_key(m, "a", Value::Int(2)).unwrap();
        graph.set_key(m, "b", Value::Int(3)).unwrap();
        graph.settle(total, 1).unwrap();
        assert_eq!(graph.value(total).unwrap(), Some(&Value::Int(5)));

        graph.set_key(m, "a", Value::Int(7)).unwrap();
        graph.settle(total, 2).unwrap();
        assert_eq!(graph.value(total).unwrap(), Some(&Value::Int(10)));

        graph.remove_key(m, "b").unwrap();
        graph.settle(total, 3).unwrap();
        assert_eq!(graph.value(total).unwrap(), Some(&Value::Int(7)));

        // One scalar recompute per pass, never more.
        assert_eq!(full_scans.load(Ordering::SeqCst), 3);
    }
}
