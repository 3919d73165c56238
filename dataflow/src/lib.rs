//! Incremental recomputation over a graph of typed ports.
//!
//! A [`Graph`] holds source, sink and pass-through ports wired into an
//! acyclic dependency graph. Mutations push an eager, idempotent
//! *invalidate* wave downstream; readers later *settle* the port they
//! care about to a pass version, which pulls upstream, recomputes exactly
//! the dirty parts (down to individual keys of map-shaped values) and
//! releases downstream. Recompute logic plugs in per node through
//! [`NodeBehavior`].
//!
//! One graph is single-threaded: every mutating call takes `&mut Graph`.
//! Hosts that want concurrency run independent graphs, one per
//! serialization boundary.

pub mod engine;
pub mod error;
pub mod model;

pub use engine::behavior::{NodeBehavior, NodeContext};
pub use engine::graph::Graph;
pub use error::GraphError;
pub use model::node::{NodeId, PortLayout};
pub use model::port::{DIRTY, Port, PortDecl, PortDirection, PortId, PortShape, Version};
pub use model::value::{ChangeKind, Key, Value, ValueKind};
