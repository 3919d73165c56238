use thiserror::Error;

use crate::model::value::ValueKind;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("wiring error: {0}")]
    Wiring(String),
    #[error("type mismatch: source carries {source_kind:?}, sink expects {sink_kind:?}")]
    TypeMismatch {
        source_kind: ValueKind,
        sink_kind: ValueKind,
    },
    #[error("recompute failed: {0}")]
    Recompute(String),
    #[error("unknown node: {0}")]
    UnknownNode(uuid::Uuid),
    #[error("unknown port: {0}")]
    UnknownPort(uuid::Uuid),
    #[error("node has no declared port named '{0}'")]
    UndeclaredPort(String),
    #[error("keyed operation on scalar port '{0}'")]
    ShapeMismatch(String),
}
