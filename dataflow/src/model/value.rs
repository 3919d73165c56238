//! Value vocabulary carried on ports.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Key of a map-shaped value. Keyed ports index their state by this.
pub type Key = String;

/// A value flowing through the graph.
///
/// Deliberately small: hosts with richer vocabularies wrap their payloads
/// in `Text` or `List`, or extend at the edges. `Map` uses an insertion-
/// ordered map so every observable iteration order is deterministic.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(IndexMap<Key, Value>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<Key, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut IndexMap<Key, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Entry of a map-shaped value, `None` for absent keys or non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<IndexMap<Key, Value>> for Value {
    fn from(m: IndexMap<Key, Value>) -> Self {
        Value::Map(m)
    }
}

/// Data type of a port (socket type). `Any` accepts every kind.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    Float,
    Text,
    List,
    Map,
}

impl ValueKind {
    /// Whether a value of `self` may flow into a port expecting `other`.
    pub fn compatible(self, other: ValueKind) -> bool {
        self == ValueKind::Any || other == ValueKind::Any || self == other
    }
}

/// Why a key was marked dirty. Carried through the per-key invalidation
/// chain so a recompute can adjust an aggregate by delta instead of
/// re-scanning the whole map.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Update,
    Remove,
}
