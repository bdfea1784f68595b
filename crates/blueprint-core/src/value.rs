//! Value model
//!
//! Script-visible values. A `Deferred` stands in for the not-yet-produced
//! result of a plan node and may appear anywhere another value may appear,
//! including nested inside containers and as an argument to any intrinsic.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ScriptError;
use crate::node::NodeId;

/// Map keys are restricted to strings and integers so that maps stay
/// orderable and encodable in plan files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MapKey {
    Int(i64),
    Str(String),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int(n) => write!(f, "{}", n),
            MapKey::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// The tagged value tree shared by the plan builder and the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<MapKey, Value>),
    Struct(BTreeMap<String, Value>),
    /// Reference to a plan node whose result has not been produced yet.
    Deferred(NodeId),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Deferred(_) => "deferred",
        }
    }

    /// Build a struct value from field/value pairs.
    pub fn record(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Value::Struct(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Deferred(_))
    }

    pub fn as_deferred(&self) -> Option<NodeId> {
        match self {
            Value::Deferred(id) => Some(*id),
            _ => None,
        }
    }

    /// True when a `Deferred` occurs anywhere in this value tree.
    pub fn contains_deferred(&self) -> bool {
        match self {
            Value::Deferred(_) => true,
            Value::List(items) => items.iter().any(Value::contains_deferred),
            Value::Map(entries) => entries.values().any(Value::contains_deferred),
            Value::Struct(fields) => fields.values().any(Value::contains_deferred),
            _ => false,
        }
    }

    /// Collect every referenced node id, in encounter order.
    pub fn collect_deferred(&self, out: &mut Vec<NodeId>) {
        match self {
            Value::Deferred(id) => out.push(*id),
            Value::List(items) => {
                for item in items {
                    item.collect_deferred(out);
                }
            }
            Value::Map(entries) => {
                for value in entries.values() {
                    value.collect_deferred(out);
                }
            }
            Value::Struct(fields) => {
                for value in fields.values() {
                    value.collect_deferred(out);
                }
            }
            _ => {}
        }
    }

    /// Replace every `Deferred` in the tree using `lookup`.
    ///
    /// The executor calls this with the producing node's result once all
    /// data dependencies are terminal.
    pub fn resolve(&self, lookup: &impl Fn(NodeId) -> Value) -> Value {
        match self {
            Value::Deferred(id) => lookup(*id),
            Value::List(items) => Value::List(items.iter().map(|v| v.resolve(lookup)).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                    .collect(),
            ),
            Value::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Truthiness in the Python sense.
    ///
    /// Branching on a deferred is a planning-time error: the value does not
    /// exist yet, so there is nothing to branch on.
    pub fn truthy(&self) -> Result<bool, ScriptError> {
        match self {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::String(s) => Ok(!s.is_empty()),
            Value::Bytes(b) => Ok(!b.is_empty()),
            Value::List(items) => Ok(!items.is_empty()),
            Value::Map(entries) => Ok(!entries.is_empty()),
            Value::Struct(fields) => Ok(!fields.is_empty()),
            Value::Deferred(id) => Err(ScriptError::DeferredBranch { node: *id }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view used by arithmetic and timers (`Int` widens to `Float`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert to a JSON value. Bytes become arrays of byte ints; integer
    /// map keys become their decimal strings. Deferred values have no JSON
    /// form and yield `None`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Int(n) => Some(serde_json::Value::Number((*n).into())),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Bytes(b) => Some(serde_json::Value::Array(
                b.iter().map(|byte| (*byte as i64).into()).collect(),
            )),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (key, value) in entries {
                    let key = match key {
                        MapKey::Str(s) => s.clone(),
                        MapKey::Int(n) => n.to_string(),
                    };
                    object.insert(key, value.to_json()?);
                }
                Some(serde_json::Value::Object(object))
            }
            Value::Struct(fields) => {
                let mut object = serde_json::Map::new();
                for (key, value) in fields {
                    object.insert(key.clone(), value.to_json()?);
                }
                Some(serde_json::Value::Object(object))
            }
            Value::Deferred(_) => None,
        }
    }

    /// Convert from a JSON value. Objects become maps with string keys.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(object) => Value::Map(
                object
                    .iter()
                    .map(|(k, v)| (MapKey::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<bytes len={}>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.quoted())?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value.quoted())?;
                }
                write!(f, "}}")
            }
            Value::Struct(fields) => {
                write!(f, "struct(")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", key, value.quoted())?;
                }
                write!(f, ")")
            }
            Value::Deferred(id) => write!(f, "<deferred {}>", id),
        }
    }
}

impl Value {
    /// Container-element rendering: strings are quoted, everything else
    /// renders as `Display`.
    fn quoted(&self) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_is_opaque_to_truthiness() {
        let value = Value::Deferred(NodeId(3));
        match value.truthy() {
            Err(ScriptError::DeferredBranch { node }) => assert_eq!(node, NodeId(3)),
            other => panic!("expected DeferredBranch, got {:?}", other),
        }
    }

    #[test]
    fn test_collect_deferred_walks_nested_containers() {
        let value = Value::List(vec![
            Value::Int(1),
            Value::Map(
                [(MapKey::Str("inner".into()), Value::Deferred(NodeId(7)))]
                    .into_iter()
                    .collect(),
            ),
            Value::Struct(
                [("field".to_string(), Value::Deferred(NodeId(2)))]
                    .into_iter()
                    .collect(),
            ),
        ]);

        let mut refs = Vec::new();
        value.collect_deferred(&mut refs);
        assert_eq!(refs, vec![NodeId(7), NodeId(2)]);
        assert!(value.contains_deferred());
    }

    #[test]
    fn test_resolve_substitutes_every_reference() {
        let value = Value::List(vec![Value::Deferred(NodeId(0)), Value::Int(5)]);
        let resolved = value.resolve(&|_| Value::String("done".into()));
        assert_eq!(
            resolved,
            Value::List(vec![Value::String("done".into()), Value::Int(5)])
        );
        assert!(!resolved.contains_deferred());
    }

    #[test]
    fn test_json_round_trip() {
        let value = Value::Map(
            [
                (MapKey::Str("a".into()), Value::Int(1)),
                (
                    MapKey::Str("b".into()),
                    Value::List(vec![Value::Bool(true), Value::Null]),
                ),
            ]
            .into_iter()
            .collect(),
        );

        let json = value.to_json().expect("encodable");
        assert_eq!(Value::from_json(&json), value);
    }

    #[test]
    fn test_deferred_has_no_json_form() {
        let value = Value::List(vec![Value::Deferred(NodeId(1))]);
        assert!(value.to_json().is_none());
    }

    #[test]
    fn test_truthiness_matches_python() {
        assert!(!Value::Null.truthy().unwrap());
        assert!(!Value::Int(0).truthy().unwrap());
        assert!(!Value::String(String::new()).truthy().unwrap());
        assert!(!Value::List(Vec::new()).truthy().unwrap());
        assert!(Value::Float(0.1).truthy().unwrap());
        assert!(Value::String("x".into()).truthy().unwrap());
    }
}
