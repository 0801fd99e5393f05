//! Attribute values: a closed tagged union with JSON round-trip fidelity.
//!
//! Entities carry heterogeneous attribute maps authored by external tools,
//! so values must round-trip through JSON exactly. Rather than holding
//! `serde_json::Value` (open dynamic typing, and undecodable by
//! non-self-describing codecs), attributes use this closed union, which
//! both `serde_json` and `bitcode` can encode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute map type used throughout the kernel. `BTreeMap` keeps
/// iteration (and therefore serialization) order deterministic.
pub type Attributes = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single attribute value. Covers every JSON-representable shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convert from a parsed JSON value. Numbers that fit `i64` become
    /// `Int`; everything else numeric becomes `Float`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to a JSON value. Non-finite floats map to `null`,
    /// since JSON has no representation for them.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Whether this value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as text, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as an integer, if this is an `Int` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

// ---------------------------------------------------------------------------
// Merge-patch deltas
// ---------------------------------------------------------------------------

/// Merge an attribute delta into `target`, key by key:
///
/// - `Null` removes the key,
/// - `Map` merges into an existing `Map` one level deep (flat overwrite
///   inside),
/// - anything else overwrites.
///
/// Applying the same delta twice is idempotent.
pub fn merge_attributes(target: &mut Attributes, delta: &Attributes) {
    for (key, value) in delta {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Map(fields) => match target.get_mut(key) {
                Some(Value::Map(existing)) => {
                    for (k, v) in fields {
                        if v.is_null() {
                            existing.remove(k);
                        } else {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            },
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Convert a JSON object into an attribute map. Returns `None` if the
/// JSON value is not an object.
pub fn attributes_from_json(json: &serde_json::Value) -> Option<Attributes> {
    match json {
        serde_json::Value::Object(fields) => Some(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        ),
        _ => None,
    }
}
