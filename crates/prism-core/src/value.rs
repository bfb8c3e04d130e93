//! # Attribute Values
//!
//! The hub reports attributes as arbitrary JSON. [`AttributeValue`] is the
//! closed set of shapes the mirror keeps, so consumers can match on it
//! instead of poking at raw JSON.
//!
//! ```text
//! JSON                    AttributeValue
//! ──────────────────────  ─────────────────────────────
//! null                    Null
//! true / false            Bool
//! 42, -7                  Integer(i64)
//! 21.5, 1e-3              Float(f64)
//! 18446744073709551615    Opaque (does not fit i64)
//! "on"                    Text
//! [..]                    List
//! {..}                    Map (sorted keys)
//! ```
//!
//! Integers and floats stay distinct: `1` and `1.0` are different values and
//! each re-encodes to the form it arrived in.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// A single attribute value as mirrored from the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
    /// A JSON value with no lossless native representation (integers above
    /// `i64::MAX`). Kept verbatim.
    Opaque(Value),
}

impl AttributeValue {
    /// Short name of the value's shape, for logs and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Float(_) => "float",
            AttributeValue::Text(_) => "text",
            AttributeValue::List(_) => "list",
            AttributeValue::Map(_) => "map",
            AttributeValue::Opaque(_) => "opaque",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of either number variant.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, AttributeValue::Integer(_) | AttributeValue::Float(_))
    }

    /// Converts back to plain JSON.
    ///
    /// Non-finite floats have no JSON form and become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            AttributeValue::Null => Value::Null,
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Integer(i) => Value::Number((*i).into()),
            AttributeValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            AttributeValue::Text(s) => Value::String(s.clone()),
            AttributeValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            AttributeValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            AttributeValue::Opaque(raw) => raw.clone(),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttributeValue::Integer(i)
                } else if n.is_f64() {
                    n.as_f64()
                        .map(AttributeValue::Float)
                        .unwrap_or(AttributeValue::Opaque(Value::Number(n)))
                } else {
                    AttributeValue::Opaque(Value::Number(n))
                }
            }
            Value::String(s) => AttributeValue::Text(s),
            Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            Value::Object(map) => AttributeValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, AttributeValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<AttributeValue> for Value {
    fn from(value: AttributeValue) -> Self {
        value.to_json()
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Integer(i64::from(i))
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl From<Vec<AttributeValue>> for AttributeValue {
    fn from(items: Vec<AttributeValue>) -> Self {
        AttributeValue::List(items)
    }
}

impl fmt::Display for AttributeValue {
    /// Text is shown bare; everything else as compact JSON.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
