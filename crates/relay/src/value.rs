//! Loosely-typed configuration values.
//!
//! Operator-authored documents arrive as strings, numbers, lists and maps.
//! [`probe`] assigns each raw value a [`ProbedType`] by trying a fixed
//! sequence of predicates, first match wins:
//!
//! ```text
//! null → array → map → boolean → binary → int → long → float → double → string
//! ```
//!
//! Boolean is tested before the numeric types so `"true"` / `"false"` are
//! never widened into numbers, and int is tested before long so small
//! integers stay `Int`.

use std::collections::BTreeMap;
use std::fmt;

/// A tagged configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// The type assigned to a raw value by [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbedType {
    Null,
    Array,
    Map,
    Boolean,
    Bytes,
    Int,
    Long,
    Float,
    Double,
    String,
}

type Predicate = fn(&Value) -> bool;
type Converter = fn(&Value) -> Value;

/// Detection table, evaluated in order.
const DETECTION_ORDER: [(ProbedType, Predicate, Converter); 10] = [
    (ProbedType::Null, Value::is_null, |_| Value::Null),
    (ProbedType::Array, is_array, |v| Value::List(crate::coerce::as_list(v))),
    (ProbedType::Map, is_map, |v| Value::Map(crate::coerce::as_map(v))),
    (ProbedType::Boolean, is_boolean, |v| {
        Value::Bool(crate::coerce::as_bool(v).unwrap_or(false))
    }),
    (ProbedType::Bytes, is_binary, |v| {
        Value::Binary(crate::coerce::as_binary(v).unwrap_or_default())
    }),
    (ProbedType::Int, is_int, |v| {
        Value::Int(crate::coerce::as_int(v).unwrap_or(0))
    }),
    (ProbedType::Long, is_long, |v| {
        Value::Long(crate::coerce::as_long(v).unwrap_or(0))
    }),
    (ProbedType::Float, is_float, |v| {
        Value::Float(crate::coerce::as_float(v).unwrap_or(0.0))
    }),
    (ProbedType::Double, is_double, |v| {
        Value::Double(crate::coerce::as_double(v).unwrap_or(0.0))
    }),
    (ProbedType::String, is_str, |v| Value::String(v.to_string())),
];

/// Detects the type of `value` and converts it to that type.
///
/// Total: anything no predicate accepts becomes its string rendering.
pub fn probe(value: &Value) -> (ProbedType, Value) {
    for (ty, predicate, convert) in DETECTION_ORDER {
        if predicate(value) {
            return (ty, convert(value));
        }
    }
    (ProbedType::String, Value::String(value.to_string()))
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrows the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Text used by the textual predicates. Containers and binary have none.
    pub(crate) fn scalar_text(&self) -> Option<String> {
        match self {
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Long(l) => Some(l.to_string()),
            Value::Float(f) => Some(format!("{f:?}")),
            Value::Double(d) => Some(format!("{d:?}")),
            Value::String(s) => Some(s.clone()),
            Value::Null | Value::Binary(_) | Value::List(_) | Value::Map(_) => None,
        }
    }

    /// Converts to a JSON value. Binary becomes an array of byte numbers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Long(l) => Json::from(*l),
            Value::Float(f) => Json::from(f64::from(*f)),
            Value::Double(d) => Json::from(*d),
            Value::String(s) => Json::String(s.clone()),
            Value::Binary(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(l) = n.as_i64() {
                    Value::Long(l)
                } else {
                    Value::Double(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::String(s) => f.write_str(s),
            Value::Binary(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::List(_) | Value::Map(_) => write!(f, "{}", self.to_json()),
            scalar => f.write_str(&scalar.scalar_text().unwrap_or_default()),
        }
    }
}

/// Plain decimal notation: optional leading minus, digits, at most one dot,
/// no trailing dot. Rejects exponents, `inf`, `NaN` and leading `+`.
pub(crate) fn is_parsable(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || digits.ends_with('.') {
        return false;
    }
    let mut seen_dot = false;
    let mut seen_digit = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

fn is_array(value: &Value) -> bool {
    matches!(value, Value::List(_))
}

fn is_map(value: &Value) -> bool {
    matches!(value, Value::Map(_))
}

fn is_boolean(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false"),
        _ => false,
    }
}

fn is_binary(value: &Value) -> bool {
    matches!(value, Value::Binary(_))
}

fn numeric_text(value: &Value) -> Option<String> {
    value.scalar_text().filter(|text| is_parsable(text))
}

fn is_int(value: &Value) -> bool {
    match value {
        Value::Int(_) => true,
        other => numeric_text(other).is_some_and(|t| t.parse::<i32>().is_ok()),
    }
}

fn is_long(value: &Value) -> bool {
    match value {
        Value::Long(_) => true,
        other => numeric_text(other).is_some_and(|t| t.parse::<i64>().is_ok()),
    }
}

/// Accepts decimals that survive a round trip through `f32`.
fn is_float(value: &Value) -> bool {
    match value {
        Value::Float(_) => true,
        other => numeric_text(other)
            .and_then(|t| t.parse::<f64>().ok())
            .is_some_and(|d| f64::from(d as f32) == d),
    }
}

fn is_double(value: &Value) -> bool {
    match value {
        Value::Double(_) => true,
        other => numeric_text(other).is_some_and(|t| t.parse::<f64>().is_ok()),
    }
}

fn is_str(value: &Value) -> bool {
    matches!(value, Value::String(_))
}
