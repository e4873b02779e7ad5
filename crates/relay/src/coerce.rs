//! Best-effort coercion of [`Value`]s into target types.
//!
//! Every function here is total: malformed input yields `None` (or an empty
//! collection), and the `*_or` style accessors on [`crate::Block`] turn that
//! into the caller's default. Nothing in this module returns an error.

use crate::value::Value;
use std::collections::BTreeMap;

pub fn as_int(value: &Value) -> Option<i32> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Long(l) => i32::try_from(*l).ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_long(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(i64::from(*i)),
        Value::Long(l) => Some(*l),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_double(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(f64::from(*i)),
        Value::Long(l) => Some(*l as f64),
        Value::Float(f) => Some(f64::from(*f)),
        Value::Double(d) => Some(*d),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_float(value: &Value) -> Option<f32> {
    match value {
        Value::Float(f) => Some(*f),
        other => as_double(other).map(|d| d as f32),
    }
}

/// Only `true`/`false` (any case) count as booleans.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn as_char(value: &Value) -> Option<char> {
    as_string(value).and_then(|s| s.chars().next())
}

pub fn as_binary(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Binary(b) => Some(b.clone()),
        Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Lists pass through; a string becomes a one-element list, or is split on
/// commas (trimming each item) when it contains one.
pub fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.clone(),
        Value::String(s) if s.contains(',') => {
            s.split(',').map(|item| Value::from(item.trim())).collect()
        }
        Value::String(s) => vec![Value::from(s.as_str())],
        _ => Vec::new(),
    }
}

pub fn as_map(value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Map(map) => map.clone(),
        _ => BTreeMap::new(),
    }
}

pub fn as_string_map(value: &Value) -> BTreeMap<String, String> {
    as_map(value)
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
}

pub fn as_int_list(value: &Value) -> Vec<i32> {
    as_list(value).iter().filter_map(as_int).collect()
}

pub fn as_long_list(value: &Value) -> Vec<i64> {
    as_list(value).iter().filter_map(as_long).collect()
}

pub fn as_string_list(value: &Value) -> Vec<String> {
    as_list(value).iter().filter_map(as_string).collect()
}

/// Types a [`Value`] can be coerced into.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($($ty:ty => $f:path),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Option<Self> {
                    $f(value)
                }
            }
        )*
    };
}

impl_from_value! {
    i32 => as_int,
    i64 => as_long,
    f32 => as_float,
    f64 => as_double,
    bool => as_bool,
    String => as_string,
    char => as_char,
    Vec<u8> => as_binary,
}

impl FromValue for Vec<Value> {
    fn from_value(value: &Value) -> Option<Self> {
        Some(as_list(value))
    }
}

impl FromValue for Vec<String> {
    fn from_value(value: &Value) -> Option<Self> {
        Some(as_string_list(value))
    }
}

impl FromValue for BTreeMap<String, Value> {
    fn from_value(value: &Value) -> Option<Self> {
        Some(as_map(value))
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_input_yields_none() {
        let junk = Value::from("not-a-number");
        assert_eq!(as_int(&junk), None);
        assert_eq!(as_long(&junk), None);
        assert_eq!(as_double(&junk), None);
        assert_eq!(as_bool(&junk), None);
        assert_eq!(as_int(&Value::Long(i64::MAX)), None);
        assert_eq!(as_string(&Value::Null), None);
    }

    #[test]
    fn numeric_widening() {
        assert_eq!(as_long(&Value::Int(3)), Some(3));
        assert_eq!(as_double(&Value::Long(2)), Some(2.0));
        assert_eq!(as_int(&Value::from(" 12 ")), Some(12));
        assert_eq!(as_float(&Value::from("0.25")), Some(0.25));
    }

    #[test]
    fn comma_separated_strings_split_into_lists() {
        assert_eq!(
            as_string_list(&Value::from("a, b ,c")),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(as_string_list(&Value::from("solo")), vec!["solo".to_string()]);
        assert_eq!(as_int_list(&Value::from("1,x,3")), vec![1, 3]);
        assert!(as_list(&Value::Int(1)).is_empty());
    }

    #[test]
    fn bool_accepts_only_true_false() {
        assert_eq!(as_bool(&Value::from("TRUE")), Some(true));
        assert_eq!(as_bool(&Value::from("yes")), None);
        assert_eq!(as_bool(&Value::Int(1)), None);
    }

    #[test]
    fn char_takes_first_character() {
        assert_eq!(as_char(&Value::from("xyz")), Some('x'));
        assert_eq!(as_char(&Value::from("")), None);
        assert_eq!(as_char(&Value::Int(7)), Some('7'));
    }
}
