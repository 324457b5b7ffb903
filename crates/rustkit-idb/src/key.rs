//! Keys and the total order over them.
//!
//! Keys of different types order as
//! `Number < Date < String < Binary < Array`. Arrays compare element by
//! element, a shorter array sorting first when it is a prefix of the
//! other. Strings compare by UTF-16 code unit so the order matches the
//! one browsers expose.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{IDBError, Result};

/// Largest magnitude of a valid date, in milliseconds since the epoch.
const MAX_DATE_MS: f64 = 8.64e15;

/// A key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    Number(f64),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    /// Create a date key.
    pub fn date(epoch_ms: f64) -> Self {
        Key::Date(epoch_ms)
    }

    /// Create a binary key.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Key::Binary(bytes.into())
    }

    fn type_rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Binary(_) => 3,
            Key::Array(_) => 4,
        }
    }

    /// Numeric value, if this is a number key.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Reject keys that cannot take part in the total order.
    ///
    /// Keys are owned trees, so an array can never contain itself and no
    /// cycle check is needed.
    pub fn validate(&self) -> Result<()> {
        match self {
            Key::Number(n) if n.is_nan() => Err(IDBError::data("NaN is not a valid key")),
            Key::Date(ms) if !ms.is_finite() || ms.abs() > MAX_DATE_MS => {
                Err(IDBError::data("Invalid date is not a valid key"))
            }
            Key::Array(items) => items.iter().try_for_each(Key::validate),
            _ => Ok(()),
        }
    }

    /// Convert a JSON value into a key.
    ///
    /// Numbers, strings and arrays of those convert; anything else is a
    /// `DataError`.
    pub fn from_json(value: &JsonValue) -> Result<Key> {
        match value {
            JsonValue::Number(n) => n
                .as_f64()
                .map(Key::Number)
                .ok_or_else(|| IDBError::data(format!("Number {} is not a valid key", n))),
            JsonValue::String(s) => Ok(Key::String(s.clone())),
            JsonValue::Array(items) => items
                .iter()
                .map(Key::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Key::Array),
            other => Err(IDBError::data(format!("{} is not a valid key", other))),
        }
    }

    /// Convert to JSON, used when a generated key is written back into a
    /// value. Dates become their epoch milliseconds and binary keys an
    /// array of bytes.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Key::Number(n) | Key::Date(n) => number_to_json(*n),
            Key::String(s) => JsonValue::String(s.clone()),
            Key::Binary(bytes) => {
                JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect())
            }
            Key::Array(items) => JsonValue::Array(items.iter().map(Key::to_json).collect()),
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// Compare two keys.
pub fn compare(a: &Key, b: &Key) -> Ordering {
    match (a, b) {
        (Key::Number(x), Key::Number(y)) | (Key::Date(x), Key::Date(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Key::String(x), Key::String(y)) => x.encode_utf16().cmp(y.encode_utf16()),
        (Key::Binary(x), Key::Binary(y)) => x.cmp(y),
        (Key::Array(x), Key::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match compare(l, r) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => a.type_rank().cmp(&b.type_rank()),
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::Date(ms) => write!(f, "Date({})", ms),
            Key::String(s) => write!(f, "{:?}", s),
            Key::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}
