//! Key paths: addresses into a stored value that yield its key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{IDBError, Result};
use crate::key::Key;

/// Key path for object stores and indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// No key path (out-of-line keys).
    None,
    /// Dotted property path. The empty string addresses the whole value.
    Single(String),
    /// Several paths combined into an array key.
    Multiple(Vec<String>),
}

impl KeyPath {
    /// Whether keys come from the value itself.
    pub fn is_inline(&self) -> bool {
        !matches!(self, KeyPath::None)
    }

    /// Check the path syntax.
    pub fn validate(&self) -> Result<()> {
        let valid = match self {
            KeyPath::None => true,
            KeyPath::Single(path) => is_valid_path(path),
            KeyPath::Multiple(paths) => {
                !paths.is_empty() && paths.iter().all(|p| is_valid_path(p))
            }
        };
        if valid {
            Ok(())
        } else {
            Err(IDBError::SyntaxError(format!("Invalid key path: {:?}", self)))
        }
    }

    /// Evaluate the path against a value without converting to a key.
    pub fn resolve(&self, value: &JsonValue) -> Option<JsonValue> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => evaluate(path, value),
            KeyPath::Multiple(paths) => paths
                .iter()
                .map(|p| evaluate(p, value))
                .collect::<Option<Vec<_>>>()
                .map(JsonValue::Array),
        }
    }

    /// Extract a key from a value.
    ///
    /// `Ok(None)` means the path addresses nothing; an addressed value
    /// that is not a valid key is a `DataError`.
    pub fn extract(&self, value: &JsonValue) -> Result<Option<Key>> {
        match self.resolve(value) {
            None => Ok(None),
            Some(resolved) => Key::from_json(&resolved).map(Some),
        }
    }

    /// Whether a generated key could be written into `value` at this path.
    pub fn can_inject(&self, value: &JsonValue) -> bool {
        let KeyPath::Single(path) = self else {
            return false;
        };
        if path.is_empty() {
            return false;
        }
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = value;
        for segment in &segments[..segments.len() - 1] {
            let JsonValue::Object(map) = current else {
                return false;
            };
            match map.get(*segment) {
                Some(next) => current = next,
                None => return true,
            }
        }
        current.is_object()
    }

    /// Write `key` into `value` at this path, creating missing parents.
    pub fn inject(&self, value: &mut JsonValue, key: &Key) -> Result<()> {
        if !self.can_inject(value) {
            return Err(IDBError::data("Key cannot be injected into value"));
        }
        let KeyPath::Single(path) = self else {
            return Err(IDBError::data("Key cannot be injected into value"));
        };

        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Err(IDBError::data("Empty key path")),
        };

        let mut current = value;
        for segment in parents {
            let JsonValue::Object(map) = current else {
                return Err(IDBError::data("Key path parent is not an object"));
            };
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
        }
        match current {
            JsonValue::Object(map) => {
                map.insert(last.to_string(), key.to_json());
                Ok(())
            }
            _ => Err(IDBError::data("Key path parent is not an object")),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Multiple(paths.into_iter().map(str::to_string).collect())
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn is_valid_path(path: &str) -> bool {
    path.is_empty() || path.split('.').all(is_identifier)
}

fn evaluate(path: &str, value: &JsonValue) -> Option<JsonValue> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        current = match (current, segment) {
            (JsonValue::Object(map), _) => map.get(segment)?,
            // `length` yields a number, which has no further properties.
            (JsonValue::String(s), "length") if segments.peek().is_none() => {
                return Some(JsonValue::from(s.encode_utf16().count()));
            }
            (JsonValue::Array(items), "length") if segments.peek().is_none() => {
                return Some(JsonValue::from(items.len()));
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_path_single() {
        let path = KeyPath::from("id");
        let value = json!({"id": 42, "name": "test"});
        assert_eq!(path.extract(&value).unwrap(), Some(Key::from(42)));
    }

    #[test]
    fn test_key_path_dotted() {
        let path = KeyPath::from("author.name");
        let value = json!({"author": {"name": "Ursula"}});
        assert_eq!(path.extract(&value).unwrap(), Some(Key::from("Ursula")));
        assert_eq!(path.extract(&json!({"author": 1})).unwrap(), None);
    }

    #[test]
    fn test_key_path_multiple() {
        let path = KeyPath::from(vec!["a", "b"]);
        let value = json!({"a": 1, "b": 2});
        assert_eq!(
            path.extract(&value).unwrap(),
            Some(Key::from(vec![Key::from(1), Key::from(2)]))
        );
        assert_eq!(path.extract(&json!({"a": 1})).unwrap(), None);
    }

    #[test]
    fn test_length_and_empty_path() {
        assert_eq!(
            KeyPath::from("title.length").extract(&json!({"title": "abc"})).unwrap(),
            Some(Key::from(3))
        );
        assert_eq!(
            KeyPath::from("").extract(&json!("whole")).unwrap(),
            Some(Key::from("whole"))
        );
    }

    #[test]
    fn test_invalid_key_is_data_error() {
        let path = KeyPath::from("flag");
        assert!(matches!(
            path.extract(&json!({"flag": true})),
            Err(IDBError::DataError(_))
        ));
    }

    #[test]
    fn test_validate_syntax() {
        assert!(KeyPath::from("a.b_c.$d").validate().is_ok());
        assert!(KeyPath::from("").validate().is_ok());
        assert!(KeyPath::from("a..b").validate().is_err());
        assert!(KeyPath::from("1abc").validate().is_err());
        assert!(KeyPath::Multiple(vec![]).validate().is_err());
    }

    #[test]
    fn test_inject_creates_parents() {
        let path = KeyPath::from("meta.id");
        let mut value = json!({"title": "A"});
        path.inject(&mut value, &Key::from(5)).unwrap();
        assert_eq!(value, json!({"title": "A", "meta": {"id": 5}}));
    }

    #[test]
    fn test_inject_rejects_non_object() {
        let path = KeyPath::from("id");
        let mut value = json!("string");
        assert!(!path.can_inject(&value));
        assert!(path.inject(&mut value, &Key::from(1)).is_err());

        let nested = KeyPath::from("a.id");
        assert!(!nested.can_inject(&json!({"a": 3})));
    }

    #[test]
    fn test_evaluate_nested_paths() {
        let value = json!({"a": {"b": [1, 2, 3], "c": "xy"}, "n": 4});
        assert_eq!(evaluate("a.b.length", &value), Some(json!(3)));
        assert_eq!(evaluate("a.c.length", &value), Some(json!(2)));
        assert_eq!(evaluate("a.b", &value), Some(json!([1, 2, 3])));
        assert_eq!(evaluate("a.b.length.x", &value), None);
        assert_eq!(evaluate("n.x", &value), None);
        assert_eq!(evaluate("a.missing.b", &value), None);
        assert_eq!(evaluate("", &value), Some(value.clone()));
    }
}
