//! Secondary indexes over an object store.

use serde_json::Value as JsonValue;

use crate::error::{IDBError, Result};
use crate::ids::IndexId;
use crate::key::Key;
use crate::key_path::KeyPath;
use crate::key_range::KeyRange;
use crate::tree::{OrderedIndex, Record, ScanDirection};

/// An index on an object store, mapping index keys to primary keys.
///
/// Entries are ordered by `(index key, primary key)`, so records that
/// share an index key are visited in primary key order.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    pub(crate) id: IndexId,

    /// Index name.
    pub name: String,

    /// Key path.
    pub key_path: KeyPath,

    /// Whether keys must be unique.
    pub unique: bool,

    /// Multi-entry (for array values).
    pub multi_entry: bool,

    /// False while the index is being backfilled from its store.
    pub(crate) initialized: bool,

    pub(crate) deleted: bool,

    records: OrderedIndex<Key>,
}

impl SecondaryIndex {
    /// Create a new, empty index.
    pub fn new(
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
        tombstone_ratio: f64,
    ) -> Self {
        Self {
            id: IndexId::new(),
            name: name.to_string(),
            key_path,
            unique,
            multi_entry,
            initialized: false,
            deleted: false,
            records: OrderedIndex::with_tombstone_ratio(false, tombstone_ratio),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn records(&self) -> &OrderedIndex<Key> {
        &self.records
    }

    /// Number of index entries.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index keys derived from a stored value.
    ///
    /// Values the key path cannot turn into a key yield no entries. A
    /// multi-entry index over an array yields one key per distinct valid
    /// element.
    pub fn index_keys(&self, value: &JsonValue) -> Vec<Key> {
        let Some(resolved) = self.key_path.resolve(value) else {
            return Vec::new();
        };

        if self.multi_entry {
            if let JsonValue::Array(items) = &resolved {
                let mut keys: Vec<Key> = items
                    .iter()
                    .filter_map(|item| Key::from_json(item).ok())
                    .collect();
                keys.sort();
                keys.dedup();
                return keys;
            }
        }

        Key::from_json(&resolved).map(|k| vec![k]).unwrap_or_default()
    }

    /// Fail if any of `keys` already maps to a different primary key.
    pub(crate) fn check_unique(&self, keys: &[Key], primary_key: &Key) -> Result<()> {
        if !self.unique {
            return Ok(());
        }
        for key in keys {
            let taken = self
                .records
                .iter(&KeyRange::from(key.clone()), ScanDirection::Forward)
                .any(|entry| entry.value != *primary_key);
            if taken {
                return Err(IDBError::constraint(format!(
                    "Duplicate key {} in unique index '{}'",
                    key, self.name
                )));
            }
        }
        Ok(())
    }

    /// Index a primary record. Nothing is inserted if the uniqueness
    /// check fails.
    pub(crate) fn store_record(&mut self, primary: &Record<JsonValue>) -> Result<()> {
        let keys = self.index_keys(&primary.value);
        self.check_unique(&keys, &primary.key)?;
        for key in keys {
            self.records.insert(Record::new(key, primary.key.clone()));
        }
        Ok(())
    }

    /// Remove the entries a primary record contributed.
    pub(crate) fn remove_record(&mut self, primary: &Record<JsonValue>) {
        for key in self.index_keys(&primary.value) {
            self.records.delete_record(&key, &primary.key);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    /// Primary key of the first entry in `range`.
    pub fn get_primary_key(&self, range: &KeyRange) -> Option<Key> {
        self.records.get(range).map(|entry| entry.value.clone())
    }

    /// Number of entries in `range`.
    pub fn count(&self, range: &KeyRange) -> usize {
        self.records.count(range)
    }
}
