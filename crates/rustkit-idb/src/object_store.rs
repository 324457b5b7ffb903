//! Object stores: primary records plus their secondary indexes.

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tracing::{trace, warn};

use crate::error::{IDBError, Result};
use crate::ids::StoreId;
use crate::index::SecondaryIndex;
use crate::key::Key;
use crate::key_generator::KeyGenerator;
use crate::key_path::KeyPath;
use crate::key_range::KeyRange;
use crate::tree::{OrderedIndex, Record, ScanDirection};
use crate::undo::{UndoAction, UndoLog};

/// An object store.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    pub(crate) id: StoreId,

    /// Store name.
    pub name: String,

    /// Key path.
    pub key_path: KeyPath,

    /// Auto-increment.
    pub auto_increment: bool,

    pub(crate) key_generator: Option<KeyGenerator>,

    /// Records, ordered by primary key.
    records: OrderedIndex<JsonValue>,

    /// Indexes.
    pub(crate) indexes: HashMap<String, SecondaryIndex>,

    pub(crate) deleted: bool,

    tombstone_ratio: f64,
}

impl ObjectStore {
    /// Create a new object store.
    pub fn new(name: &str, key_path: KeyPath, auto_increment: bool, tombstone_ratio: f64) -> Self {
        Self {
            id: StoreId::new(),
            name: name.to_string(),
            key_path,
            auto_increment,
            key_generator: auto_increment.then(KeyGenerator::new),
            records: OrderedIndex::with_tombstone_ratio(true, tombstone_ratio),
            indexes: HashMap::new(),
            deleted: false,
            tombstone_ratio,
        }
    }

    pub(crate) fn records(&self) -> &OrderedIndex<JsonValue> {
        &self.records
    }

    /// Current key generator counter, if the store has one.
    pub fn key_generator_counter(&self) -> Option<u64> {
        self.key_generator.map(|g| g.current())
    }

    /// Index names, sorted.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get an index.
    pub fn index(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.get(name)
    }

    // ==================== Writes ====================

    /// Store a record, returning its key.
    ///
    /// `key` is the explicit out-of-line key, if any. With `no_overwrite`
    /// an existing record under the same key is a `ConstraintError`.
    /// Every check runs before the first mutation, so a failed call leaves
    /// the store untouched.
    pub fn store_record(
        &mut self,
        mut value: JsonValue,
        key: Option<Key>,
        no_overwrite: bool,
        undo: &mut UndoLog,
    ) -> Result<Key> {
        let mut generated = false;
        let key = match key {
            Some(key) => key,
            None => match self.key_path.extract(&value)? {
                Some(key) => key,
                None => {
                    let generator = self.key_generator.as_ref().ok_or_else(|| {
                        IDBError::data("No key provided and the store has no key generator")
                    })?;
                    let next = generator.peek()?;
                    let key = Key::Number(next as f64);
                    if self.key_path.is_inline() {
                        self.key_path.inject(&mut value, &key)?;
                    }
                    generated = true;
                    key
                }
            },
        };
        key.validate()?;

        let existing = self.records.get(&KeyRange::from(key.clone())).cloned();
        if existing.is_some() && no_overwrite {
            return Err(IDBError::constraint(format!(
                "Key already exists in store '{}': {}",
                self.name, key
            )));
        }

        let record = Record::new(key.clone(), value);
        for index in self.indexes.values().filter(|i| i.initialized) {
            index.check_unique(&index.index_keys(&record.value), &key)?;
        }

        if let Some(generator) = self.key_generator.as_mut() {
            let before = generator.current();
            if generated {
                generator.next()?;
            } else if let Some(n) = key.as_number() {
                generator.set_if_larger(n);
            }
            if generator.current() != before {
                undo.push(UndoAction::RestoreCounter {
                    store: self.name.clone(),
                    counter: before,
                });
            }
        }

        if let Some(old) = existing {
            self.unindex(&old);
            self.records.delete_key(&key);
            undo.push(UndoAction::ReinsertRecord {
                store: self.name.clone(),
                record: old,
            });
        }

        self.records.insert(record.clone());
        undo.push(UndoAction::DeleteKey {
            store: self.name.clone(),
            key: key.clone(),
        });

        for index in self.indexes.values_mut().filter(|i| i.initialized) {
            index.store_record(&record)?;
        }

        trace!(store = %self.name, %key, "Stored record");
        Ok(key)
    }

    /// Delete every record in `range`. Returns how many were removed.
    pub fn delete_records(&mut self, range: &KeyRange, undo: &mut UndoLog) -> usize {
        let removed = self.records.delete_range(range);
        for record in &removed {
            self.unindex(record);
        }
        let count = removed.len();
        for record in removed {
            undo.push(UndoAction::ReinsertRecord {
                store: self.name.clone(),
                record,
            });
        }
        count
    }

    /// Remove every record.
    pub fn clear(&mut self, undo: &mut UndoLog) {
        let removed = self.records.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
        for record in removed {
            undo.push(UndoAction::ReinsertRecord {
                store: self.name.clone(),
                record,
            });
        }
    }

    fn unindex(&mut self, record: &Record<JsonValue>) {
        for index in self.indexes.values_mut() {
            index.remove_record(record);
        }
    }

    /// Undo support: put a removed record back.
    pub(crate) fn restore_record(&mut self, record: Record<JsonValue>) {
        for index in self.indexes.values_mut().filter(|i| i.initialized) {
            if let Err(e) = index.store_record(&record) {
                warn!(store = %self.name, index = %index.name, error = %e, "Index entry not restored");
            }
        }
        self.records.insert(record);
    }

    /// Undo support: remove an inserted record.
    pub(crate) fn remove_key(&mut self, key: &Key) {
        for record in self.records.delete_key(key) {
            self.unindex(&record);
        }
    }

    /// Undo support: reset the key generator.
    pub(crate) fn restore_counter(&mut self, counter: u64) {
        if let Some(generator) = self.key_generator.as_mut() {
            generator.restore(counter);
        }
    }

    /// Rehydration: insert a record read from the backend.
    pub(crate) fn load_record(&mut self, record: Record<JsonValue>) {
        self.records.insert(record);
    }

    // ==================== Reads ====================

    /// Copy of the first value in `range`.
    pub fn get_value(&self, range: &KeyRange) -> Option<JsonValue> {
        self.records.get(range).map(|r| r.value.clone())
    }

    /// First key in `range`.
    pub fn get_key(&self, range: &KeyRange) -> Option<Key> {
        self.records.get(range).map(|r| r.key.clone())
    }

    /// Copies of the values in `range`, up to `count`.
    pub fn get_all(&self, range: &KeyRange, count: Option<usize>) -> Vec<JsonValue> {
        self.records
            .iter(range, ScanDirection::Forward)
            .take(count.unwrap_or(usize::MAX))
            .map(|r| r.value.clone())
            .collect()
    }

    /// Keys in `range`, up to `count`.
    pub fn get_all_keys(&self, range: &KeyRange, count: Option<usize>) -> Vec<Key> {
        self.records
            .iter(range, ScanDirection::Forward)
            .take(count.unwrap_or(usize::MAX))
            .map(|r| r.key.clone())
            .collect()
    }

    /// Number of records in `range`.
    pub fn count(&self, range: &KeyRange) -> usize {
        self.records.count(range)
    }

    // ==================== Indexes ====================

    /// Create an uninitialized index; [`ObjectStore::backfill_index`]
    /// populates it.
    pub(crate) fn create_index(
        &mut self,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<&SecondaryIndex> {
        if self.indexes.contains_key(name) {
            return Err(IDBError::constraint(format!(
                "Index already exists: {}",
                name
            )));
        }
        let index = SecondaryIndex::new(name, key_path, unique, multi_entry, self.tombstone_ratio);
        Ok(self.indexes.entry(name.to_string()).or_insert(index))
    }

    /// Index every current record, then mark the index initialized.
    pub(crate) fn backfill_index(&mut self, name: &str) -> Result<()> {
        let index = self
            .indexes
            .get_mut(name)
            .ok_or_else(|| IDBError::not_found(format!("Index not found: {}", name)))?;
        if index.initialized {
            return Err(IDBError::invalid_state(format!(
                "Index '{}' is already initialized",
                name
            )));
        }
        for record in self.records.iter_all() {
            index.store_record(record)?;
        }
        index.initialized = true;
        trace!(store = %self.name, index = %name, entries = index.len(), "Index backfilled");
        Ok(())
    }

    /// Remove an index, returning it.
    pub(crate) fn delete_index(&mut self, name: &str) -> Result<SecondaryIndex> {
        let mut index = self
            .indexes
            .remove(name)
            .ok_or_else(|| IDBError::not_found(format!("Index not found: {}", name)))?;
        index.deleted = true;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DEFAULT_TOMBSTONE_RATIO;
    use serde_json::json;

    fn store(key_path: KeyPath, auto_increment: bool) -> ObjectStore {
        ObjectStore::new("test", key_path, auto_increment, DEFAULT_TOMBSTONE_RATIO)
    }

    fn rollback(store: &mut ObjectStore, undo: UndoLog) {
        for action in undo.into_reversed() {
            match action {
                UndoAction::ReinsertRecord { record, .. } => store.restore_record(record),
                UndoAction::DeleteKey { key, .. } => store.remove_key(&key),
                UndoAction::RestoreCounter { counter, .. } => store.restore_counter(counter),
                UndoAction::RestoreSchema(_) => unreachable!(),
            }
        }
    }

    #[test]
    fn test_object_store_add() {
        let mut store = store(KeyPath::from("id"), false);
        let mut undo = UndoLog::new();

        let key = store
            .store_record(json!({"id": "key1", "data": "hello"}), None, true, &mut undo)
            .unwrap();

        assert_eq!(key, Key::from("key1"));
        assert!(store.get_value(&KeyRange::from(key)).is_some());
    }

    #[test]
    fn test_add_duplicate_is_constraint_error() {
        let mut store = store(KeyPath::from("isbn"), false);
        let mut undo = UndoLog::new();
        store
            .store_record(json!({"isbn": 1, "title": "A"}), None, true, &mut undo)
            .unwrap();

        let err = store
            .store_record(json!({"isbn": 1, "title": "B"}), None, true, &mut undo)
            .unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
        assert_eq!(store.count(&KeyRange::unbounded()), 1);
        assert_eq!(
            store.get_value(&KeyRange::only(1).unwrap()),
            Some(json!({"isbn": 1, "title": "A"}))
        );
    }

    #[test]
    fn test_object_store_put_overwrites() {
        let mut store = store(KeyPath::from("id"), false);
        let mut undo = UndoLog::new();

        store
            .store_record(json!({"id": "key1", "data": "v1"}), None, false, &mut undo)
            .unwrap();
        store
            .store_record(json!({"id": "key1", "data": "v2"}), None, false, &mut undo)
            .unwrap();

        let value = store.get_value(&KeyRange::only("key1").unwrap()).unwrap();
        assert_eq!(value["data"], "v2");
    }

    #[test]
    fn test_auto_increment_injects_key() {
        let mut store = store(KeyPath::from("meta.id"), true);
        let mut undo = UndoLog::new();

        let key1 = store.store_record(json!({"data": "a"}), None, true, &mut undo).unwrap();
        let key2 = store.store_record(json!({"data": "b"}), None, true, &mut undo).unwrap();

        assert_eq!(key1, Key::from(1));
        assert_eq!(key2, Key::from(2));
        assert_eq!(
            store.get_value(&KeyRange::only(2).unwrap()),
            Some(json!({"data": "b", "meta": {"id": 2}}))
        );
    }

    #[test]
    fn test_explicit_numeric_key_raises_generator() {
        let mut store = store(KeyPath::None, true);
        let mut undo = UndoLog::new();

        store
            .store_record(json!("x"), Some(Key::from(41.7)), true, &mut undo)
            .unwrap();
        let next = store.store_record(json!("y"), None, true, &mut undo).unwrap();
        assert_eq!(next, Key::from(42));
    }

    #[test]
    fn test_out_of_line_without_generator_needs_key() {
        let mut store = store(KeyPath::None, false);
        let mut undo = UndoLog::new();
        let err = store.store_record(json!(1), None, false, &mut undo).unwrap_err();
        assert_eq!(err.name(), "DataError");
        assert!(undo.is_empty());
    }

    #[test]
    fn test_unique_index_violation_leaves_store_untouched() {
        let mut store = store(KeyPath::from("id"), false);
        store.create_index("by_email", KeyPath::from("email"), true, false).unwrap();
        store.backfill_index("by_email").unwrap();

        let mut undo = UndoLog::new();
        store
            .store_record(json!({"id": 1, "email": "a@test.com"}), None, true, &mut undo)
            .unwrap();
        let before = undo.len();

        let result = store.store_record(json!({"id": 2, "email": "a@test.com"}), None, true, &mut undo);
        assert!(matches!(result, Err(IDBError::ConstraintError(_))));
        assert_eq!(undo.len(), before);
        assert_eq!(store.count(&KeyRange::unbounded()), 1);
    }

    #[test]
    fn test_put_keeps_own_unique_entry() {
        let mut store = store(KeyPath::from("id"), false);
        store.create_index("by_email", KeyPath::from("email"), true, false).unwrap();
        store.backfill_index("by_email").unwrap();

        let mut undo = UndoLog::new();
        store
            .store_record(json!({"id": 1, "email": "a@test.com"}), None, false, &mut undo)
            .unwrap();
        store
            .store_record(json!({"id": 1, "email": "a@test.com", "n": 2}), None, false, &mut undo)
            .unwrap();
        assert_eq!(store.index("by_email").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_range_updates_indexes() {
        let mut store = store(KeyPath::from("id"), false);
        store.create_index("by_name", KeyPath::from("name"), false, false).unwrap();
        store.backfill_index("by_name").unwrap();

        let mut undo = UndoLog::new();
        for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
            store
                .store_record(json!({"id": id, "name": name}), None, true, &mut undo)
                .unwrap();
        }

        let removed = store.delete_records(&KeyRange::bound(1, 2, false, false).unwrap(), &mut undo);
        assert_eq!(removed, 2);
        let index = store.index("by_name").unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get_primary_key(&KeyRange::unbounded()),
            Some(Key::from(3))
        );
    }

    #[test]
    fn test_undo_restores_exact_state() {
        let mut store = store(KeyPath::from("id"), true);
        store.create_index("by_tag", KeyPath::from("tags"), false, true).unwrap();
        store.backfill_index("by_tag").unwrap();

        let mut setup = UndoLog::new();
        store
            .store_record(json!({"id": 1, "tags": ["a", "b"]}), None, true, &mut setup)
            .unwrap();
        store
            .store_record(json!({"id": 2, "tags": ["b"]}), None, true, &mut setup)
            .unwrap();
        let snapshot: Vec<_> = store.records().iter_all().cloned().collect();
        let index_snapshot: Vec<_> = store
            .index("by_tag")
            .unwrap()
            .records()
            .iter_all()
            .cloned()
            .collect();
        let counter = store.key_generator_counter();

        let mut undo = UndoLog::new();
        store
            .store_record(json!({"id": 1, "tags": ["z"]}), None, false, &mut undo)
            .unwrap();
        store.store_record(json!({"tags": ["c"]}), None, true, &mut undo).unwrap();
        store.delete_records(&KeyRange::only(2).unwrap(), &mut undo);
        store.clear(&mut undo);
        store
            .store_record(json!({"id": 10, "tags": []}), None, true, &mut undo)
            .unwrap();

        rollback(&mut store, undo);

        let restored: Vec<_> = store.records().iter_all().cloned().collect();
        let restored_index: Vec<_> = store
            .index("by_tag")
            .unwrap()
            .records()
            .iter_all()
            .cloned()
            .collect();
        assert_eq!(restored, snapshot);
        assert_eq!(restored_index, index_snapshot);
        assert_eq!(store.key_generator_counter(), counter);
    }

    #[test]
    fn test_backfill_detects_duplicates() {
        let mut store = store(KeyPath::from("id"), false);
        let mut undo = UndoLog::new();
        store
            .store_record(json!({"id": 1, "email": "same"}), None, true, &mut undo)
            .unwrap();
        store
            .store_record(json!({"id": 2, "email": "same"}), None, true, &mut undo)
            .unwrap();

        store.create_index("by_email", KeyPath::from("email"), true, false).unwrap();
        let err = store.backfill_index("by_email").unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
        assert!(!store.index("by_email").unwrap().is_initialized());
    }

    #[test]
    fn test_get_all_with_count() {
        let mut store = store(KeyPath::None, true);
        let mut undo = UndoLog::new();
        for v in ["a", "b", "c"] {
            store.store_record(json!(v), None, true, &mut undo).unwrap();
        }
        assert_eq!(
            store.get_all(&KeyRange::unbounded(), Some(2)),
            vec![json!("a"), json!("b")]
        );
        assert_eq!(
            store.get_all_keys(&KeyRange::lower_bound(2, false).unwrap(), None),
            vec![Key::from(2), Key::from(3)]
        );
    }
}
