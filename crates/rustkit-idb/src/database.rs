//! A named, versioned database: its object stores and scheduler.

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tracing::{trace, warn};

use crate::error::{IDBError, Result};
use crate::ids::TransactionId;
use crate::index::SecondaryIndex;
use crate::key::Key;
use crate::key_generator::KeyGenerator;
use crate::key_path::KeyPath;
use crate::key_range::KeyRange;
use crate::object_store::ObjectStore;
use crate::persistence::{
    catalog_key, record_key, store_prefix, DatabaseCatalog, IndexCatalog, PendingWrite,
    StoreCatalog,
};
use crate::scheduler::TransactionScheduler;
use crate::tree::Record;
use crate::undo::{SchemaChange, UndoAction, UndoLog};

/// A database.
#[derive(Debug)]
pub struct Database {
    /// Database name.
    pub name: String,

    /// Version.
    pub version: u64,

    /// Object stores.
    pub(crate) stores: HashMap<String, ObjectStore>,

    pub(crate) scheduler: TransactionScheduler,

    /// Running `versionchange` transaction, if any.
    pub(crate) upgrade: Option<TransactionId>,

    tombstone_ratio: f64,
}

impl Database {
    /// Create a new database.
    pub fn new(name: &str, version: u64, tombstone_ratio: f64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stores: HashMap::new(),
            scheduler: TransactionScheduler::new(),
            upgrade: None,
            tombstone_ratio,
        }
    }

    /// Get object store names, sorted.
    pub fn object_store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get an object store.
    pub fn object_store(&self, name: &str) -> Option<&ObjectStore> {
        self.stores.get(name)
    }

    // ==================== Schema ====================

    /// Create an object store.
    pub(crate) fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
        undo: &mut UndoLog,
    ) -> Result<&ObjectStore> {
        key_path.validate()?;
        if self.stores.contains_key(name) {
            return Err(IDBError::constraint(format!(
                "Object store already exists: {}",
                name
            )));
        }
        let unsupported_path = match &key_path {
            KeyPath::Single(path) => path.is_empty(),
            KeyPath::Multiple(_) => true,
            KeyPath::None => false,
        };
        if auto_increment && unsupported_path {
            return Err(IDBError::InvalidAccessError(
                "autoIncrement requires an out-of-line or non-empty string key path".into(),
            ));
        }

        undo.push(UndoAction::RestoreSchema(SchemaChange::CreatedStore {
            name: name.to_string(),
        }));
        let store = ObjectStore::new(name, key_path, auto_increment, self.tombstone_ratio);
        Ok(self.stores.entry(name.to_string()).or_insert(store))
    }

    /// Delete an object store.
    pub(crate) fn delete_object_store(&mut self, name: &str, undo: &mut UndoLog) -> Result<()> {
        let mut store = self
            .stores
            .remove(name)
            .ok_or_else(|| IDBError::not_found(format!("Object store not found: {}", name)))?;
        store.deleted = true;
        undo.push(UndoAction::RestoreSchema(SchemaChange::DeletedStore {
            store: Box::new(store),
        }));
        Ok(())
    }

    /// Create an uninitialized index on `store`.
    pub(crate) fn create_index(
        &mut self,
        store: &str,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
        undo: &mut UndoLog,
    ) -> Result<&SecondaryIndex> {
        let object_store = self
            .stores
            .get_mut(store)
            .ok_or_else(|| IDBError::invalid_state(format!("Object store '{}' was deleted", store)))?;
        if object_store.index(name).is_some() {
            return Err(IDBError::constraint(format!("Index already exists: {}", name)));
        }
        key_path.validate()?;
        if key_path == KeyPath::None {
            return Err(IDBError::SyntaxError("An index requires a key path".into()));
        }
        if multi_entry && matches!(key_path, KeyPath::Multiple(_)) {
            return Err(IDBError::InvalidAccessError(
                "multiEntry is not allowed with an array key path".into(),
            ));
        }

        undo.push(UndoAction::RestoreSchema(SchemaChange::CreatedIndex {
            store: store.to_string(),
            name: name.to_string(),
        }));
        object_store.create_index(name, key_path, unique, multi_entry)
    }

    /// Delete an index.
    pub(crate) fn delete_index(&mut self, store: &str, name: &str, undo: &mut UndoLog) -> Result<()> {
        let object_store = self
            .stores
            .get_mut(store)
            .ok_or_else(|| IDBError::invalid_state(format!("Object store '{}' was deleted", store)))?;
        let index = object_store.delete_index(name)?;
        undo.push(UndoAction::RestoreSchema(SchemaChange::DeletedIndex {
            store: store.to_string(),
            index: Box::new(index),
        }));
        Ok(())
    }

    /// Record a version bump made by an upgrade.
    pub(crate) fn set_version(&mut self, version: u64, undo: &mut UndoLog) {
        undo.push(UndoAction::RestoreSchema(SchemaChange::Version {
            old_version: self.version,
        }));
        self.version = version;
    }

    // ==================== Abort ====================

    /// Replay an undo log, newest action first.
    pub(crate) fn rollback(&mut self, undo: UndoLog) {
        trace!(db = %self.name, actions = undo.len(), "Rolling back");
        for action in undo.into_reversed() {
            match action {
                UndoAction::ReinsertRecord { store, record } => {
                    if let Some(s) = self.stores.get_mut(&store) {
                        s.restore_record(record);
                    }
                }
                UndoAction::DeleteKey { store, key } => {
                    if let Some(s) = self.stores.get_mut(&store) {
                        s.remove_key(&key);
                    }
                }
                UndoAction::RestoreCounter { store, counter } => {
                    if let Some(s) = self.stores.get_mut(&store) {
                        s.restore_counter(counter);
                    }
                }
                UndoAction::RestoreSchema(change) => self.revert_schema(change),
            }
        }
    }

    fn revert_schema(&mut self, change: SchemaChange) {
        match change {
            SchemaChange::CreatedStore { name } => {
                self.stores.remove(&name);
            }
            SchemaChange::DeletedStore { store } => {
                let mut store = *store;
                store.deleted = false;
                self.stores.insert(store.name.clone(), store);
            }
            SchemaChange::CreatedIndex { store, name } => {
                if let Some(s) = self.stores.get_mut(&store) {
                    s.indexes.remove(&name);
                }
            }
            SchemaChange::DeletedIndex { store, index } => {
                if let Some(s) = self.stores.get_mut(&store) {
                    let mut index = *index;
                    index.deleted = false;
                    s.indexes.insert(index.name.clone(), index);
                }
            }
            SchemaChange::Version { old_version } => self.version = old_version,
        }
    }

    // ==================== Persistence ====================

    /// Schema snapshot for the catalog.
    pub(crate) fn catalog(&self) -> DatabaseCatalog {
        let stores = self
            .object_store_names()
            .into_iter()
            .filter_map(|name| self.stores.get(&name))
            .map(|store| StoreCatalog {
                name: store.name.clone(),
                key_path: store.key_path.clone(),
                auto_increment: store.auto_increment,
                key_generator: store.key_generator_counter(),
                indexes: store
                    .index_names()
                    .into_iter()
                    .filter_map(|name| store.index(&name))
                    .map(|index| IndexCatalog {
                        name: index.name.clone(),
                        key_path: index.key_path.clone(),
                        unique: index.unique,
                        multi_entry: index.multi_entry,
                    })
                    .collect(),
            })
            .collect();
        DatabaseCatalog {
            version: self.version,
            stores,
        }
    }

    /// Rebuild a database from its catalog and persisted records.
    ///
    /// `records` yields the persisted `(key, JSON value)` pairs of a store.
    pub(crate) fn from_catalog<F>(
        name: &str,
        catalog: DatabaseCatalog,
        tombstone_ratio: f64,
        mut records: F,
    ) -> Result<Self>
    where
        F: FnMut(&str) -> Result<Vec<(Key, String)>>,
    {
        let mut db = Database::new(name, catalog.version, tombstone_ratio);
        for entry in catalog.stores {
            let mut store =
                ObjectStore::new(&entry.name, entry.key_path, entry.auto_increment, tombstone_ratio);
            if let Some(counter) = entry.key_generator {
                store.key_generator = Some(KeyGenerator::with_counter(counter));
            }
            for (key, value) in records(&entry.name)? {
                let value: JsonValue = serde_json::from_str(&value)?;
                store.load_record(Record::new(key, value));
            }
            for index in entry.indexes {
                store.create_index(&index.name, index.key_path, index.unique, index.multi_entry)?;
                if let Err(e) = store.backfill_index(&index.name) {
                    warn!(db = %name, store = %entry.name, index = %index.name, error = %e, "Index not rebuilt");
                }
            }
            db.stores.insert(entry.name.clone(), store);
        }
        Ok(db)
    }

    /// Writes that make the backend match the effects of `undo`.
    pub(crate) fn writes_for(&self, undo: &UndoLog) -> Result<Vec<PendingWrite>> {
        let mut writes = Vec::new();
        if undo.is_empty() {
            return Ok(writes);
        }

        for action in undo.iter() {
            if let UndoAction::RestoreSchema(SchemaChange::DeletedStore { store }) = action {
                writes.push(PendingWrite::DeletePrefix {
                    prefix: store_prefix(&self.name, &store.name),
                });
            }
        }

        let mut touched = undo.touched_records();
        touched.sort();
        touched.dedup();
        for (store, key) in touched {
            let Some(object_store) = self.stores.get(store) else {
                continue;
            };
            let storage_key = record_key(&self.name, store, key)?;
            match object_store.get_value(&KeyRange::from(key.clone())) {
                Some(value) => writes.push(PendingWrite::Set {
                    key: storage_key,
                    value: serde_json::to_string(&value)?,
                }),
                None => writes.push(PendingWrite::Delete { key: storage_key }),
            }
        }

        writes.push(PendingWrite::Set {
            key: catalog_key(&self.name),
            value: serde_json::to_string(&self.catalog())?,
        });
        Ok(writes)
    }
}
