//! Durable storage collaborator.
//!
//! Records are kept under `object\x1f{db}/{store}/{key}`. Database and
//! store names are escaped so no name's prefix is another's, and keys are
//! written in a lossless form (numbers as their IEEE bits). Each
//! database's schema lives in a catalog entry under `__db_structure__{db}`.
//! Secondary indexes are derived from the records and are rebuilt when a
//! database is loaded.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{IDBError, Result};
use crate::key::Key;
use crate::key_path::KeyPath;

/// Prefix of catalog entries.
pub const CATALOG_PREFIX: &str = "__db_structure__";

const RECORD_PREFIX: &str = "object\x1f";

/// Catalog key of a database.
pub fn catalog_key(db: &str) -> String {
    format!("{}{}", CATALOG_PREFIX, db)
}

/// `/` separates the parts of a record key, so it may not appear in a name.
fn escape_name(name: &str) -> String {
    name.replace('%', "%25").replace('/', "%2F")
}

/// Prefix shared by every record of a database.
pub fn database_prefix(db: &str) -> String {
    format!("{}{}/", RECORD_PREFIX, escape_name(db))
}

/// Prefix shared by every record of a store.
pub fn store_prefix(db: &str, store: &str) -> String {
    format!("{}{}/", database_prefix(db), escape_name(store))
}

/// Storage key of one record.
pub fn record_key(db: &str, store: &str, key: &Key) -> Result<String> {
    Ok(format!("{}{}", store_prefix(db, store), encode_key(key)?))
}

// ==================== Key encoding ====================

/// A key as written into storage keys.
#[derive(Debug, Serialize, Deserialize)]
enum StoredKey {
    Number(String),
    Date(String),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<StoredKey>),
}

impl From<&Key> for StoredKey {
    fn from(key: &Key) -> Self {
        match key {
            Key::Number(n) => StoredKey::Number(encode_f64(*n)),
            Key::Date(ms) => StoredKey::Date(encode_f64(*ms)),
            Key::String(s) => StoredKey::String(s.clone()),
            Key::Binary(bytes) => StoredKey::Binary(bytes.clone()),
            Key::Array(items) => StoredKey::Array(items.iter().map(StoredKey::from).collect()),
        }
    }
}

impl TryFrom<StoredKey> for Key {
    type Error = IDBError;

    fn try_from(stored: StoredKey) -> Result<Self> {
        Ok(match stored {
            StoredKey::Number(bits) => Key::Number(decode_f64(&bits)?),
            StoredKey::Date(bits) => Key::Date(decode_f64(&bits)?),
            StoredKey::String(s) => Key::String(s),
            StoredKey::Binary(bytes) => Key::Binary(bytes),
            StoredKey::Array(items) => Key::Array(
                items
                    .into_iter()
                    .map(Key::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

fn encode_f64(n: f64) -> String {
    // -0 and 0 are the same key and must share a record.
    let n = if n == 0.0 { 0.0 } else { n };
    format!("{:016x}", n.to_bits())
}

fn decode_f64(bits: &str) -> Result<f64> {
    u64::from_str_radix(bits, 16)
        .map(f64::from_bits)
        .map_err(|e| IDBError::UnknownError(format!("Bad stored number '{}': {}", bits, e)))
}

/// Encode a key for use in a storage key.
pub fn encode_key(key: &Key) -> Result<String> {
    Ok(serde_json::to_string(&StoredKey::from(key))?)
}

/// Decode a key written by [`encode_key`].
pub fn decode_key(encoded: &str) -> Result<Key> {
    let stored: StoredKey = serde_json::from_str(encoded)?;
    Key::try_from(stored)
}

// ==================== Catalog ====================

/// Persisted schema of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCatalog {
    pub version: u64,
    pub stores: Vec<StoreCatalog>,
}

/// Persisted schema of an object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreCatalog {
    pub name: String,
    pub key_path: KeyPath,
    pub auto_increment: bool,
    /// Next generated key.
    pub key_generator: Option<u64>,
    pub indexes: Vec<IndexCatalog>,
}

/// Persisted schema of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCatalog {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

// ==================== Backends ====================

/// One write headed for the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Set { key: String, value: String },
    Delete { key: String },
    DeletePrefix { prefix: String },
}

/// A key/value store the engine persists into.
pub trait StorageBackend {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    fn delete(&mut self, key: &str) -> Result<()>;

    /// Delete every entry whose key starts with `prefix`.
    fn delete_prefix(&mut self, prefix: &str) -> Result<()>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Apply a batch atomically: on error, none of `writes` may be visible.
    fn apply(&mut self, writes: &[PendingWrite]) -> Result<()>;

    /// Make previous writes durable.
    fn flush(&mut self) -> Result<()>;
}

/// Apply one write to an ordered map.
pub fn apply_to_map(entries: &mut BTreeMap<String, String>, write: &PendingWrite) {
    match write {
        PendingWrite::Set { key, value } => {
            entries.insert(key.clone(), value.clone());
        }
        PendingWrite::Delete { key } => {
            entries.remove(key);
        }
        PendingWrite::DeletePrefix { prefix } => {
            entries.retain(|key, _| !key.starts_with(prefix.as_str()));
        }
    }
}

/// Ordered in-memory backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    entries: BTreeMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn delete_prefix(&mut self, prefix: &str) -> Result<()> {
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply(&mut self, writes: &[PendingWrite]) -> Result<()> {
        // Map writes cannot fail, so the batch lands whole.
        for write in writes {
            apply_to_map(&mut self.entries, write);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// SQLite backend with a single `kv` table.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open or create a database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            IDBError::UnknownError(format!("Failed to open storage database: {}", e))
        })?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn delete_prefix(&mut self, prefix: &str) -> Result<()> {
        // substr avoids LIKE escaping for keys containing % or _.
        self.conn.execute(
            "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn apply(&mut self, writes: &[PendingWrite]) -> Result<()> {
        // Dropping `tx` on an early return rolls the batch back.
        let tx = self.conn.transaction()?;
        for write in writes {
            match write {
                PendingWrite::Set { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                PendingWrite::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
                PendingWrite::DeletePrefix { prefix } => {
                    tx.execute(
                        "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                        params![prefix],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Each batch commits its own transaction.
        Ok(())
    }
}

// ==================== Write queue ====================

/// Owns the backend and the writes that failed to reach it.
pub(crate) struct Persistence {
    backend: Box<dyn StorageBackend>,
    pending: Vec<PendingWrite>,
    flush_attempts: u32,
}

impl Persistence {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, flush_attempts: u32) -> Self {
        Self {
            backend,
            pending: Vec::new(),
            flush_attempts: flush_attempts.max(1),
        }
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Write a batch after any queued writes.
    ///
    /// With `strict`, a batch that cannot be flushed is an `UnknownError`
    /// and only the earlier queue is kept. Otherwise the batch joins the
    /// queue for replay.
    pub(crate) fn write(&mut self, writes: Vec<PendingWrite>, strict: bool) -> Result<()> {
        let earlier = self.pending.len();
        self.pending.extend(writes);
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut last_error = None;
        for attempt in 1..=self.flush_attempts {
            match self.apply_pending() {
                Ok(()) => {
                    debug!(attempt, "Flushed writes");
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Flush failed");
                    last_error = Some(e);
                }
            }
        }

        let error = match last_error {
            Some(IDBError::UnknownError(message)) => IDBError::UnknownError(message),
            Some(other) => IDBError::UnknownError(other.to_string()),
            None => IDBError::UnknownError("Flush failed".into()),
        };
        if strict {
            self.pending.truncate(earlier);
            Err(error)
        } else {
            warn!(queued = self.pending.len(), "Writes queued for replay");
            Ok(())
        }
    }

    /// Replay queued writes.
    pub(crate) fn checkpoint(&mut self) -> Result<()> {
        self.write(Vec::new(), true)
    }

    fn apply_pending(&mut self) -> Result<()> {
        self.backend.apply(&self.pending)?;
        self.backend.flush()
    }

    /// Catalogs of every persisted database.
    pub(crate) fn load_catalogs(&self) -> Result<Vec<(String, DatabaseCatalog)>> {
        let mut catalogs = Vec::new();
        for (key, value) in self.backend.scan_prefix(CATALOG_PREFIX)? {
            let name = key[CATALOG_PREFIX.len()..].to_string();
            catalogs.push((name, serde_json::from_str(&value)?));
        }
        Ok(catalogs)
    }

    /// Persisted records of one store, as `(key, JSON value)`.
    pub(crate) fn load_records(&self, db: &str, store: &str) -> Result<Vec<(Key, String)>> {
        let prefix = store_prefix(db, store);
        let mut records = Vec::new();
        for (key, value) in self.backend.scan_prefix(&prefix)? {
            match decode_key(&key[prefix.len()..]) {
                Ok(key) => records.push((key, value)),
                Err(e) => {
                    warn!(db = %db, store = %store, entry = %key, error = %e, "Skipping undecodable record")
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend whose writes fail until `failures` reaches zero.
    struct FlakyBackend {
        inner: MemoryBackend,
        failures: u32,
    }

    impl StorageBackend for FlakyBackend {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&mut self, key: &str, value: &str) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(IDBError::UnknownError("disk full".into()));
            }
            self.inner.set(key, value)
        }

        fn delete(&mut self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn delete_prefix(&mut self, prefix: &str) -> Result<()> {
            self.inner.delete_prefix(prefix)
        }

        fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
            self.inner.scan_prefix(prefix)
        }

        fn apply(&mut self, writes: &[PendingWrite]) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(IDBError::UnknownError("disk full".into()));
            }
            self.inner.apply(writes)
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn set(key: &str, value: &str) -> PendingWrite {
        PendingWrite::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    fn exercise(backend: &mut dyn StorageBackend) {
        backend.set("a/1", "one").unwrap();
        backend.set("a/2", "two").unwrap();
        backend.set("b/1", "other").unwrap();

        assert_eq!(backend.get("a/1").unwrap(), Some("one".into()));
        assert_eq!(
            backend.scan_prefix("a/").unwrap(),
            vec![("a/1".into(), "one".into()), ("a/2".into(), "two".into())]
        );

        backend.delete_prefix("a/").unwrap();
        assert!(backend.scan_prefix("a/").unwrap().is_empty());
        backend.delete("b/1").unwrap();
        assert_eq!(backend.get("b/1").unwrap(), None);

        backend
            .apply(&[
                set("c/1", "x"),
                set("c/2", "y"),
                PendingWrite::Delete { key: "c/1".into() },
            ])
            .unwrap();
        assert_eq!(
            backend.scan_prefix("c/").unwrap(),
            vec![("c/2".into(), "y".into())]
        );
        backend.flush().unwrap();
    }

    #[test]
    fn test_memory_backend() {
        exercise(&mut MemoryBackend::new());
    }

    #[test]
    fn test_sqlite_backend() {
        exercise(&mut SqliteBackend::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_prefix_with_wildcards() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.set("50%_off/1", "x").unwrap();
        backend.set("50xy/1", "y").unwrap();
        assert_eq!(backend.scan_prefix("50%_").unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_batch_rolls_back_on_error() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .conn
            .execute_batch(
                "CREATE TRIGGER reject BEFORE INSERT ON kv WHEN NEW.value = 'bad'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let err = backend.apply(&[set("k1", "good"), set("k2", "bad")]).unwrap_err();
        assert_eq!(err.name(), "UnknownError");
        assert_eq!(backend.get("k1").unwrap(), None);

        backend.apply(&[set("k1", "good")]).unwrap();
        assert_eq!(backend.get("k1").unwrap(), Some("good".into()));
    }

    #[test]
    fn test_record_keys() {
        let key = record_key("db", "books", &Key::from(1)).unwrap();
        assert!(key.starts_with(&store_prefix("db", "books")));
        assert!(key.starts_with(&database_prefix("db")));
        assert_eq!(catalog_key("db"), "__db_structure__db");
    }

    #[test]
    fn test_names_sharing_a_prefix_do_not_overlap() {
        assert!(!store_prefix("db", "a/b").starts_with(&store_prefix("db", "a")));
        assert!(!database_prefix("lib/x").starts_with(&database_prefix("lib")));
        assert_ne!(store_prefix("db", "a%2Fb"), store_prefix("db", "a/b"));
    }

    #[test]
    fn test_key_encoding_is_lossless() {
        let keys = [
            Key::from(f64::INFINITY),
            Key::from(f64::NEG_INFINITY),
            Key::from(-1.5),
            Key::date(1_700_000_000_000.0),
            Key::from("s"),
            Key::binary(vec![0u8, 255]),
            Key::from(vec![Key::from(1), Key::from("x")]),
        ];
        for key in &keys {
            let encoded = encode_key(key).unwrap();
            assert_eq!(&decode_key(&encoded).unwrap(), key);
        }
        assert_ne!(encode_key(&keys[0]).unwrap(), encode_key(&keys[1]).unwrap());
        assert_eq!(
            encode_key(&Key::from(-0.0)).unwrap(),
            encode_key(&Key::from(0.0)).unwrap()
        );
        assert!(decode_key("{\"Number\":\"zz\"}").is_err());
    }

    #[test]
    fn test_relaxed_writes_are_replayed() {
        let backend = FlakyBackend {
            inner: MemoryBackend::new(),
            failures: 2,
        };
        let mut persistence = Persistence::new(Box::new(backend), 1);

        persistence.write(vec![set("k1", "v1")], false).unwrap();
        assert_eq!(persistence.pending(), 1);

        persistence.write(vec![set("k2", "v2")], false).unwrap();
        assert_eq!(persistence.pending(), 2);

        persistence.checkpoint().unwrap();
        assert_eq!(persistence.pending(), 0);
        assert_eq!(persistence.backend().get("k2").unwrap(), Some("v2".into()));
    }

    #[test]
    fn test_strict_write_fails_after_retries() {
        let backend = FlakyBackend {
            inner: MemoryBackend::new(),
            failures: 3,
        };
        let mut persistence = Persistence::new(Box::new(backend), 3);

        let err = persistence.write(vec![set("k", "v")], true).unwrap_err();
        assert_eq!(err.name(), "UnknownError");
        assert_eq!(persistence.pending(), 0);

        persistence.write(vec![set("k", "v")], true).unwrap();
        assert_eq!(persistence.backend().get("k").unwrap(), Some("v".into()));
    }
}
