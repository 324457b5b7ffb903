//! The engine: databases, connections, transactions, requests, and the
//! event loop that drives them.
//!
//! Every handle given out (connections, transactions, requests, cursors,
//! store and index handles) is a plain id resolved against the factory on
//! each call. Reaction handlers receive `&mut IDBFactory`, so they can
//! issue further requests the same way top-level code does.

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::cursor::{CursorDirection, IDBCursor};
use crate::database::Database;
use crate::error::{IDBError, Result};
use crate::ids::{ConnectionId, CursorId, RequestId, TransactionId};
use crate::key::Key;
use crate::key_path::KeyPath;
use crate::key_range::KeyRange;
use crate::object_store::ObjectStore;
use crate::persistence::{catalog_key, database_prefix, PendingWrite, Persistence, StorageBackend};
use crate::request::{
    ErrorDisposition, IDBIndex, IDBObjectStore, IDBRequest, ReadyState, RequestResult, Source,
    UpgradeContext,
};
use crate::transaction::{
    Durability, IDBTransaction, Operation, QueuedOperation, TransactionMode, TransactionState,
};
use crate::undo::UndoLog;

// ==================== Events ====================

/// IDBFactory events.
#[derive(Debug, Clone, PartialEq)]
pub enum IDBEvent {
    /// Upgrade needed.
    UpgradeNeeded {
        db_name: String,
        old_version: u64,
        new_version: u64,
    },
    /// Database opened.
    Success { db_name: String },
    /// Open failed.
    Error { db_name: String, error: IDBError },
    /// Upgrade or deletion waits for other connections to close.
    Blocked {
        db_name: String,
        old_version: u64,
        new_version: Option<u64>,
    },
    /// Sent to an open connection that stands in the way of an upgrade or deletion.
    VersionChange {
        db_name: String,
        connection: ConnectionId,
        old_version: u64,
        new_version: Option<u64>,
    },
    TransactionComplete {
        db_name: String,
        transaction: TransactionId,
    },
    TransactionAbort {
        db_name: String,
        transaction: TransactionId,
        error: Option<IDBError>,
    },
    /// Database deleted.
    Deleted { db_name: String },
}

/// Database info for databases() API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

pub type TransactionHandler = Box<dyn FnMut(&mut IDBFactory, TransactionId)>;
pub type VersionChangeHandler = Box<dyn FnMut(&mut IDBFactory, ConnectionId, u64, Option<u64>)>;

// ==================== Internal state ====================

struct Connection {
    db_name: String,
    version: u64,
    close_pending: bool,
    on_version_change: Option<VersionChangeHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionRequestKind {
    Open { version: Option<u64> },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionRequestState {
    Queued,
    /// Other connections were told to close and have not yet.
    Blocked,
    Upgrading(TransactionId),
}

/// A pending open or delete.
#[derive(Debug)]
struct ConnectionRequest {
    request: RequestId,
    db_name: String,
    kind: ConnectionRequestKind,
    state: ConnectionRequestState,
}

// ==================== IDBFactory ====================

/// IDBFactory (window.indexedDB).
pub struct IDBFactory {
    config: EngineConfig,

    /// Databases.
    databases: HashMap<String, Database>,

    connections: HashMap<ConnectionId, Connection>,
    transactions: HashMap<TransactionId, IDBTransaction>,
    requests: HashMap<RequestId, IDBRequest>,
    cursors: HashMap<CursorId, IDBCursor>,

    /// Opens and deletes, in submission order.
    connection_requests: VecDeque<ConnectionRequest>,

    /// Transactions created since control last returned to the event loop.
    new_transactions: Vec<TransactionId>,

    on_complete: HashMap<TransactionId, TransactionHandler>,
    on_abort: HashMap<TransactionId, TransactionHandler>,

    persistence: Option<Persistence>,

    /// Event sender.
    event_tx: mpsc::UnboundedSender<IDBEvent>,
}

impl IDBFactory {
    /// Create a new in-memory factory.
    pub fn new(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<IDBEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                config,
                databases: HashMap::new(),
                connections: HashMap::new(),
                transactions: HashMap::new(),
                requests: HashMap::new(),
                cursors: HashMap::new(),
                connection_requests: VecDeque::new(),
                new_transactions: Vec::new(),
                on_complete: HashMap::new(),
                on_abort: HashMap::new(),
                persistence: None,
                event_tx,
            },
            event_rx,
        )
    }

    /// Create a factory that persists into `backend`, loading the
    /// databases already stored there.
    pub fn with_backend(
        config: EngineConfig,
        backend: Box<dyn StorageBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IDBEvent>)> {
        let (mut factory, event_rx) = Self::new(config);
        let persistence = Persistence::new(backend, factory.config.flush_attempts);

        for (name, catalog) in persistence.load_catalogs()? {
            let db = Database::from_catalog(
                &name,
                catalog,
                factory.config.tombstone_ratio,
                |store| persistence.load_records(&name, store),
            )?;
            info!(db = %name, version = db.version, stores = db.stores.len(), "Loaded database");
            factory.databases.insert(name, db);
        }

        factory.persistence = Some(persistence);
        Ok((factory, event_rx))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, event: IDBEvent) {
        let _ = self.event_tx.send(event);
    }

    // ==================== Databases ====================

    /// Open a database. `None` opens the current version, or 1 for a new
    /// database. The request succeeds with a connection.
    pub fn open(&mut self, name: &str, version: Option<u64>) -> Result<RequestId> {
        if version == Some(0) {
            return Err(IDBError::TypeError("Version must be greater than 0".into()));
        }
        let request = IDBRequest::new(None, None, None);
        let id = request.id;
        self.requests.insert(id, request);
        self.connection_requests.push_back(ConnectionRequest {
            request: id,
            db_name: name.to_string(),
            kind: ConnectionRequestKind::Open { version },
            state: ConnectionRequestState::Queued,
        });
        Ok(id)
    }

    /// Delete a database. The request succeeds with the old version.
    pub fn delete_database(&mut self, name: &str) -> Result<RequestId> {
        let request = IDBRequest::new(None, None, None);
        let id = request.id;
        self.requests.insert(id, request);
        self.connection_requests.push_back(ConnectionRequest {
            request: id,
            db_name: name.to_string(),
            kind: ConnectionRequestKind::Delete,
            state: ConnectionRequestState::Queued,
        });
        Ok(id)
    }

    /// Get database names and versions.
    pub fn databases(&self) -> Vec<DatabaseInfo> {
        let mut infos: Vec<DatabaseInfo> = self
            .databases
            .values()
            .filter(|db| db.version > 0)
            .map(|db| DatabaseInfo {
                name: db.name.clone(),
                version: db.version,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Close a connection once its transactions finish.
    pub fn close(&mut self, connection: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&connection) {
            if !conn.close_pending {
                conn.close_pending = true;
                debug!(%connection, db = %conn.db_name, "Connection closing");
            }
        }
    }

    /// Handle `versionchange` notifications sent to a connection.
    pub fn on_version_change<F>(&mut self, connection: ConnectionId, handler: F)
    where
        F: FnMut(&mut IDBFactory, ConnectionId, u64, Option<u64>) + 'static,
    {
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.on_version_change = Some(Box::new(handler));
        }
    }

    fn connection(&self, connection: ConnectionId) -> Result<&Connection> {
        self.connections
            .get(&connection)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown connection {}", connection)))
    }

    /// Version a connection was opened at.
    pub fn version(&self, connection: ConnectionId) -> Result<u64> {
        Ok(self.connection(connection)?.version)
    }

    /// Database a connection belongs to.
    pub fn database(&self, connection: ConnectionId) -> Result<&Database> {
        let conn = self.connection(connection)?;
        self.databases
            .get(&conn.db_name)
            .ok_or_else(|| IDBError::invalid_state(format!("Database '{}' is gone", conn.db_name)))
    }

    pub fn object_store_names(&self, connection: ConnectionId) -> Result<Vec<String>> {
        Ok(self.database(connection)?.object_store_names())
    }

    fn is_closed(&self, id: ConnectionId, conn: &Connection) -> bool {
        conn.close_pending
            && !self
                .transactions
                .values()
                .any(|txn| txn.connection == id && !txn.is_finished())
    }

    /// Connections to `db_name` that are not yet closed.
    fn open_connections(&self, db_name: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(id, conn)| conn.db_name == db_name && !self.is_closed(**id, conn))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    // ==================== Transactions ====================

    /// Start a transaction over `store_names`.
    pub fn transaction(
        &mut self,
        connection: ConnectionId,
        store_names: &[&str],
        mode: TransactionMode,
    ) -> Result<TransactionId> {
        let durability = self.config.default_durability;
        self.transaction_with_durability(connection, store_names, mode, durability)
    }

    pub fn transaction_with_durability(
        &mut self,
        connection: ConnectionId,
        store_names: &[&str],
        mode: TransactionMode,
        durability: Durability,
    ) -> Result<TransactionId> {
        let conn = self.connection(connection)?;
        if conn.close_pending {
            return Err(IDBError::invalid_state("Connection is closing"));
        }
        let db_name = conn.db_name.clone();
        let db = self.database(connection)?;
        if db.upgrade.is_some() {
            return Err(IDBError::invalid_state(
                "A version change transaction is running",
            ));
        }
        if mode == TransactionMode::VersionChange {
            return Err(IDBError::TypeError(
                "versionchange transactions are created by open()".into(),
            ));
        }
        if store_names.is_empty() {
            return Err(IDBError::InvalidAccessError(
                "A transaction needs at least one object store".into(),
            ));
        }
        let mut scope = Vec::with_capacity(store_names.len());
        for name in store_names {
            if !db.stores.contains_key(*name) {
                return Err(IDBError::not_found(format!("Object store not found: {}", name)));
            }
            scope.push(name.to_string());
        }
        scope.sort();
        scope.dedup();

        let txn = IDBTransaction::new(connection, &db_name, mode, scope, durability);
        let id = txn.id;
        if let Some(db) = self.databases.get_mut(&db_name) {
            db.scheduler.submit(id, &txn.scope, mode);
        }
        debug!(txn = %id, db = %db_name, ?mode, scope = ?txn.scope, "Transaction created");
        self.transactions.insert(id, txn);
        self.new_transactions.push(id);
        Ok(id)
    }

    /// Look up a transaction.
    pub fn get_transaction(&self, id: TransactionId) -> Option<&IDBTransaction> {
        self.transactions.get(&id)
    }

    fn txn(&self, id: TransactionId) -> Result<&IDBTransaction> {
        self.transactions
            .get(&id)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown transaction {}", id)))
    }

    fn txn_mut(&mut self, id: TransactionId) -> Result<&mut IDBTransaction> {
        self.transactions
            .get_mut(&id)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown transaction {}", id)))
    }

    pub fn transaction_state(&self, id: TransactionId) -> Result<TransactionState> {
        Ok(self.txn(id)?.state)
    }

    /// Get a store handle within a transaction.
    pub fn object_store(&self, transaction: TransactionId, name: &str) -> Result<IDBObjectStore> {
        let txn = self.txn(transaction)?;
        if txn.is_finished() {
            return Err(IDBError::invalid_state("Transaction has finished"));
        }
        if !txn.has_store(name) {
            return Err(IDBError::not_found(format!(
                "Object store '{}' is not in the transaction's scope",
                name
            )));
        }
        let store = self
            .databases
            .get(&txn.db_name)
            .and_then(|db| db.stores.get(name))
            .ok_or_else(|| IDBError::not_found(format!("Object store not found: {}", name)))?;
        Ok(IDBObjectStore {
            transaction,
            id: store.id,
            name: name.to_string(),
        })
    }

    /// Get an index handle.
    pub fn index(&self, store: &IDBObjectStore, name: &str) -> Result<IDBIndex> {
        let object_store = self.resolve_store(store)?;
        if self.txn(store.transaction)?.is_finished() {
            return Err(IDBError::invalid_state("Transaction has finished"));
        }
        let index = object_store
            .index(name)
            .ok_or_else(|| IDBError::not_found(format!("Index not found: {}", name)))?;
        Ok(IDBIndex {
            store: store.clone(),
            id: index.id,
            name: name.to_string(),
        })
    }

    /// Index names of a store, sorted.
    pub fn index_names(&self, store: &IDBObjectStore) -> Result<Vec<String>> {
        Ok(self.resolve_store(store)?.index_names())
    }

    /// Abort a transaction, undoing its changes.
    pub fn abort(&mut self, transaction: TransactionId) -> Result<()> {
        let state = self.txn(transaction)?.state;
        match state {
            TransactionState::Finished | TransactionState::Committing => Err(
                IDBError::invalid_state("Transaction is committing or has finished"),
            ),
            _ => {
                self.abort_transaction(transaction, None);
                Ok(())
            }
        }
    }

    /// Commit once the already queued requests have run.
    pub fn commit(&mut self, transaction: TransactionId) -> Result<()> {
        let txn = self.txn_mut(transaction)?;
        if txn.state != TransactionState::Active {
            return Err(IDBError::invalid_state("Transaction is not active"));
        }
        txn.state = TransactionState::Committing;
        debug!(txn = %transaction, "Commit requested");
        Ok(())
    }

    /// Drop a finished transaction along with the requests and handlers
    /// issued in it. Their results can no longer be read.
    pub fn forget_transaction(&mut self, id: TransactionId) -> Result<()> {
        if !self.txn(id)?.is_finished() {
            return Err(IDBError::invalid_state(format!(
                "Transaction {} has not finished",
                id
            )));
        }
        self.transactions.remove(&id);
        self.requests.retain(|_, request| request.transaction != Some(id));
        self.cursors.retain(|_, cursor| cursor.transaction != id);
        self.on_complete.remove(&id);
        self.on_abort.remove(&id);
        trace!(txn = %id, "Transaction released");
        Ok(())
    }

    pub fn on_complete<F>(&mut self, transaction: TransactionId, handler: F)
    where
        F: FnMut(&mut IDBFactory, TransactionId) + 'static,
    {
        self.on_complete.insert(transaction, Box::new(handler));
    }

    pub fn on_abort<F>(&mut self, transaction: TransactionId, handler: F)
    where
        F: FnMut(&mut IDBFactory, TransactionId) + 'static,
    {
        self.on_abort.insert(transaction, Box::new(handler));
    }

    // ==================== Schema ====================

    /// The database and undo log of an active `versionchange` transaction.
    fn versionchange(&mut self, transaction: TransactionId) -> Result<(&mut Database, &mut UndoLog)> {
        let txn = self
            .transactions
            .get_mut(&transaction)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown transaction {}", transaction)))?;
        if txn.mode != TransactionMode::VersionChange {
            return Err(IDBError::invalid_state(
                "Schema changes need a versionchange transaction",
            ));
        }
        if txn.state != TransactionState::Active {
            return Err(IDBError::TransactionInactiveError);
        }
        let db = self
            .databases
            .get_mut(&txn.db_name)
            .ok_or_else(|| IDBError::invalid_state("Database is gone"))?;
        Ok((db, &mut txn.undo))
    }

    /// Create an object store.
    pub fn create_object_store(
        &mut self,
        transaction: TransactionId,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<IDBObjectStore> {
        let (db, undo) = self.versionchange(transaction)?;
        let id = db.create_object_store(name, key_path, auto_increment, undo)?.id;
        debug!(db = %db.name, store = %name, "Object store created");
        Ok(IDBObjectStore {
            transaction,
            id,
            name: name.to_string(),
        })
    }

    /// Delete an object store.
    pub fn delete_object_store(&mut self, transaction: TransactionId, name: &str) -> Result<()> {
        let (db, undo) = self.versionchange(transaction)?;
        db.delete_object_store(name, undo)?;
        debug!(db = %db.name, store = %name, "Object store deleted");
        Ok(())
    }

    /// Create an index. Existing records are indexed by a queued backfill;
    /// if they violate the index's constraints the transaction aborts.
    pub fn create_index(
        &mut self,
        store: &IDBObjectStore,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<IDBIndex> {
        self.resolve_store(store)?;
        let (db, undo) = self.versionchange(store.transaction)?;
        let id = db
            .create_index(&store.name, name, key_path, unique, multi_entry, undo)?
            .id;
        self.txn_mut(store.transaction)?.enqueue(
            None,
            Operation::BackfillIndex {
                store: store.name.clone(),
                index: name.to_string(),
            },
        );
        debug!(store = %store.name, index = %name, unique, multi_entry, "Index created");
        Ok(IDBIndex {
            store: store.clone(),
            id,
            name: name.to_string(),
        })
    }

    /// Delete an index.
    pub fn delete_index(&mut self, store: &IDBObjectStore, name: &str) -> Result<()> {
        self.resolve_store(store)?;
        let (db, undo) = self.versionchange(store.transaction)?;
        db.delete_index(&store.name, name, undo)
    }

    // ==================== Requests ====================

    fn resolve_store(&self, handle: &IDBObjectStore) -> Result<&ObjectStore> {
        let txn = self.txn(handle.transaction)?;
        self.databases
            .get(&txn.db_name)
            .and_then(|db| db.stores.get(&handle.name))
            .filter(|store| store.id == handle.id)
            .ok_or_else(|| {
                IDBError::invalid_state(format!("Object store '{}' was deleted", handle.name))
            })
    }

    /// Checks shared by every request: the source still exists, then the
    /// transaction is active, then it may write.
    fn check_source(&self, source: &Source, write: bool) -> Result<&ObjectStore> {
        let store = self.resolve_store(source.store())?;
        if let Source::Index(index) = source {
            store
                .index(&index.name)
                .filter(|i| i.id == index.id)
                .ok_or_else(|| IDBError::invalid_state(format!("Index '{}' was deleted", index.name)))?;
        }
        self.txn(source.transaction())?.check_request(write)?;
        Ok(store)
    }

    fn enqueue(&mut self, request: IDBRequest, operation: Operation) -> Result<RequestId> {
        let id = request.id;
        let transaction = request
            .transaction
            .ok_or_else(|| IDBError::invalid_state("Request has no transaction"))?;
        trace!(txn = %transaction, request = %id, op = operation.kind(), "Request queued");
        self.txn_mut(transaction)?.enqueue(Some(id), operation);
        self.requests.insert(id, request);
        Ok(id)
    }

    fn source_request(&mut self, source: Source, operation: Operation) -> Result<RequestId> {
        let transaction = source.transaction();
        self.enqueue(IDBRequest::new(Some(source), None, Some(transaction)), operation)
    }

    /// Add a record; fails with `ConstraintError` if the key exists.
    pub fn add(&mut self, store: &IDBObjectStore, value: JsonValue, key: Option<Key>) -> Result<RequestId> {
        self.store_request(store, value, key, true)
    }

    /// Put (add or update) a record.
    pub fn put(&mut self, store: &IDBObjectStore, value: JsonValue, key: Option<Key>) -> Result<RequestId> {
        self.store_request(store, value, key, false)
    }

    fn store_request(
        &mut self,
        store: &IDBObjectStore,
        value: JsonValue,
        key: Option<Key>,
        no_overwrite: bool,
    ) -> Result<RequestId> {
        let source = Source::from(store);
        let object_store = self.check_source(&source, true)?;
        check_key_for_value(object_store, &value, key.as_ref())?;
        self.source_request(
            source,
            Operation::Put {
                store: store.name.clone(),
                value,
                key,
                no_overwrite,
            },
        )
    }

    /// Get the first value matching a key or range.
    pub fn get(&mut self, source: impl Into<Source>, query: impl Into<KeyRange>) -> Result<RequestId> {
        self.get_request(source.into(), query.into(), false)
    }

    /// Get the first primary key matching a key or range.
    pub fn get_key(&mut self, source: impl Into<Source>, query: impl Into<KeyRange>) -> Result<RequestId> {
        self.get_request(source.into(), query.into(), true)
    }

    fn get_request(&mut self, source: Source, range: KeyRange, key_only: bool) -> Result<RequestId> {
        self.check_source(&source, false)?;
        range.validate()?;
        if range.is_unbounded() {
            return Err(IDBError::data("A key or bounded key range is required"));
        }
        self.source_request(
            source.clone(),
            Operation::Get {
                source,
                range,
                key_only,
            },
        )
    }

    /// Get values in a range (all when `None`), at most `count` (all when `None` or 0).
    pub fn get_all(
        &mut self,
        source: impl Into<Source>,
        query: Option<KeyRange>,
        count: Option<usize>,
    ) -> Result<RequestId> {
        self.get_all_request(source.into(), query, count, false)
    }

    /// Get primary keys in a range.
    pub fn get_all_keys(
        &mut self,
        source: impl Into<Source>,
        query: Option<KeyRange>,
        count: Option<usize>,
    ) -> Result<RequestId> {
        self.get_all_request(source.into(), query, count, true)
    }

    fn get_all_request(
        &mut self,
        source: Source,
        query: Option<KeyRange>,
        count: Option<usize>,
        key_only: bool,
    ) -> Result<RequestId> {
        self.check_source(&source, false)?;
        let range = query.unwrap_or_default();
        range.validate()?;
        self.source_request(
            source.clone(),
            Operation::GetAll {
                source,
                range,
                count: count.filter(|&n| n > 0),
                key_only,
            },
        )
    }

    /// Count records in a range.
    pub fn count(&mut self, source: impl Into<Source>, query: Option<KeyRange>) -> Result<RequestId> {
        let source = source.into();
        self.check_source(&source, false)?;
        let range = query.unwrap_or_default();
        range.validate()?;
        self.source_request(source.clone(), Operation::Count { source, range })
    }

    /// Delete records matching a key or range.
    pub fn delete(&mut self, store: &IDBObjectStore, query: impl Into<KeyRange>) -> Result<RequestId> {
        let source = Source::from(store);
        self.check_source(&source, true)?;
        let range = query.into();
        range.validate()?;
        if range.is_unbounded() {
            return Err(IDBError::data("A key or bounded key range is required"));
        }
        self.source_request(
            source,
            Operation::Delete {
                store: store.name.clone(),
                range,
            },
        )
    }

    /// Delete every record.
    pub fn clear(&mut self, store: &IDBObjectStore) -> Result<RequestId> {
        let source = Source::from(store);
        self.check_source(&source, true)?;
        self.source_request(
            source,
            Operation::Clear {
                store: store.name.clone(),
            },
        )
    }

    // ==================== Cursors ====================

    /// Open a cursor. The request succeeds with the cursor, or with none
    /// if the range is empty.
    pub fn open_cursor(
        &mut self,
        source: impl Into<Source>,
        query: Option<KeyRange>,
        direction: CursorDirection,
    ) -> Result<RequestId> {
        self.cursor_request(source.into(), query, direction, false)
    }

    /// Open a cursor that does not load values.
    pub fn open_key_cursor(
        &mut self,
        source: impl Into<Source>,
        query: Option<KeyRange>,
        direction: CursorDirection,
    ) -> Result<RequestId> {
        self.cursor_request(source.into(), query, direction, true)
    }

    fn cursor_request(
        &mut self,
        source: Source,
        query: Option<KeyRange>,
        direction: CursorDirection,
        key_only: bool,
    ) -> Result<RequestId> {
        self.check_source(&source, false)?;
        let range = query.unwrap_or_default();
        range.validate()?;

        let transaction = source.transaction();
        let mut request = IDBRequest::new(Some(source.clone()), None, Some(transaction));
        let cursor = IDBCursor::new(source, range, direction, key_only, request.id);
        let cursor_id = cursor.id;
        request.cursor = Some(cursor_id);
        self.cursors.insert(cursor_id, cursor);
        self.enqueue(
            request,
            Operation::Iterate {
                cursor: cursor_id,
                key: None,
                primary_key: None,
                count: 1,
            },
        )
    }

    /// Look up a cursor.
    pub fn cursor(&self, id: CursorId) -> Result<&IDBCursor> {
        self.cursors
            .get(&id)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown cursor {}", id)))
    }

    /// Advance to the next record, or to the first at or past `key`. The
    /// cursor's request fires again.
    pub fn continue_cursor(&mut self, id: CursorId, key: Option<Key>) -> Result<()> {
        let cursor = self.cursor(id)?;
        self.check_source(&cursor.source, false)?;
        cursor.check_continue(key.as_ref())?;
        self.requeue_cursor(id, key, None, 1)
    }

    /// Advance an index cursor to `(key, primary_key)` or past it.
    pub fn continue_primary_key(&mut self, id: CursorId, key: Key, primary_key: Key) -> Result<()> {
        let cursor = self.cursor(id)?;
        self.check_source(&cursor.source, false)?;
        cursor.check_continue_primary_key(&key, &primary_key)?;
        self.requeue_cursor(id, Some(key), Some(primary_key), 1)
    }

    /// Skip `count` records.
    pub fn advance(&mut self, id: CursorId, count: u32) -> Result<()> {
        if count == 0 {
            return Err(IDBError::TypeError("Advance count must be positive".into()));
        }
        let cursor = self.cursor(id)?;
        self.check_source(&cursor.source, false)?;
        cursor.check_continue(None)?;
        self.requeue_cursor(id, None, None, count)
    }

    fn requeue_cursor(
        &mut self,
        id: CursorId,
        key: Option<Key>,
        primary_key: Option<Key>,
        count: u32,
    ) -> Result<()> {
        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown cursor {}", id)))?;
        cursor.got_value = false;
        let (request, transaction) = (cursor.request, cursor.transaction);
        if let Some(req) = self.requests.get_mut(&request) {
            req.reset();
        }
        self.txn_mut(transaction)?.enqueue(
            Some(request),
            Operation::Iterate {
                cursor: id,
                key,
                primary_key,
                count,
            },
        );
        Ok(())
    }

    /// Replace the record under the cursor.
    pub fn cursor_update(&mut self, id: CursorId, value: JsonValue) -> Result<RequestId> {
        let (source, primary_key) = self.positioned_for_write(id)?;
        let store = self.resolve_store(source.store())?;
        let key = if store.key_path.is_inline() {
            match store.key_path.extract(&value)? {
                Some(key) if key == primary_key => None,
                _ => {
                    return Err(IDBError::data(
                        "Updated value's key does not match the cursor's primary key",
                    ))
                }
            }
        } else {
            Some(primary_key)
        };
        let transaction = source.transaction();
        let store_name = source.store_name().to_string();
        self.enqueue(
            IDBRequest::new(Some(source), Some(id), Some(transaction)),
            Operation::Put {
                store: store_name,
                value,
                key,
                no_overwrite: false,
            },
        )
    }

    /// Delete the record under the cursor.
    pub fn cursor_delete(&mut self, id: CursorId) -> Result<RequestId> {
        let (source, primary_key) = self.positioned_for_write(id)?;
        let transaction = source.transaction();
        let store_name = source.store_name().to_string();
        self.enqueue(
            IDBRequest::new(Some(source), Some(id), Some(transaction)),
            Operation::Delete {
                store: store_name,
                range: KeyRange::from(primary_key),
            },
        )
    }

    fn positioned_for_write(&self, id: CursorId) -> Result<(Source, Key)> {
        let cursor = self.cursor(id)?;
        self.check_source(&cursor.source, true)?;
        if !cursor.got_value {
            return Err(IDBError::invalid_state("Cursor has no current record"));
        }
        if cursor.is_key_only() {
            return Err(IDBError::invalid_state("Key cursors cannot modify records"));
        }
        let primary_key = cursor
            .primary_key()
            .cloned()
            .ok_or_else(|| IDBError::invalid_state("Cursor has no current record"))?;
        Ok((cursor.source.clone(), primary_key))
    }

    // ==================== Request state ====================

    /// Look up a request.
    pub fn request(&self, id: RequestId) -> Result<&IDBRequest> {
        self.requests
            .get(&id)
            .ok_or_else(|| IDBError::invalid_state(format!("Unknown request {}", id)))
    }

    pub fn ready_state(&self, id: RequestId) -> Result<ReadyState> {
        Ok(self.request(id)?.ready_state())
    }

    /// Result of a finished request.
    pub fn result(&self, id: RequestId) -> Result<&RequestResult> {
        self.request(id)?.result()
    }

    /// Error of a finished request.
    pub fn error(&self, id: RequestId) -> Result<Option<&IDBError>> {
        self.request(id)?.error()
    }

    /// Drop a settled request that no running transaction still uses,
    /// such as a finished open or delete.
    pub fn forget_request(&mut self, id: RequestId) -> Result<()> {
        let request = self.request(id)?;
        let in_use = request.ready_state == ReadyState::Pending
            || request
                .transaction
                .and_then(|txn| self.transactions.get(&txn))
                .is_some_and(|txn| !txn.is_finished());
        if in_use {
            return Err(IDBError::invalid_state(format!("Request {} is still in use", id)));
        }
        self.requests.remove(&id);
        Ok(())
    }

    pub fn on_success<F>(&mut self, id: RequestId, handler: F)
    where
        F: FnMut(&mut IDBFactory, RequestId) -> Result<()> + 'static,
    {
        if let Some(request) = self.requests.get_mut(&id) {
            request.on_success = Some(Box::new(handler));
        }
    }

    pub fn on_error<F>(&mut self, id: RequestId, handler: F)
    where
        F: FnMut(&mut IDBFactory, RequestId, &IDBError) -> ErrorDisposition + 'static,
    {
        if let Some(request) = self.requests.get_mut(&id) {
            request.on_error = Some(Box::new(handler));
        }
    }

    /// Run schema changes when an open request upgrades the database.
    pub fn on_upgrade_needed<F>(&mut self, id: RequestId, handler: F)
    where
        F: FnOnce(&mut IDBFactory, UpgradeContext) -> Result<()> + 'static,
    {
        if let Some(request) = self.requests.get_mut(&id) {
            request.on_upgrade_needed = Some(Box::new(handler));
        }
    }

    // ==================== Event loop ====================

    /// Run until no open request, transaction or queued operation can
    /// make progress.
    ///
    /// Each turn admits what the schedulers allow and runs one queued
    /// operation per running transaction, so handlers of one request may
    /// queue more work before the next operation runs.
    pub fn run_until_idle(&mut self) {
        self.deactivate_new_transactions();
        loop {
            let mut progress = self.process_connection_requests();
            progress |= self.admit_transactions();
            for id in self.running_transactions() {
                progress |= self.step_transaction(id);
            }
            if !progress {
                break;
            }
        }
    }

    fn deactivate_new_transactions(&mut self) {
        for id in std::mem::take(&mut self.new_transactions) {
            if let Some(txn) = self.transactions.get_mut(&id) {
                txn.deactivate();
            }
        }
    }

    fn set_active(&mut self, transaction: Option<TransactionId>, active: bool) {
        let Some(txn) = transaction.and_then(|id| self.transactions.get_mut(&id)) else {
            return;
        };
        if active {
            txn.activate();
        } else {
            txn.deactivate();
        }
    }

    fn admit_transactions(&mut self) -> bool {
        let mut admitted = Vec::new();
        for db in self.databases.values_mut() {
            admitted.extend(db.scheduler.admit());
        }
        for id in &admitted {
            if let Some(txn) = self.transactions.get_mut(id) {
                txn.started = true;
            }
        }
        !admitted.is_empty()
    }

    fn running_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self
            .transactions
            .values()
            .filter(|txn| txn.started && !txn.is_finished())
            .map(|txn| txn.id)
            .collect();
        ids.sort();
        ids
    }

    /// Run one queued operation, or commit a drained transaction.
    fn step_transaction(&mut self, id: TransactionId) -> bool {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return false;
        };
        if !txn.started || txn.is_finished() {
            return false;
        }
        let state = txn.state;
        match txn.queue.pop_front() {
            Some(queued) => {
                self.execute(id, queued);
                true
            }
            None if state != TransactionState::Active => {
                self.commit_transaction(id);
                true
            }
            None => false,
        }
    }

    fn execute(&mut self, id: TransactionId, queued: QueuedOperation) {
        let QueuedOperation { request, operation } = queued;
        let kind = operation.kind();
        let outcome = {
            let Some(txn) = self.transactions.get_mut(&id) else {
                return;
            };
            let Some(db) = self.databases.get_mut(&txn.db_name) else {
                return;
            };
            operation.execute(&mut db.stores, &mut txn.undo, &mut self.cursors)
        };
        trace!(txn = %id, op = kind, ok = outcome.is_ok(), "Operation executed");

        let Some(request) = request else {
            // Index backfill failures cannot be handled.
            if let Err(error) = outcome {
                self.abort_transaction(id, Some(error));
            }
            return;
        };
        if let Some(req) = self.requests.get_mut(&request) {
            match outcome {
                Ok(result) => req.succeed(result),
                Err(error) => req.fail(error),
            }
        }
        self.dispatch(request);
    }

    /// Fire a finished request's handler with its transaction active.
    fn dispatch(&mut self, id: RequestId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        let transaction = request.transaction;

        match request.error.clone() {
            None => {
                let Some(mut handler) = request.on_success.take() else {
                    return;
                };
                self.set_active(transaction, true);
                let outcome = handler(self, id);
                let repeats = self.fires_again(id);
                if let Some(request) = self.requests.get_mut(&id) {
                    if repeats && request.on_success.is_none() {
                        request.on_success = Some(handler);
                    }
                }
                self.set_active(transaction, false);
                self.deactivate_new_transactions();

                if let (Err(error), Some(txn)) = (outcome, transaction) {
                    self.abort_transaction(txn, Some(error));
                }
            }
            Some(error) => {
                let disposition = match request.on_error.take() {
                    Some(mut handler) => {
                        self.set_active(transaction, true);
                        let disposition = handler(self, id, &error);
                        let repeats = self.fires_again(id);
                        if let Some(request) = self.requests.get_mut(&id) {
                            if repeats && request.on_error.is_none() {
                                request.on_error = Some(handler);
                            }
                        }
                        self.set_active(transaction, false);
                        self.deactivate_new_transactions();
                        disposition
                    }
                    None => ErrorDisposition::Default,
                };

                if disposition == ErrorDisposition::Default {
                    if let Some(txn) = transaction {
                        self.abort_transaction(txn, Some(error));
                    }
                }
            }
        }
    }

    /// Only a live cursor's own request can settle more than once.
    fn fires_again(&self, id: RequestId) -> bool {
        self.requests
            .get(&id)
            .and_then(|request| request.cursor)
            .and_then(|cursor| self.cursors.get(&cursor))
            .is_some_and(|cursor| cursor.request == id)
    }

    /// Drop the handlers of a finished transaction's requests.
    fn release_handlers(&mut self, transaction: TransactionId) {
        for request in self.requests.values_mut() {
            if request.transaction == Some(transaction) {
                request.on_success = None;
                request.on_error = None;
            }
        }
    }

    fn commit_transaction(&mut self, id: TransactionId) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        txn.state = TransactionState::Committing;

        if let Some(persistence) = self.persistence.as_mut() {
            let strict = txn.durability == Durability::Strict;
            let flushed = match self.databases.get(&txn.db_name) {
                Some(db) => db
                    .writes_for(&txn.undo)
                    .and_then(|writes| persistence.write(writes, strict)),
                None => Ok(()),
            };
            if let Err(error) = flushed {
                self.abort_transaction(id, Some(error));
                return;
            }
        }

        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        txn.state = TransactionState::Finished;
        txn.undo = UndoLog::new();
        let db_name = txn.db_name.clone();
        let mode = txn.mode;
        if let Some(db) = self.databases.get_mut(&db_name) {
            db.scheduler.finish(id);
            if db.upgrade == Some(id) {
                db.upgrade = None;
            }
        }
        self.cursors.retain(|_, cursor| cursor.transaction != id);
        debug!(txn = %id, db = %db_name, "Transaction committed");

        if let Some(mut handler) = self.on_complete.remove(&id) {
            handler(self, id);
        }
        self.emit(IDBEvent::TransactionComplete {
            db_name,
            transaction: id,
        });
        if mode == TransactionMode::VersionChange {
            self.finish_upgrade(id, true);
        }
        self.release_handlers(id);
    }

    /// Roll back and finish a transaction. Queued requests fail with
    /// `AbortError` before the abort handler runs.
    fn abort_transaction(&mut self, id: TransactionId, error: Option<IDBError>) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if txn.is_finished() {
            return;
        }
        txn.state = TransactionState::Finished;
        txn.error = error.clone();
        let undo = std::mem::take(&mut txn.undo);
        let queued: Vec<QueuedOperation> = txn.queue.drain(..).collect();
        let db_name = txn.db_name.clone();
        let mode = txn.mode;
        warn!(txn = %id, db = %db_name, error = ?error, "Transaction aborted");

        if let Some(db) = self.databases.get_mut(&db_name) {
            db.rollback(undo);
            db.scheduler.finish(id);
            if db.upgrade == Some(id) {
                db.upgrade = None;
            }
        }
        self.cursors.retain(|_, cursor| cursor.transaction != id);

        for request in queued.into_iter().filter_map(|q| q.request) {
            if let Some(req) = self.requests.get_mut(&request) {
                req.fail(IDBError::AbortError("Transaction was aborted".into()));
            }
            self.dispatch(request);
        }

        if let Some(mut handler) = self.on_abort.remove(&id) {
            handler(self, id);
        }
        self.on_complete.remove(&id);
        self.emit(IDBEvent::TransactionAbort {
            db_name,
            transaction: id,
            error,
        });
        if mode == TransactionMode::VersionChange {
            self.finish_upgrade(id, false);
        }
        self.release_handlers(id);
    }

    // ==================== Opens and deletes ====================

    fn process_connection_requests(&mut self) -> bool {
        // Only the oldest request per database may proceed.
        let mut heads: Vec<(String, RequestId)> = Vec::new();
        for entry in &self.connection_requests {
            if !heads.iter().any(|(name, _)| *name == entry.db_name) {
                heads.push((entry.db_name.clone(), entry.request));
            }
        }

        let mut progress = false;
        for (_, request) in heads {
            progress |= self.advance_connection_request(request);
        }
        progress
    }

    fn connection_request(&mut self, request: RequestId) -> Option<&mut ConnectionRequest> {
        self.connection_requests
            .iter_mut()
            .find(|entry| entry.request == request)
    }

    fn take_connection_request(&mut self, request: RequestId) -> Option<ConnectionRequest> {
        let position = self
            .connection_requests
            .iter()
            .position(|entry| entry.request == request)?;
        self.connection_requests.remove(position)
    }

    fn advance_connection_request(&mut self, request: RequestId) -> bool {
        let Some(entry) = self.connection_request(request) else {
            return false;
        };
        let db_name = entry.db_name.clone();
        match (entry.kind, entry.state) {
            (_, ConnectionRequestState::Upgrading(_)) => false,
            (ConnectionRequestKind::Open { version }, state) => {
                self.advance_open(request, &db_name, version, state)
            }
            (ConnectionRequestKind::Delete, state) => self.advance_delete(request, &db_name, state),
        }
    }

    /// Ask open connections to close. Returns `Some(progress)` while some
    /// remain open, `None` once the way is clear.
    fn wait_for_connections(
        &mut self,
        request: RequestId,
        db_name: &str,
        state: ConnectionRequestState,
        old_version: u64,
        new_version: Option<u64>,
    ) -> Option<bool> {
        if self.open_connections(db_name).is_empty() {
            return None;
        }
        if state == ConnectionRequestState::Blocked {
            return Some(false);
        }

        for connection in self.open_connections(db_name) {
            self.emit(IDBEvent::VersionChange {
                db_name: db_name.to_string(),
                connection,
                old_version,
                new_version,
            });
            let handler = self
                .connections
                .get_mut(&connection)
                .and_then(|conn| conn.on_version_change.take());
            if let Some(mut handler) = handler {
                handler(self, connection, old_version, new_version);
                if let Some(conn) = self.connections.get_mut(&connection) {
                    if conn.on_version_change.is_none() {
                        conn.on_version_change = Some(handler);
                    }
                }
            }
        }
        if self.open_connections(db_name).is_empty() {
            return None;
        }

        info!(db = %db_name, old_version, ?new_version, "Blocked by open connections");
        self.emit(IDBEvent::Blocked {
            db_name: db_name.to_string(),
            old_version,
            new_version,
        });
        if let Some(entry) = self.connection_request(request) {
            entry.state = ConnectionRequestState::Blocked;
        }
        Some(true)
    }

    fn advance_open(
        &mut self,
        request: RequestId,
        db_name: &str,
        requested: Option<u64>,
        state: ConnectionRequestState,
    ) -> bool {
        let current = self.databases.get(db_name).map(|db| db.version);
        let old_version = current.unwrap_or(0);
        let version = requested.unwrap_or_else(|| old_version.max(1));

        if version < old_version {
            let error = IDBError::VersionError(format!(
                "Requested version {} is less than current version {}",
                version, old_version
            ));
            self.fail_connection_request(request, db_name, error);
            return true;
        }

        if version == old_version {
            let connection = self.add_connection(db_name, version);
            self.take_connection_request(request);
            if let Some(req) = self.requests.get_mut(&request) {
                req.succeed(RequestResult::Connection(connection));
            }
            info!(db = %db_name, version, "Database opened");
            self.emit(IDBEvent::Success {
                db_name: db_name.to_string(),
            });
            self.dispatch(request);
            return true;
        }

        if let Some(progress) =
            self.wait_for_connections(request, db_name, state, old_version, Some(version))
        {
            return progress;
        }
        self.start_upgrade(request, db_name, old_version, version);
        true
    }

    fn start_upgrade(&mut self, request: RequestId, db_name: &str, old_version: u64, new_version: u64) {
        let tombstone_ratio = self.config.tombstone_ratio;
        let durability = self.config.default_durability;
        let connection = self.add_connection(db_name, new_version);

        let db = self
            .databases
            .entry(db_name.to_string())
            .or_insert_with(|| Database::new(db_name, 0, tombstone_ratio));
        let mut txn = IDBTransaction::new(
            connection,
            db_name,
            TransactionMode::VersionChange,
            db.object_store_names(),
            durability,
        );
        let transaction = txn.id;
        db.set_version(new_version, &mut txn.undo);
        db.upgrade = Some(transaction);
        db.scheduler.submit(transaction, &txn.scope, TransactionMode::VersionChange);
        self.transactions.insert(transaction, txn);

        if let Some(entry) = self.connection_request(request) {
            entry.state = ConnectionRequestState::Upgrading(transaction);
        }
        let handler = self.requests.get_mut(&request).and_then(|req| {
            req.succeed(RequestResult::Connection(connection));
            req.transaction = Some(transaction);
            req.on_upgrade_needed.take()
        });

        info!(db = %db_name, old_version, new_version, "Upgrading database");
        self.emit(IDBEvent::UpgradeNeeded {
            db_name: db_name.to_string(),
            old_version,
            new_version,
        });

        let context = UpgradeContext {
            connection,
            transaction,
            old_version,
            new_version,
        };
        let outcome = match handler {
            Some(handler) => handler(self, context),
            None => Ok(()),
        };
        self.set_active(Some(transaction), false);
        self.deactivate_new_transactions();
        if let Err(error) = outcome {
            self.abort_transaction(transaction, Some(error));
        }
    }

    /// Settle the open request behind a finished `versionchange` transaction.
    fn finish_upgrade(&mut self, transaction: TransactionId, committed: bool) {
        let Some(position) = self
            .connection_requests
            .iter()
            .position(|entry| entry.state == ConnectionRequestState::Upgrading(transaction))
        else {
            return;
        };
        let Some(entry) = self.connection_requests.remove(position) else {
            return;
        };
        let db_name = entry.db_name;

        if committed {
            if let Some(req) = self.requests.get_mut(&entry.request) {
                req.transaction = None;
            }
            info!(db = %db_name, "Database upgraded");
            self.emit(IDBEvent::Success { db_name });
        } else {
            if let Some(connection) = self.get_transaction(transaction).map(|txn| txn.connection) {
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.close_pending = true;
                }
            }
            // A database created by the failed upgrade does not survive it.
            if self.databases.get(&db_name).is_some_and(|db| db.version == 0) {
                self.databases.remove(&db_name);
            }
            let error = IDBError::AbortError("Version change transaction was aborted".into());
            if let Some(req) = self.requests.get_mut(&entry.request) {
                req.transaction = None;
                req.fail(error.clone());
            }
            self.emit(IDBEvent::Error { db_name, error });
        }
        self.dispatch(entry.request);
    }

    fn advance_delete(&mut self, request: RequestId, db_name: &str, state: ConnectionRequestState) -> bool {
        let Some(old_version) = self.databases.get(db_name).map(|db| db.version) else {
            self.take_connection_request(request);
            if let Some(req) = self.requests.get_mut(&request) {
                req.succeed(RequestResult::Version(0));
            }
            self.dispatch(request);
            return true;
        };

        if let Some(progress) = self.wait_for_connections(request, db_name, state, old_version, None) {
            return progress;
        }

        self.databases.remove(db_name);
        if let Some(persistence) = self.persistence.as_mut() {
            let writes = vec![
                PendingWrite::DeletePrefix {
                    prefix: database_prefix(db_name),
                },
                PendingWrite::Delete {
                    key: catalog_key(db_name),
                },
            ];
            if let Err(e) = persistence.write(writes, false) {
                warn!(db = %db_name, error = %e, "Failed to delete persisted data");
            }
        }
        info!(db = %db_name, old_version, "Database deleted");
        self.emit(IDBEvent::Deleted {
            db_name: db_name.to_string(),
        });

        self.take_connection_request(request);
        if let Some(req) = self.requests.get_mut(&request) {
            req.succeed(RequestResult::Version(old_version));
        }
        self.dispatch(request);
        true
    }

    fn fail_connection_request(&mut self, request: RequestId, db_name: &str, error: IDBError) {
        self.take_connection_request(request);
        if let Some(req) = self.requests.get_mut(&request) {
            req.fail(error.clone());
        }
        warn!(db = %db_name, error = %error, "Open failed");
        self.emit(IDBEvent::Error {
            db_name: db_name.to_string(),
            error,
        });
        self.dispatch(request);
    }

    fn add_connection(&mut self, db_name: &str, version: u64) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            Connection {
                db_name: db_name.to_string(),
                version,
                close_pending: false,
                on_version_change: None,
            },
        );
        id
    }

    // ==================== Persistence ====================

    /// Flush writes that earlier commits could not.
    pub fn checkpoint(&mut self) -> Result<()> {
        match self.persistence.as_mut() {
            Some(persistence) => persistence.checkpoint(),
            None => Ok(()),
        }
    }

    /// Writes waiting for replay.
    pub fn pending_writes(&self) -> usize {
        self.persistence.as_ref().map_or(0, Persistence::pending)
    }

    /// Checkpoint and release the backend.
    pub fn shutdown(mut self) -> Result<()> {
        self.checkpoint()?;
        self.persistence = None;
        info!("IndexedDB engine shut down");
        Ok(())
    }
}

impl Default for IDBFactory {
    fn default() -> Self {
        Self::new(EngineConfig::default()).0
    }
}

/// Validate a value/key pair before a put is queued.
fn check_key_for_value(store: &ObjectStore, value: &JsonValue, key: Option<&Key>) -> Result<()> {
    if store.key_path.is_inline() {
        if key.is_some() {
            return Err(IDBError::data(
                "An explicit key is not allowed with an in-line key path",
            ));
        }
        match store.key_path.extract(value)? {
            Some(key) => key.validate(),
            None if store.auto_increment && store.key_path.can_inject(value) => Ok(()),
            None => Err(IDBError::data("The value does not contain a valid key")),
        }
    } else {
        match key {
            Some(key) => key.validate(),
            None if store.auto_increment => Ok(()),
            None => Err(IDBError::data("No key provided for an out-of-line store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Open `name` at version 1 with a `books` store keyed by `isbn`.
    fn open_library(factory: &mut IDBFactory) -> ConnectionId {
        let request = factory.open("library", Some(1)).unwrap();
        factory.on_upgrade_needed(request, |f, ctx| {
            let store = f.create_object_store(ctx.transaction, "books", KeyPath::from("isbn"), false)?;
            f.create_index(&store, "by_author", KeyPath::from("author"), false, false)?;
            Ok(())
        });
        factory.run_until_idle();
        factory.result(request).unwrap().as_connection().unwrap()
    }

    #[test]
    fn test_open_creates_database() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        assert_eq!(factory.version(connection).unwrap(), 1);
        assert_eq!(factory.object_store_names(connection).unwrap(), vec!["books"]);
        assert_eq!(
            factory.databases(),
            vec![DatabaseInfo {
                name: "library".into(),
                version: 1
            }]
        );
    }

    #[test]
    fn test_open_version_zero_is_type_error() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        assert!(matches!(
            factory.open("db", Some(0)),
            Err(IDBError::TypeError(_))
        ));
    }

    #[test]
    fn test_open_lower_version_fails() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);
        factory.close(connection);

        let request = factory.open("library", Some(2)).unwrap();
        factory.run_until_idle();
        assert!(factory.error(request).unwrap().is_none());

        let request = factory.open("library", Some(1)).unwrap();
        factory.run_until_idle();
        assert_eq!(factory.error(request).unwrap().map(IDBError::name), Some("VersionError"));
    }

    #[test]
    fn test_add_get_round_trip() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        let added = factory
            .add(&store, json!({"isbn": 1, "title": "A", "author": "x"}), None)
            .unwrap();
        let read = factory.get(&store, Key::from(1)).unwrap();
        assert_eq!(factory.ready_state(read).unwrap(), ReadyState::Pending);
        assert!(factory.result(read).is_err());

        factory.run_until_idle();
        assert_eq!(factory.result(added).unwrap().as_key(), Some(&Key::from(1)));
        assert_eq!(
            factory.result(read).unwrap().as_value(),
            Some(&json!({"isbn": 1, "title": "A", "author": "x"}))
        );
        assert_eq!(
            factory.transaction_state(txn).unwrap(),
            TransactionState::Finished
        );
    }

    #[test]
    fn test_requests_need_active_transaction() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadOnly)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        assert_eq!(
            factory.put(&store, json!({"isbn": 1}), None),
            Err(IDBError::ReadOnlyError)
        );
        assert!(matches!(
            factory.get(&store, KeyRange::unbounded()),
            Err(IDBError::DataError(_))
        ));

        factory.run_until_idle();
        assert_eq!(
            factory.count(&store, None),
            Err(IDBError::TransactionInactiveError)
        );
    }

    #[test]
    fn test_put_validation() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);
        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();

        assert!(matches!(
            factory.put(&store, json!({"isbn": 1}), Some(Key::from(1))),
            Err(IDBError::DataError(_))
        ));
        assert!(matches!(
            factory.put(&store, json!({"title": "no key"}), None),
            Err(IDBError::DataError(_))
        ));
        assert!(matches!(
            factory.put(&store, json!({"isbn": true}), None),
            Err(IDBError::DataError(_))
        ));
    }

    #[test]
    fn test_handler_chain_and_cursor() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        for (isbn, author) in [(1, "b"), (2, "a"), (3, "b")] {
            factory
                .add(&store, json!({"isbn": isbn, "author": author}), None)
                .unwrap();
        }
        let index = factory.index(&store, "by_author").unwrap();
        let request = factory
            .open_cursor(&index, None, CursorDirection::Next)
            .unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        factory.on_success(request, move |f, req| {
            if let Some(cursor) = f.result(req)?.as_cursor() {
                let c = f.cursor(cursor)?;
                sink.borrow_mut()
                    .push((c.key().cloned(), c.primary_key().cloned()));
                f.continue_cursor(cursor, None)?;
            }
            Ok(())
        });
        factory.run_until_idle();

        let entry = |k: &str, pk: i32| (Some(Key::from(k)), Some(Key::from(pk)));
        assert_eq!(*seen.borrow(), vec![entry("a", 2), entry("b", 1), entry("b", 3)]);
        assert_eq!(
            factory.transaction_state(txn).unwrap(),
            TransactionState::Finished
        );
        assert!(factory.get_transaction(txn).unwrap().error().is_none());
    }

    #[test]
    fn test_error_aborts_unless_prevented() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        factory.add(&store, json!({"isbn": 1}), None).unwrap();
        let duplicate = factory.add(&store, json!({"isbn": 1}), None).unwrap();
        factory.on_error(duplicate, |_, _, _| ErrorDisposition::PreventDefault);
        factory.add(&store, json!({"isbn": 2}), None).unwrap();
        factory.run_until_idle();
        assert!(factory.get_transaction(txn).unwrap().error().is_none());

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        factory.add(&store, json!({"isbn": 3}), None).unwrap();
        let duplicate = factory.add(&store, json!({"isbn": 1}), None).unwrap();
        let queued = factory.add(&store, json!({"isbn": 4}), None).unwrap();
        factory.run_until_idle();

        assert_eq!(factory.error(duplicate).unwrap().map(IDBError::name), Some("ConstraintError"));
        assert_eq!(factory.error(queued).unwrap().map(IDBError::name), Some("AbortError"));
        assert_eq!(
            factory.get_transaction(txn).unwrap().error().map(IDBError::name),
            Some("ConstraintError")
        );

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadOnly)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        let count = factory.count(&store, None).unwrap();
        factory.run_until_idle();
        assert_eq!(factory.result(count).unwrap().as_count(), Some(2));
    }

    #[test]
    fn test_explicit_abort_and_commit_state() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        let add = factory.add(&store, json!({"isbn": 1}), None).unwrap();
        factory.commit(txn).unwrap();
        assert!(matches!(
            factory.add(&store, json!({"isbn": 2}), None),
            Err(IDBError::TransactionInactiveError)
        ));
        assert!(factory.abort(txn).is_err());
        factory.run_until_idle();
        assert!(factory.error(add).unwrap().is_none());

        let aborted = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&aborted);
        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        factory.on_abort(txn, move |_, _| *flag.borrow_mut() = true);
        let store = factory.object_store(txn, "books").unwrap();
        factory.delete(&store, Key::from(1)).unwrap();
        factory.abort(txn).unwrap();
        factory.run_until_idle();
        assert!(*aborted.borrow());

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadOnly)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        let read = factory.get(&store, Key::from(1)).unwrap();
        factory.run_until_idle();
        assert!(factory.result(read).unwrap().as_value().is_some());
    }

    #[test]
    fn test_transaction_creation_errors() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);

        assert!(matches!(
            factory.transaction(connection, &[], TransactionMode::ReadOnly),
            Err(IDBError::InvalidAccessError(_))
        ));
        assert!(matches!(
            factory.transaction(connection, &["missing"], TransactionMode::ReadOnly),
            Err(IDBError::NotFoundError(_))
        ));
        assert!(matches!(
            factory.transaction(connection, &["books"], TransactionMode::VersionChange),
            Err(IDBError::TypeError(_))
        ));

        factory.close(connection);
        assert!(matches!(
            factory.transaction(connection, &["books"], TransactionMode::ReadOnly),
            Err(IDBError::InvalidStateError(_))
        ));
    }

    #[test]
    fn test_handlers_dropped_once_settled() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);
        let token = Rc::new(());

        let txn = factory
            .transaction(connection, &["books"], TransactionMode::ReadWrite)
            .unwrap();
        let store = factory.object_store(txn, "books").unwrap();
        let added = factory
            .add(&store, json!({"isbn": 1, "author": "a"}), None)
            .unwrap();
        let held = Rc::clone(&token);
        factory.on_success(added, move |_, _| {
            assert!(Rc::strong_count(&held) > 1);
            Ok(())
        });
        let held = Rc::clone(&token);
        factory.on_error(added, move |_, _, _| {
            assert!(Rc::strong_count(&held) > 1);
            ErrorDisposition::Default
        });
        let cursor_request = factory
            .open_cursor(&store, None, CursorDirection::Next)
            .unwrap();
        let held = Rc::clone(&token);
        factory.on_success(cursor_request, move |f, req| {
            assert!(Rc::strong_count(&held) > 1);
            if let Some(cursor) = f.result(req)?.as_cursor() {
                f.continue_cursor(cursor, None)?;
            }
            Ok(())
        });
        assert_eq!(Rc::strong_count(&token), 4);

        factory.run_until_idle();
        assert_eq!(
            factory.transaction_state(txn).unwrap(),
            TransactionState::Finished
        );
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn test_forget_transaction_bounds_maps() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);
        let (transactions, requests) = (factory.transactions.len(), factory.requests.len());

        for isbn in 0..50 {
            let txn = factory
                .transaction(connection, &["books"], TransactionMode::ReadWrite)
                .unwrap();
            let store = factory.object_store(txn, "books").unwrap();
            factory
                .put(&store, json!({"isbn": isbn, "author": "a"}), None)
                .unwrap();
            let read = factory.get(&store, Key::from(isbn)).unwrap();
            factory.open_cursor(&store, None, CursorDirection::Next).unwrap();

            assert!(matches!(
                factory.forget_transaction(txn),
                Err(IDBError::InvalidStateError(_))
            ));
            factory.run_until_idle();
            assert!(factory.result(read).unwrap().as_value().is_some());
            factory.forget_transaction(txn).unwrap();
            assert!(factory.request(read).is_err());
        }

        assert_eq!(factory.transactions.len(), transactions);
        assert_eq!(factory.requests.len(), requests);
        assert!(factory.cursors.is_empty());
        assert!(factory.on_complete.is_empty() && factory.on_abort.is_empty());
    }

    #[test]
    fn test_forget_settled_open_request() {
        let (mut factory, _rx) = IDBFactory::new(EngineConfig::default());
        let connection = open_library(&mut factory);
        let open = factory.open("library", None).unwrap();
        assert!(matches!(
            factory.forget_request(open),
            Err(IDBError::InvalidStateError(_))
        ));

        factory.run_until_idle();
        assert!(factory.result(open).unwrap().as_connection().is_some());
        factory.forget_request(open).unwrap();
        assert!(factory.request(open).is_err());
        assert_eq!(factory.version(connection).unwrap(), 1);
    }
}
