//! Requests, their results, and the store/index handles requests are issued on.

use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::{IDBError, Result};
use crate::factory::IDBFactory;
use crate::ids::{ConnectionId, CursorId, IndexId, RequestId, StoreId, TransactionId};
use crate::key::Key;

// ==================== Handles ====================

/// Handle to an object store, bound to the transaction it was obtained from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IDBObjectStore {
    pub(crate) transaction: TransactionId,
    pub(crate) id: StoreId,
    /// Store name.
    pub name: String,
}

impl IDBObjectStore {
    /// Transaction this handle belongs to.
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }
}

/// Handle to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IDBIndex {
    pub(crate) store: IDBObjectStore,
    pub(crate) id: IndexId,
    /// Index name.
    pub name: String,
}

impl IDBIndex {
    /// Handle of the owning store.
    pub fn object_store(&self) -> &IDBObjectStore {
        &self.store
    }
}

/// What a read request or cursor runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    ObjectStore(IDBObjectStore),
    Index(IDBIndex),
}

impl Source {
    /// The store handle (the owning store for an index).
    pub fn store(&self) -> &IDBObjectStore {
        match self {
            Source::ObjectStore(store) => store,
            Source::Index(index) => &index.store,
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store().name
    }

    pub fn index_name(&self) -> Option<&str> {
        match self {
            Source::ObjectStore(_) => None,
            Source::Index(index) => Some(&index.name),
        }
    }

    pub fn transaction(&self) -> TransactionId {
        self.store().transaction
    }
}

impl From<IDBObjectStore> for Source {
    fn from(store: IDBObjectStore) -> Self {
        Source::ObjectStore(store)
    }
}

impl From<&IDBObjectStore> for Source {
    fn from(store: &IDBObjectStore) -> Self {
        Source::ObjectStore(store.clone())
    }
}

impl From<IDBIndex> for Source {
    fn from(index: IDBIndex) -> Self {
        Source::Index(index)
    }
}

impl From<&IDBIndex> for Source {
    fn from(index: &IDBIndex) -> Self {
        Source::Index(index.clone())
    }
}

// ==================== Requests ====================

/// Request ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Done,
}

/// Result of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    /// No value (delete, clear, index backfill).
    Undefined,
    /// A key, or none when nothing matched.
    Key(Option<Key>),
    /// A value, or none when nothing matched.
    Value(Option<JsonValue>),
    Values(Vec<JsonValue>),
    Keys(Vec<Key>),
    Count(usize),
    /// The cursor, or none once it is exhausted.
    Cursor(Option<CursorId>),
    /// An open request's connection.
    Connection(ConnectionId),
    /// A delete request's previous version.
    Version(u64),
}

impl RequestResult {
    pub fn as_key(&self) -> Option<&Key> {
        match self {
            RequestResult::Key(key) => key.as_ref(),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&JsonValue> {
        match self {
            RequestResult::Value(value) => value.as_ref(),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&[JsonValue]> {
        match self {
            RequestResult::Values(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_keys(&self) -> Option<&[Key]> {
        match self {
            RequestResult::Keys(keys) => Some(keys),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<usize> {
        match self {
            RequestResult::Count(count) => Some(*count),
            _ => None,
        }
    }

    pub fn as_cursor(&self) -> Option<CursorId> {
        match self {
            RequestResult::Cursor(cursor) => *cursor,
            _ => None,
        }
    }

    pub fn as_connection(&self) -> Option<ConnectionId> {
        match self {
            RequestResult::Connection(connection) => Some(*connection),
            _ => None,
        }
    }
}

/// What an error handler asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorDisposition {
    /// Abort the transaction with the request's error.
    #[default]
    Default,
    /// Keep the transaction going.
    PreventDefault,
}

/// Arguments of an `upgradeneeded` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeContext {
    pub connection: ConnectionId,
    /// The `versionchange` transaction schema changes run in.
    pub transaction: TransactionId,
    pub old_version: u64,
    pub new_version: u64,
}

pub type SuccessHandler = Box<dyn FnMut(&mut IDBFactory, RequestId) -> Result<()>>;
pub type ErrorHandler = Box<dyn FnMut(&mut IDBFactory, RequestId, &IDBError) -> ErrorDisposition>;
pub type UpgradeHandler = Box<dyn FnOnce(&mut IDBFactory, UpgradeContext) -> Result<()>>;

/// A request issued against the engine.
pub struct IDBRequest {
    pub(crate) id: RequestId,
    pub(crate) source: Option<Source>,
    pub(crate) cursor: Option<CursorId>,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) ready_state: ReadyState,
    pub(crate) result: Option<RequestResult>,
    pub(crate) error: Option<IDBError>,
    pub(crate) on_success: Option<SuccessHandler>,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) on_upgrade_needed: Option<UpgradeHandler>,
}

impl IDBRequest {
    pub(crate) fn new(
        source: Option<Source>,
        cursor: Option<CursorId>,
        transaction: Option<TransactionId>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            source,
            cursor,
            transaction,
            ready_state: ReadyState::Pending,
            result: None,
            error: None,
            on_success: None,
            on_error: None,
            on_upgrade_needed: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    /// The result. Fails while the request is pending.
    pub fn result(&self) -> Result<&RequestResult> {
        if self.ready_state == ReadyState::Pending {
            return Err(IDBError::invalid_state("Request is still pending"));
        }
        Ok(self.result.as_ref().unwrap_or(&RequestResult::Undefined))
    }

    /// The error, if the request failed. Fails while the request is pending.
    pub fn error(&self) -> Result<Option<&IDBError>> {
        if self.ready_state == ReadyState::Pending {
            return Err(IDBError::invalid_state("Request is still pending"));
        }
        Ok(self.error.as_ref())
    }

    /// Put the request back to pending, for cursor iteration.
    pub(crate) fn reset(&mut self) {
        self.ready_state = ReadyState::Pending;
        self.result = None;
        self.error = None;
    }

    pub(crate) fn succeed(&mut self, result: RequestResult) {
        self.ready_state = ReadyState::Done;
        self.result = Some(result);
        self.error = None;
    }

    pub(crate) fn fail(&mut self, error: IDBError) {
        self.ready_state = ReadyState::Done;
        self.result = None;
        self.error = Some(error);
    }
}

impl fmt::Debug for IDBRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IDBRequest")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("transaction", &self.transaction)
            .field("ready_state", &self.ready_state)
            .field("result", &self.result)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
