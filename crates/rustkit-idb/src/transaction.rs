//! Transactions and the operations queued on them.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;

use crate::cursor::IDBCursor;
use crate::error::{IDBError, Result};
use crate::ids::{ConnectionId, CursorId, RequestId, TransactionId};
use crate::index::SecondaryIndex;
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::object_store::ObjectStore;
use crate::request::{RequestResult, Source};
use crate::tree::ScanDirection;
use crate::undo::UndoLog;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting requests.
    Active,
    /// Between reaction handlers; requests are rejected.
    Inactive,
    /// No further requests; commits once the queue drains.
    Committing,
    Finished,
}

/// Durability hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Durability {
    #[default]
    Default,
    /// The commit fails unless its writes reach the backend.
    Strict,
    Relaxed,
}

/// A unit of work queued on a transaction.
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Put {
        store: String,
        value: JsonValue,
        key: Option<Key>,
        no_overwrite: bool,
    },
    Get {
        source: Source,
        range: KeyRange,
        key_only: bool,
    },
    GetAll {
        source: Source,
        range: KeyRange,
        count: Option<usize>,
        key_only: bool,
    },
    Count {
        source: Source,
        range: KeyRange,
    },
    Delete {
        store: String,
        range: KeyRange,
    },
    Clear {
        store: String,
    },
    Iterate {
        cursor: CursorId,
        key: Option<Key>,
        primary_key: Option<Key>,
        count: u32,
    },
    BackfillIndex {
        store: String,
        index: String,
    },
}

impl Operation {
    /// Short name for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Operation::Put { no_overwrite: true, .. } => "add",
            Operation::Put { .. } => "put",
            Operation::Get { .. } => "get",
            Operation::GetAll { .. } => "getAll",
            Operation::Count { .. } => "count",
            Operation::Delete { .. } => "delete",
            Operation::Clear { .. } => "clear",
            Operation::Iterate { .. } => "iterate",
            Operation::BackfillIndex { .. } => "backfill",
        }
    }

    /// Run the operation against the database's stores.
    pub(crate) fn execute(
        self,
        stores: &mut HashMap<String, ObjectStore>,
        undo: &mut UndoLog,
        cursors: &mut HashMap<CursorId, IDBCursor>,
    ) -> Result<RequestResult> {
        match self {
            Operation::Put {
                store,
                value,
                key,
                no_overwrite,
            } => {
                let key = store_mut(stores, &store)?.store_record(value, key, no_overwrite, undo)?;
                Ok(RequestResult::Key(Some(key)))
            }
            Operation::Get {
                source,
                range,
                key_only,
            } => {
                let store = store_ref(stores, source.store_name())?;
                let result = match source.index_name() {
                    None if key_only => RequestResult::Key(store.get_key(&range)),
                    None => RequestResult::Value(store.get_value(&range)),
                    Some(name) => {
                        let primary = index_ref(store, name)?.get_primary_key(&range);
                        if key_only {
                            RequestResult::Key(primary)
                        } else {
                            RequestResult::Value(
                                primary.and_then(|pk| store.get_value(&KeyRange::from(pk))),
                            )
                        }
                    }
                };
                Ok(result)
            }
            Operation::GetAll {
                source,
                range,
                count,
                key_only,
            } => {
                let store = store_ref(stores, source.store_name())?;
                let result = match source.index_name() {
                    None if key_only => RequestResult::Keys(store.get_all_keys(&range, count)),
                    None => RequestResult::Values(store.get_all(&range, count)),
                    Some(name) => {
                        let primaries = index_ref(store, name)?
                            .records()
                            .iter(&range, ScanDirection::Forward)
                            .take(count.unwrap_or(usize::MAX))
                            .map(|entry| entry.value.clone());
                        if key_only {
                            RequestResult::Keys(primaries.collect())
                        } else {
                            RequestResult::Values(
                                primaries
                                    .filter_map(|pk| store.get_value(&KeyRange::from(pk)))
                                    .collect(),
                            )
                        }
                    }
                };
                Ok(result)
            }
            Operation::Count { source, range } => {
                let store = store_ref(stores, source.store_name())?;
                let count = match source.index_name() {
                    None => store.count(&range),
                    Some(name) => index_ref(store, name)?.count(&range),
                };
                Ok(RequestResult::Count(count))
            }
            Operation::Delete { store, range } => {
                store_mut(stores, &store)?.delete_records(&range, undo);
                Ok(RequestResult::Undefined)
            }
            Operation::Clear { store } => {
                store_mut(stores, &store)?.clear(undo);
                Ok(RequestResult::Undefined)
            }
            Operation::Iterate {
                cursor,
                key,
                primary_key,
                count,
            } => {
                let state = cursors
                    .get_mut(&cursor)
                    .ok_or_else(|| IDBError::invalid_state("Cursor no longer exists"))?;
                let store = store_ref(stores, state.source.store_name())?;
                let found = state.iterate(store, key.as_ref(), primary_key.as_ref(), count)?;
                Ok(RequestResult::Cursor(found.then_some(cursor)))
            }
            Operation::BackfillIndex { store, index } => {
                // The index may since have been deleted, or built by an earlier backfill.
                if let Some(store) = stores.get_mut(&store) {
                    if store.index(&index).is_some_and(|i| !i.initialized) {
                        store.backfill_index(&index)?;
                    }
                }
                Ok(RequestResult::Undefined)
            }
        }
    }
}

fn store_ref<'a>(stores: &'a HashMap<String, ObjectStore>, name: &str) -> Result<&'a ObjectStore> {
    stores
        .get(name)
        .ok_or_else(|| IDBError::invalid_state(format!("Object store '{}' was deleted", name)))
}

fn store_mut<'a>(
    stores: &'a mut HashMap<String, ObjectStore>,
    name: &str,
) -> Result<&'a mut ObjectStore> {
    stores
        .get_mut(name)
        .ok_or_else(|| IDBError::invalid_state(format!("Object store '{}' was deleted", name)))
}

fn index_ref<'a>(store: &'a ObjectStore, name: &str) -> Result<&'a SecondaryIndex> {
    store
        .index(name)
        .ok_or_else(|| IDBError::invalid_state(format!("Index '{}' was deleted", name)))
}

/// An operation waiting in a transaction's queue.
#[derive(Debug)]
pub(crate) struct QueuedOperation {
    /// Request to settle; index backfills have none.
    pub request: Option<RequestId>,
    pub operation: Operation,
}

/// A database transaction.
#[derive(Debug)]
pub struct IDBTransaction {
    pub(crate) id: TransactionId,
    pub(crate) connection: ConnectionId,
    pub(crate) db_name: String,

    /// Transaction mode.
    pub mode: TransactionMode,

    /// Object store names in scope.
    pub scope: Vec<String>,

    pub durability: Durability,

    pub(crate) state: TransactionState,

    /// Set once the scheduler lets the transaction run.
    pub(crate) started: bool,

    pub(crate) undo: UndoLog,
    pub(crate) queue: VecDeque<QueuedOperation>,

    /// Error if aborted.
    pub(crate) error: Option<IDBError>,
}

impl IDBTransaction {
    /// Create a new transaction.
    pub(crate) fn new(
        connection: ConnectionId,
        db_name: &str,
        mode: TransactionMode,
        scope: Vec<String>,
        durability: Durability,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            connection,
            db_name: db_name.to_string(),
            mode,
            scope,
            durability,
            state: TransactionState::Active,
            started: false,
            undo: UndoLog::new(),
            queue: VecDeque::new(),
            error: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Error the transaction aborted with.
    pub fn error(&self) -> Option<&IDBError> {
        self.error.as_ref()
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn is_finished(&self) -> bool {
        self.state == TransactionState::Finished
    }

    /// Check if store is in scope.
    pub fn has_store(&self, name: &str) -> bool {
        self.mode == TransactionMode::VersionChange || self.scope.iter().any(|s| s == name)
    }

    /// Ensure a request may be issued: active, and writable if `write`.
    pub(crate) fn check_request(&self, write: bool) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(IDBError::TransactionInactiveError);
        }
        if write && self.mode == TransactionMode::ReadOnly {
            return Err(IDBError::ReadOnlyError);
        }
        Ok(())
    }

    pub(crate) fn enqueue(&mut self, request: Option<RequestId>, operation: Operation) {
        self.queue.push_back(QueuedOperation { request, operation });
    }

    /// Temporarily reactivate for a reaction handler.
    pub(crate) fn activate(&mut self) {
        if self.state == TransactionState::Inactive {
            self.state = TransactionState::Active;
        }
    }

    pub(crate) fn deactivate(&mut self) {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Inactive;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_path::KeyPath;
    use crate::tree::DEFAULT_TOMBSTONE_RATIO;
    use serde_json::json;

    fn transaction(mode: TransactionMode) -> IDBTransaction {
        IDBTransaction::new(
            ConnectionId::new(),
            "db",
            mode,
            vec!["books".into()],
            Durability::Default,
        )
    }

    fn stores() -> HashMap<String, ObjectStore> {
        let mut stores = HashMap::new();
        stores.insert(
            "books".to_string(),
            ObjectStore::new("books", KeyPath::from("isbn"), false, DEFAULT_TOMBSTONE_RATIO),
        );
        stores
    }

    #[test]
    fn test_request_checks() {
        let mut txn = transaction(TransactionMode::ReadOnly);
        assert_eq!(txn.check_request(true), Err(IDBError::ReadOnlyError));
        assert!(txn.check_request(false).is_ok());

        txn.deactivate();
        assert_eq!(
            txn.check_request(false),
            Err(IDBError::TransactionInactiveError)
        );
        txn.activate();
        assert!(txn.is_active());
    }

    #[test]
    fn test_scope() {
        assert!(transaction(TransactionMode::ReadWrite).has_store("books"));
        assert!(!transaction(TransactionMode::ReadWrite).has_store("authors"));
        assert!(transaction(TransactionMode::VersionChange).has_store("authors"));
    }

    #[test]
    fn test_execute_put_then_get() {
        let mut stores = stores();
        let mut undo = UndoLog::new();
        let mut cursors = HashMap::new();

        let put = Operation::Put {
            store: "books".into(),
            value: json!({"isbn": 1, "title": "A"}),
            key: None,
            no_overwrite: true,
        };
        assert_eq!(put.kind(), "add");
        let result = put.execute(&mut stores, &mut undo, &mut cursors).unwrap();
        assert_eq!(result, RequestResult::Key(Some(Key::from(1))));

        let store = crate::request::IDBObjectStore {
            transaction: TransactionId::new(),
            id: stores["books"].id,
            name: "books".into(),
        };
        let get = Operation::Get {
            source: Source::ObjectStore(store),
            range: KeyRange::only(1).unwrap(),
            key_only: false,
        };
        let result = get.execute(&mut stores, &mut undo, &mut cursors).unwrap();
        assert_eq!(result.as_value(), Some(&json!({"isbn": 1, "title": "A"})));
    }

    #[test]
    fn test_execute_on_deleted_store() {
        let mut stores = HashMap::new();
        let op = Operation::Clear {
            store: "gone".into(),
        };
        let err = op
            .execute(&mut stores, &mut UndoLog::new(), &mut HashMap::new())
            .unwrap_err();
        assert_eq!(err.name(), "InvalidStateError");
    }
}
