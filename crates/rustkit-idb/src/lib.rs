//! # RustKit IndexedDB
//!
//! In-process IndexedDB storage and transaction engine for the RustKit
//! browser engine.
//!
//! ## Features
//!
//! - **IDBFactory**: `open()`, `deleteDatabase()`, `databases()`, version upgrades
//! - **IDBObjectStore**: add, put, get, getAll, count, delete, clear
//! - **IDBIndex**: unique and multi-entry secondary indexes
//! - **IDBCursor**: continue, continuePrimaryKey, advance, update, delete
//! - **IDBTransaction**: readonly, readwrite, versionchange, atomic abort
//! - **Persistence**: optional SQLite-backed storage
//!
//! ## Architecture
//!
//! ```text
//! IDBFactory (window.indexedDB)
//!     │
//!     ├── Database
//!     │       ├── ObjectStore ── OrderedIndex (records)
//!     │       │       └── SecondaryIndex ── OrderedIndex (index key, primary key)
//!     │       └── TransactionScheduler
//!     │
//!     ├── IDBTransaction ── UndoLog, queued operations
//!     │       └── IDBRequest / IDBCursor
//!     │
//!     └── Persistence ── StorageBackend (memory, SQLite)
//! ```
//!
//! Everything runs on the caller's thread. Requests queue on their
//! transaction and run from [`IDBFactory::run_until_idle`], which also
//! fires the reaction handlers registered on requests and transactions.

pub mod config;
pub mod cursor;
pub mod database;
pub mod error;
pub mod factory;
pub mod ids;
pub mod index;
pub mod key;
pub mod key_generator;
pub mod key_path;
pub mod key_range;
pub mod object_store;
pub mod persistence;
pub mod request;
pub mod scheduler;
pub mod transaction;
pub mod tree;
pub mod undo;

pub use config::EngineConfig;
pub use cursor::{CursorDirection, IDBCursor};
pub use database::Database;
pub use error::{IDBError, Result};
pub use factory::{DatabaseInfo, IDBEvent, IDBFactory};
pub use ids::{ConnectionId, CursorId, IndexId, RequestId, StoreId, TransactionId};
pub use index::SecondaryIndex;
pub use key::Key;
pub use key_path::KeyPath;
pub use key_range::KeyRange;
pub use object_store::ObjectStore;
pub use persistence::{apply_to_map, MemoryBackend, PendingWrite, SqliteBackend, StorageBackend};
pub use request::{
    ErrorDisposition, IDBIndex, IDBObjectStore, IDBRequest, ReadyState, RequestResult, Source,
    UpgradeContext,
};
pub use transaction::{Durability, IDBTransaction, TransactionMode, TransactionState};
pub use tree::{OrderedIndex, ScanDirection};
