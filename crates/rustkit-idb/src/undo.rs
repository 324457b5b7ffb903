//! Undo log: inverse actions replayed in reverse on abort.

use serde_json::Value as JsonValue;

use crate::index::SecondaryIndex;
use crate::key::Key;
use crate::object_store::ObjectStore;
use crate::tree::Record;

/// Inverse of one forward mutation.
#[derive(Debug, Clone)]
pub enum UndoAction {
    /// Put a removed record back, together with its index entries.
    ReinsertRecord { store: String, record: Record<JsonValue> },
    /// Remove a record that was inserted.
    DeleteKey { store: String, key: Key },
    /// Reset a store's key generator.
    RestoreCounter { store: String, counter: u64 },
    /// Revert a schema change.
    RestoreSchema(SchemaChange),
}

/// Schema changes made by a `versionchange` transaction.
#[derive(Debug, Clone)]
pub enum SchemaChange {
    CreatedStore { name: String },
    DeletedStore { store: Box<ObjectStore> },
    CreatedIndex { store: String, name: String },
    DeletedIndex { store: String, index: Box<SecondaryIndex> },
    Version { old_version: u64 },
}

/// Stack of inverse actions owned by one transaction.
#[derive(Debug, Default)]
pub struct UndoLog {
    actions: Vec<UndoAction>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions in the order they were recorded.
    pub fn iter(&self) -> impl Iterator<Item = &UndoAction> {
        self.actions.iter()
    }

    /// Whether any action reverts a schema change.
    pub fn has_schema_changes(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, UndoAction::RestoreSchema(_)))
    }

    /// Records written or removed, as `(store, key)` pairs, in log order.
    pub fn touched_records(&self) -> Vec<(&str, &Key)> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                UndoAction::ReinsertRecord { store, record } => Some((store.as_str(), &record.key)),
                UndoAction::DeleteKey { store, key } => Some((store.as_str(), key)),
                _ => None,
            })
            .collect()
    }

    /// Consume the log, yielding actions last-recorded first.
    pub fn into_reversed(self) -> impl Iterator<Item = UndoAction> {
        self.actions.into_iter().rev()
    }
}
