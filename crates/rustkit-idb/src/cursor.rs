//! Cursors over object stores and indexes.
//!
//! A cursor keeps its position as keys, not tree slots, so it survives
//! records being inserted or removed between its steps.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{IDBError, Result};
use crate::ids::{CursorId, RequestId, TransactionId};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::object_store::ObjectStore;
use crate::request::Source;
use crate::tree::{OrderedIndex, Record, RecordValue, ScanDirection};

/// Cursor direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CursorDirection {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl CursorDirection {
    fn is_forward(self) -> bool {
        matches!(self, CursorDirection::Next | CursorDirection::NextUnique)
    }
}

/// A cursor for iterating records.
#[derive(Debug, Clone)]
pub struct IDBCursor {
    pub(crate) id: CursorId,
    pub(crate) transaction: TransactionId,
    pub(crate) request: RequestId,

    /// Store or index being iterated.
    pub source: Source,

    /// Direction.
    pub direction: CursorDirection,

    range: KeyRange,
    key_only: bool,

    /// Last visited key.
    position: Option<Key>,

    /// Primary key of the last visited index entry.
    object_store_position: Option<Key>,

    key: Option<Key>,
    primary_key: Option<Key>,
    value: Option<JsonValue>,

    pub(crate) got_value: bool,
}

impl IDBCursor {
    pub(crate) fn new(
        source: Source,
        range: KeyRange,
        direction: CursorDirection,
        key_only: bool,
        request: RequestId,
    ) -> Self {
        Self {
            id: CursorId::new(),
            transaction: source.transaction(),
            request,
            source,
            direction,
            range,
            key_only,
            position: None,
            object_store_position: None,
            key: None,
            primary_key: None,
            value: None,
            got_value: false,
        }
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    /// Current key (the index key for index cursors).
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Current primary key.
    pub fn primary_key(&self) -> Option<&Key> {
        self.primary_key.as_ref()
    }

    /// Current value. Always `None` for key cursors.
    pub fn value(&self) -> Option<&JsonValue> {
        self.value.as_ref()
    }

    pub fn is_key_only(&self) -> bool {
        self.key_only
    }

    /// Check a `continue(key)` argument against the current position.
    pub(crate) fn check_continue(&self, key: Option<&Key>) -> Result<()> {
        self.check_positioned()?;
        let (Some(key), Some(current)) = (key, self.key.as_ref()) else {
            return Ok(());
        };
        key.validate()?;
        let backwards = if self.direction.is_forward() {
            key <= current
        } else {
            key >= current
        };
        if backwards {
            return Err(IDBError::data(format!(
                "Key {} does not move the cursor {:?}",
                key, self.direction
            )));
        }
        Ok(())
    }

    /// Check a `continuePrimaryKey(key, primary_key)` call.
    pub(crate) fn check_continue_primary_key(&self, key: &Key, primary_key: &Key) -> Result<()> {
        if self.source.index_name().is_none() {
            return Err(IDBError::InvalidAccessError(
                "continuePrimaryKey requires an index cursor".into(),
            ));
        }
        if !matches!(self.direction, CursorDirection::Next | CursorDirection::Prev) {
            return Err(IDBError::InvalidAccessError(
                "continuePrimaryKey requires a next or prev cursor".into(),
            ));
        }
        self.check_positioned()?;
        key.validate()?;
        primary_key.validate()?;

        let (Some(current), Some(current_primary)) =
            (self.key.as_ref(), self.primary_key.as_ref())
        else {
            return Ok(());
        };
        let backwards = if self.direction.is_forward() {
            key < current || (key == current && primary_key <= current_primary)
        } else {
            key > current || (key == current && primary_key >= current_primary)
        };
        if backwards {
            return Err(IDBError::data(format!(
                "Key {} / {} does not move the cursor {:?}",
                key, primary_key, self.direction
            )));
        }
        Ok(())
    }

    fn check_positioned(&self) -> Result<()> {
        if !self.got_value {
            return Err(IDBError::invalid_state(
                "Cursor is being iterated or has reached its end",
            ));
        }
        Ok(())
    }

    /// Move the cursor `count` steps. `key` and `primary_key` constrain the
    /// first step only. Returns false once the cursor is exhausted.
    pub(crate) fn iterate(
        &mut self,
        store: &ObjectStore,
        key: Option<&Key>,
        primary_key: Option<&Key>,
        count: u32,
    ) -> Result<bool> {
        for step in 0..count.max(1) {
            let (key, primary_key) = if step == 0 {
                (key, primary_key)
            } else {
                (None, None)
            };

            match self.seek(store, key, primary_key)? {
                Some((found_key, found_primary, value)) => {
                    if self.source.index_name().is_some() {
                        self.object_store_position = Some(found_primary.clone());
                    }
                    self.position = Some(found_key.clone());
                    self.key = Some(found_key);
                    self.primary_key = Some(found_primary);
                    self.value = value;
                }
                None => {
                    self.exhaust();
                    return Ok(false);
                }
            }
        }
        self.got_value = true;
        Ok(true)
    }

    fn exhaust(&mut self) {
        self.position = None;
        self.object_store_position = None;
        self.key = None;
        self.primary_key = None;
        self.value = None;
        self.got_value = false;
    }

    /// Find the next record as `(key, primary key, value)`.
    fn seek(
        &self,
        store: &ObjectStore,
        key: Option<&Key>,
        primary_key: Option<&Key>,
    ) -> Result<Option<(Key, Key, Option<JsonValue>)>> {
        match self.source.index_name() {
            None => {
                let found = self.seek_in(store.records(), store_primary, key, primary_key);
                Ok(found.map(|record| {
                    let value = (!self.key_only).then(|| record.value.clone());
                    (record.key.clone(), record.key.clone(), value)
                }))
            }
            Some(name) => {
                let index = store
                    .index(name)
                    .ok_or_else(|| IDBError::invalid_state(format!("Index '{}' was deleted", name)))?;
                let found = self.seek_in(index.records(), index_primary, key, primary_key);
                Ok(found.map(|entry| {
                    let value = if self.key_only {
                        None
                    } else {
                        store.get_value(&KeyRange::from(entry.value.clone()))
                    };
                    (entry.key.clone(), entry.value.clone(), value)
                }))
            }
        }
    }

    fn seek_in<'a, V: RecordValue>(
        &self,
        records: &'a OrderedIndex<V>,
        primary: fn(&Record<V>) -> &Key,
        key: Option<&Key>,
        primary_key: Option<&Key>,
    ) -> Option<&'a Record<V>> {
        // Store keys are unique, so the last position can be excluded by the
        // range itself. Index entries need the primary key to break ties.
        let unique = self.source.index_name().is_none();
        let mut range = self.range.clone();

        match self.direction {
            CursorDirection::Next => {
                if let Some(key) = key {
                    range.tighten_lower(key, false);
                }
                if let Some(position) = &self.position {
                    range.tighten_lower(position, unique);
                }
                records
                    .iter(&range, ScanDirection::Forward)
                    .find(|record| {
                        let pk = primary(record);
                        if let (Some(key), Some(min)) = (key, primary_key) {
                            if record.key == *key && pk < min {
                                return false;
                            }
                        }
                        if let (Some(position), Some(last)) =
                            (&self.position, &self.object_store_position)
                        {
                            if record.key == *position && pk <= last {
                                return false;
                            }
                        }
                        true
                    })
            }
            CursorDirection::NextUnique => {
                if let Some(key) = key {
                    range.tighten_lower(key, false);
                }
                if let Some(position) = &self.position {
                    range.tighten_lower(position, true);
                }
                records.iter(&range, ScanDirection::Forward).next()
            }
            CursorDirection::Prev => {
                if let Some(key) = key {
                    range.tighten_upper(key, false);
                }
                if let Some(position) = &self.position {
                    range.tighten_upper(position, unique);
                }
                records
                    .iter(&range, ScanDirection::Backward)
                    .find(|record| {
                        let pk = primary(record);
                        if let (Some(key), Some(max)) = (key, primary_key) {
                            if record.key == *key && pk > max {
                                return false;
                            }
                        }
                        if let (Some(position), Some(last)) =
                            (&self.position, &self.object_store_position)
                        {
                            if record.key == *position && pk >= last {
                                return false;
                            }
                        }
                        true
                    })
            }
            CursorDirection::PrevUnique => {
                if let Some(key) = key {
                    range.tighten_upper(key, false);
                }
                if let Some(position) = &self.position {
                    range.tighten_upper(position, true);
                }
                // The group's first entry in primary key order.
                let last = records.iter(&range, ScanDirection::Backward).next()?;
                records.get(&KeyRange::from(last.key.clone()))
            }
        }
    }
}

fn store_primary(record: &Record<JsonValue>) -> &Key {
    &record.key
}

fn index_primary(record: &Record<Key>) -> &Key {
    &record.value
}
