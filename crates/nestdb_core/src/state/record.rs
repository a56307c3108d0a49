//! Per-object state records.

use crate::types::{IdentityKey, InstanceId, TransactionId};
use nestdb_storage::{Row, Value};

/// Lifecycle status of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Not associated with a session and never persisted (or evicted by rollback).
    Transient,
    /// Added to the session, not yet flushed.
    Pending,
    /// Present in the database and in the identity map.
    Persistent,
    /// Deletion flushed; not yet committed.
    Deleted,
    /// Removed from the session.
    Detached,
}

/// Values of a record captured at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last known durable values.
    pub committed: Row,
    /// In-memory values.
    pub current: Row,
    /// Whether the record was expired.
    pub expired: bool,
}

/// State of one tracked object.
///
/// A record holds two rows: `committed`, the values last known to be in
/// the database (as seen by this session's transaction), and `current`,
/// the in-memory values the caller edits. The record is modified when the
/// two differ. An expired record has no usable values and reloads on the
/// next read.
#[derive(Debug, Clone)]
pub struct StateRecord {
    id: InstanceId,
    entity: String,
    pub(crate) key: Option<IdentityKey>,
    pub(crate) committed: Row,
    pub(crate) current: Row,
    pub(crate) status: ObjectStatus,
    pub(crate) is_deleted: bool,
    pub(crate) expired: bool,
    pub(crate) added_in: Option<TransactionId>,
    pub(crate) deleted_in: Option<TransactionId>,
}

impl StateRecord {
    /// A freshly added object.
    pub(crate) fn pending(
        id: InstanceId,
        entity: impl Into<String>,
        values: Row,
        added_in: Option<TransactionId>,
    ) -> Self {
        Self {
            id,
            entity: entity.into(),
            key: None,
            committed: Row::new(),
            current: values,
            status: ObjectStatus::Pending,
            is_deleted: false,
            expired: false,
            added_in,
            deleted_in: None,
        }
    }

    /// An object loaded from storage.
    pub(crate) fn loaded(id: InstanceId, key: IdentityKey, row: Row) -> Self {
        Self {
            id,
            entity: key.entity.clone(),
            key: Some(key),
            committed: row.clone(),
            current: row,
            status: ObjectStatus::Persistent,
            is_deleted: false,
            expired: false,
            added_in: None,
            deleted_in: None,
        }
    }

    /// Returns the instance handle.
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Returns the entity type.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Returns the identity key, once persisted.
    #[must_use]
    pub fn key(&self) -> Option<&IdentityKey> {
        self.key.as_ref()
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> ObjectStatus {
        self.status
    }

    /// Returns the last known durable values.
    #[must_use]
    pub fn committed(&self) -> &Row {
        &self.committed
    }

    /// Returns the in-memory values.
    #[must_use]
    pub fn current(&self) -> &Row {
        &self.current
    }

    /// True while the object awaits its first INSERT.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.status == ObjectStatus::Pending
    }

    /// True once the object is marked for deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// True when values must be reloaded before use.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// True when in-memory values differ from the committed snapshot.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.expired && self.current != self.committed
    }

    /// Reads one column of the in-memory values.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.current.get(column)
    }

    pub(crate) fn set(&mut self, column: impl Into<String>, value: Value) {
        self.current.insert(column.into(), value);
    }

    /// Marks values stale; the next read reloads them.
    pub(crate) fn expire(&mut self) {
        self.current.clear();
        self.committed.clear();
        self.expired = true;
    }

    /// Replaces both rows with freshly loaded values.
    pub(crate) fn load(&mut self, row: Row) {
        self.committed = row.clone();
        self.current = row;
        self.expired = false;
    }

    /// Records that the in-memory values are now durable.
    pub(crate) fn mark_flushed(&mut self) {
        self.committed = self.current.clone();
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            committed: self.committed.clone(),
            current: self.current.clone(),
            expired: self.expired,
        }
    }

    /// Snapshot of the record as it stood before any unflushed edits.
    pub(crate) fn clean_snapshot(&self) -> Snapshot {
        Snapshot {
            committed: self.committed.clone(),
            current: self.committed.clone(),
            expired: self.expired,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &Snapshot) {
        self.committed = snapshot.committed.clone();
        self.current = snapshot.current.clone();
        self.expired = snapshot.expired;
    }

    /// Discards unflushed edits.
    pub(crate) fn revert(&mut self) {
        self.current = self.committed.clone();
    }
}
