//! Connection and engine traits.

use crate::error::StorageResult;
use crate::schema::TableDef;
use crate::value::{Row, Value};
use std::fmt;

/// Identifier of a physical connection, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Handle to a savepoint established on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SavepointHandle {
    /// Savepoint name as issued by the caller.
    pub name: String,
    /// Connection-local sequence, distinguishes reused names.
    pub seq: u64,
}

/// A physical database connection.
///
/// This is the capability the session layer consumes. It has two groups of
/// operations:
///
/// - **Transaction control**: `begin`, `commit`, `rollback`, `prepare`, and
///   the savepoint calls. Savepoints nest: rolling back to or releasing a
///   savepoint discards every savepoint established after it.
/// - **Row access**: primary-key addressed reads and writes used by the
///   unit of work and by callers that issue statements directly.
///
/// # Invariants
///
/// - Writes require an open transaction.
/// - Reads inside a transaction see the transaction's own writes over the
///   snapshot taken at `begin`.
/// - After `invalidate` every call except `is_valid` fails with
///   [`crate::StorageError::ConnectionInvalidated`].
pub trait Connection: Send + fmt::Debug {
    /// Returns the connection identifier.
    fn id(&self) -> ConnectionId;

    /// Begins a transaction.
    fn begin(&mut self) -> StorageResult<()>;

    /// Commits the open transaction.
    fn commit(&mut self) -> StorageResult<()>;

    /// Rolls back the open transaction. A no-op when none is open.
    fn rollback(&mut self) -> StorageResult<()>;

    /// First phase of two-phase commit: validates and freezes the transaction.
    fn prepare(&mut self) -> StorageResult<()>;

    /// Establishes a savepoint inside the open transaction.
    fn begin_savepoint(&mut self, name: &str) -> StorageResult<SavepointHandle>;

    /// Releases a savepoint, keeping its writes.
    fn release_savepoint(&mut self, handle: &SavepointHandle) -> StorageResult<()>;

    /// Discards writes made after the savepoint.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::SavepointNotFound`] if the savepoint was
    /// already released or lost.
    fn rollback_to_savepoint(&mut self, handle: &SavepointHandle) -> StorageResult<()>;

    /// Returns true while a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Returns false once the connection has been invalidated.
    fn is_valid(&self) -> bool;

    /// Invalidates the connection, discarding any open transaction.
    fn invalidate(&mut self);

    /// Whether savepoints are supported.
    fn supports_savepoints(&self) -> bool {
        true
    }

    /// Whether `prepare` is supported.
    fn supports_two_phase(&self) -> bool {
        false
    }

    /// Returns the definition of `table`.
    fn table_def(&self, table: &str) -> StorageResult<TableDef>;

    /// Inserts a row and returns its primary key (generated if autoincrement).
    fn insert(&mut self, table: &str, row: Row) -> StorageResult<Value>;

    /// Replaces the row stored under `key`. The new row may carry a new key.
    fn update(&mut self, table: &str, key: &Value, row: Row) -> StorageResult<()>;

    /// Deletes the row stored under `key`.
    fn delete(&mut self, table: &str, key: &Value) -> StorageResult<()>;

    /// Reads one row by primary key.
    fn get(&mut self, table: &str, key: &Value) -> StorageResult<Option<Row>>;

    /// Reads every visible row of `table`, ordered by primary key.
    fn scan(&mut self, table: &str) -> StorageResult<Vec<Row>>;

    /// Counts visible rows of `table`.
    fn count(&mut self, table: &str) -> StorageResult<usize> {
        Ok(self.scan(table)?.len())
    }
}

/// A source of connections.
///
/// Sessions hold an engine per bind and acquire one connection lease per
/// root transaction.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Opens a new connection.
    fn connect(&self) -> StorageResult<Box<dyn Connection>>;

    /// A short name for logging.
    fn name(&self) -> &str;
}
