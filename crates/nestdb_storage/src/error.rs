//! Error types for storage operations.

use crate::fault::FaultPoint;
use crate::value::Value;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while a connection talks to its engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A row with the same primary key already exists.
    #[error("unique constraint violated on {table}: duplicate key {key}")]
    UniqueViolation {
        /// Table name.
        table: String,
        /// Conflicting primary key.
        key: Value,
    },

    /// A required column was missing or null.
    #[error("not null constraint violated on {table}.{column}")]
    NotNull {
        /// Table name.
        table: String,
        /// Column that was null.
        column: String,
    },

    /// An UPDATE or DELETE matched no row.
    #[error("row {key} not found in {table}")]
    RowNotFound {
        /// Table name.
        table: String,
        /// Primary key that matched nothing.
        key: Value,
    },

    /// The table is not defined on this engine.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A concurrent transaction committed a newer version of a written row.
    #[error("write conflict on {table} key {key}")]
    WriteConflict {
        /// Table name.
        table: String,
        /// Primary key of the contended row.
        key: Value,
    },

    /// A transactional operation was issued outside of a transaction.
    #[error("no transaction is in progress")]
    NoTransaction,

    /// `begin()` was issued while a transaction was already open.
    #[error("a transaction is already in progress")]
    TransactionInProgress,

    /// Writes were attempted after the transaction was prepared.
    #[error("transaction is prepared; no further writes are accepted")]
    Prepared,

    /// The savepoint no longer exists on the connection.
    #[error("savepoint {name} does not exist")]
    SavepointNotFound {
        /// Savepoint name.
        name: String,
    },

    /// The connection was invalidated and cannot be used.
    #[error("connection has been invalidated")]
    ConnectionInvalidated,

    /// The engine does not support the requested capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A failure armed through the fault injector.
    #[error("{message} (at {point:?})")]
    Injected {
        /// Operation that failed.
        point: FaultPoint,
        /// Message supplied when the fault was armed.
        message: String,
    },
}

impl StorageError {
    /// Returns true for constraint violations raised while writing rows.
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::UniqueViolation { .. } | Self::NotNull { .. } | Self::WriteConflict { .. }
        )
    }

    /// Returns true if the error reports a savepoint the backend no longer knows.
    #[must_use]
    pub fn is_savepoint_lost(&self) -> bool {
        matches!(self, Self::SavepointNotFound { .. })
    }
}
