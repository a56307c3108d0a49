//! Error types for NestDB core.

use crate::types::{IdentityKey, InstanceId, TransactionId};
use nestdb_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in session and transaction operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A connection call failed outside of a flush.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The transaction has already been committed or rolled back.
    #[error("transaction {txn} is closed")]
    ClosedTransaction {
        /// The closed transaction.
        txn: TransactionId,
    },

    /// The transaction was deactivated and must be rolled back.
    #[error("transaction is inactive: {message}")]
    InactiveTransaction {
        /// Why the transaction is inactive.
        message: String,
    },

    /// A previous flush failed; only `rollback()` is accepted.
    #[error(
        "this session's transaction has been rolled back due to a previous error during flush; \
         issue rollback() first. Original error: {cause}"
    )]
    PendingRollback {
        /// Message of the error that deactivated the transaction.
        cause: String,
    },

    /// A flush or commit failed against storage.
    #[error("persistence failed: {message}")]
    Persistence {
        /// What failed.
        message: String,
        /// Underlying storage failure, if there was one.
        #[source]
        source: Option<StorageError>,
    },

    /// Commit kept finding new pending changes after every flush.
    #[error(
        "over {limit} subsequent flushes have occurred within commit(); \
         is a flush listener creating new objects?"
    )]
    FlushLoop {
        /// The configured ceiling.
        limit: usize,
    },

    /// The backend or configuration does not support the request.
    #[error("unsupported operation: {message}")]
    Unsupported {
        /// Description of what is unsupported.
        message: String,
    },

    /// The request is not valid in the session's current state.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// The instance handle does not belong to this session.
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// The instance is detached and cannot load state.
    #[error("instance {0} is not bound to this session")]
    DetachedInstance(InstanceId),

    /// An expired instance's row no longer exists.
    #[error("instance {instance} has been deleted: no row for {key}")]
    ObjectDeleted {
        /// The expired instance.
        instance: InstanceId,
        /// Its identity key.
        key: IdentityKey,
    },
}

impl CoreError {
    /// Creates a persistence error from a storage failure.
    pub fn persistence(message: impl Into<String>, source: StorageError) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Creates a persistence error with no storage cause.
    pub fn persistence_msg(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an inactive transaction error.
    pub fn inactive(message: impl Into<String>) -> Self {
        Self::InactiveTransaction {
            message: message.into(),
        }
    }

    /// Creates a pending rollback error.
    pub fn pending_rollback(cause: impl Into<String>) -> Self {
        Self::PendingRollback {
            cause: cause.into(),
        }
    }

    /// Creates an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Returns true for errors that a `rollback()` clears.
    #[must_use]
    pub fn is_recoverable_by_rollback(&self) -> bool {
        matches!(
            self,
            Self::InactiveTransaction { .. } | Self::PendingRollback { .. } | Self::Persistence { .. }
        )
    }
}
