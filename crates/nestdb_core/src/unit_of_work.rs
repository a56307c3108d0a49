//! Unit of work: executing a flush plan.
//!
//! The session decides *what* must be written (the [`FlushPlan`]); a
//! [`UnitOfWork`] decides the order and drives a [`ChangeExecutor`], which
//! issues the statements on the session's connections.

use crate::types::InstanceId;
use nestdb_storage::{Row, StorageError, StorageResult, Value};

/// A single write a flush must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    /// INSERT a pending object.
    Insert,
    /// UPDATE the row stored under `key`.
    Update {
        /// Primary key the row is currently stored under.
        key: Value,
    },
    /// DELETE the row stored under `key`.
    Delete {
        /// Primary key of the row.
        key: Value,
    },
}

impl ChangeOp {
    fn rank(&self) -> u8 {
        match self {
            Self::Delete { .. } => 0,
            Self::Update { .. } => 1,
            Self::Insert => 2,
        }
    }

    /// Short verb for logs and error messages.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// A planned write for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    /// Object being written.
    pub instance: InstanceId,
    /// Entity type (table).
    pub entity: String,
    /// Operation.
    pub op: ChangeOp,
    /// Row to write; the last committed row for deletes.
    pub row: Row,
}

/// Every write a flush must perform, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPlan {
    /// Planned writes.
    pub changes: Vec<PlannedChange>,
}

impl FlushPlan {
    /// Returns true if there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of planned writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// What a successful write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Row inserted under `key`.
    Inserted {
        /// Primary key, generated when the table autoincrements.
        key: Value,
    },
    /// Row updated.
    Updated,
    /// Row deleted.
    Deleted,
}

/// A write that reached storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedChange {
    /// Object written.
    pub instance: InstanceId,
    /// Outcome.
    pub applied: Applied,
}

/// The write that stopped a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushFailure {
    /// Object whose write failed.
    pub instance: InstanceId,
    /// Operation that failed.
    pub op: ChangeOp,
    /// Entity type.
    pub entity: String,
    /// Storage error.
    pub error: StorageError,
}

/// Outcome of [`UnitOfWork::flush`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Writes that succeeded, in execution order.
    pub committed: Vec<FlushedChange>,
    /// The write that failed, if any. Nothing after it was attempted.
    pub failed: Option<FlushFailure>,
}

/// Issues single writes against storage.
pub trait ChangeExecutor {
    /// Performs one planned write.
    fn execute(&mut self, change: &PlannedChange) -> StorageResult<Applied>;
}

/// Orders and executes a flush plan.
pub trait UnitOfWork: Send + std::fmt::Debug {
    /// Executes `plan` through `executor`, stopping at the first failure.
    fn flush(&mut self, plan: &FlushPlan, executor: &mut dyn ChangeExecutor) -> FlushResult;
}

/// Executes deletes, then updates, then inserts; by instance within each group.
///
/// Deleting first frees primary keys that later inserts or key-changing
/// updates reuse.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUnitOfWork;

impl UnitOfWork for DefaultUnitOfWork {
    fn flush(&mut self, plan: &FlushPlan, executor: &mut dyn ChangeExecutor) -> FlushResult {
        let mut ordered: Vec<&PlannedChange> = plan.changes.iter().collect();
        ordered.sort_by_key(|c| (c.op.rank(), c.instance));

        let mut result = FlushResult::default();
        for change in ordered {
            match executor.execute(change) {
                Ok(applied) => result.committed.push(FlushedChange {
                    instance: change.instance,
                    applied,
                }),
                Err(error) => {
                    tracing::debug!(
                        instance = %change.instance,
                        entity = %change.entity,
                        op = change.op.verb(),
                        %error,
                        "flush stopped"
                    );
                    result.failed = Some(FlushFailure {
                        instance: change.instance,
                        op: change.op.clone(),
                        entity: change.entity.clone(),
                        error,
                    });
                    break;
                }
            }
        }
        result
    }
}
