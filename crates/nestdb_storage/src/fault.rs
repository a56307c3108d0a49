//! Fault injection for exercising failure paths.
//!
//! Faults are armed on an engine and fire on any of its connections the next
//! time the matching operation runs.

use crate::error::StorageError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Connection operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `begin()`.
    Begin,
    /// `commit()`.
    Commit,
    /// `rollback()`.
    Rollback,
    /// `prepare()`.
    Prepare,
    /// `begin_savepoint()`.
    BeginSavepoint,
    /// `release_savepoint()`.
    ReleaseSavepoint,
    /// `rollback_to_savepoint()`.
    RollbackToSavepoint,
    /// `insert()`.
    Insert,
    /// `update()`.
    Update,
    /// `delete()`.
    Delete,
}

/// What an armed fault does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail with [`StorageError::Injected`] carrying this message.
    Backend(String),
    /// Fail with [`StorageError::SavepointNotFound`], as if the savepoint vanished.
    SavepointLost,
}

#[derive(Debug)]
struct Armed {
    kind: FaultKind,
    remaining: Option<usize>,
}

/// Shared registry of armed faults.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    armed: Arc<Mutex<HashMap<FaultPoint, Armed>>>,
}

impl FaultInjector {
    /// Creates an injector with nothing armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a fault that fires once.
    pub fn fail_once(&self, point: FaultPoint, kind: FaultKind) {
        self.arm(point, kind, Some(1));
    }

    /// Arms a fault that fires until disarmed.
    pub fn fail_always(&self, point: FaultPoint, kind: FaultKind) {
        self.arm(point, kind, None);
    }

    /// Arms a fault that fires `times` times.
    pub fn arm(&self, point: FaultPoint, kind: FaultKind, times: Option<usize>) {
        self.armed.lock().insert(
            point,
            Armed {
                kind,
                remaining: times,
            },
        );
    }

    /// Disarms the fault at `point`.
    pub fn disarm(&self, point: FaultPoint) {
        self.armed.lock().remove(&point);
    }

    /// Disarms every fault.
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    /// Fires the fault armed at `point`, if any.
    pub(crate) fn check(&self, point: FaultPoint, savepoint: Option<&str>) -> Result<(), StorageError> {
        let mut armed = self.armed.lock();
        let Some(entry) = armed.get_mut(&point) else {
            return Ok(());
        };
        let kind = entry.kind.clone();
        if let Some(remaining) = entry.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                armed.remove(&point);
            }
        }
        tracing::debug!(?point, ?kind, "injected fault fired");
        Err(match kind {
            FaultKind::Backend(message) => StorageError::Injected { point, message },
            FaultKind::SavepointLost => StorageError::SavepointNotFound {
                name: savepoint.unwrap_or_default().to_owned(),
            },
        })
    }
}
