//! # NestDB Core
//!
//! Session layer for NestDB: an identity map and unit of work on top of a
//! stack of nested transactions.
//!
//! This crate provides:
//! - [`Session`] tracking objects as state records keyed by primary key
//! - Root transactions, savepoints (`begin_nested()`) and subtransactions
//!   (reentrant `begin()`), with per-level rollback of both the database
//!   and the in-memory objects
//! - Flush through a pluggable [`UnitOfWork`]
//! - Optional two-phase commit across several engines
//! - Lifecycle listeners ([`EventKind`])
//!
//! ## Error Model
//!
//! A failed flush deactivates the current transaction. Every operation
//! except `rollback()` then fails with [`CoreError::PendingRollback`],
//! which carries the original failure. Rolling back a subtransaction
//! leaves its enclosing transaction inactive until that is rolled back too.
//!
//! ## Example
//!
//! ```rust
//! use nestdb_core::{CoreError, Session};
//! use nestdb_storage::{row, MemoryEngine, TableDef};
//!
//! let engine = MemoryEngine::new();
//! engine.create_table(TableDef::new("users", "id"));
//!
//! let mut session = Session::new(engine.clone());
//! session.add("users", row([("id", 1)]));
//! session.commit().unwrap();
//!
//! session.add("users", row([("id", 1)]));
//! assert!(matches!(session.flush(), Err(CoreError::Persistence { .. })));
//! assert!(matches!(session.count("users"), Err(CoreError::PendingRollback { .. })));
//! session.rollback().unwrap();
//! assert_eq!(session.count("users").unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod events;
mod session;
mod state;
mod transaction;
mod types;
mod unit_of_work;

pub use config::{Config, RollbackScope};
pub use error::{CoreError, CoreResult};
pub use events::{EventKind, ListenerFn, ListenerId, SessionEvent};
pub use session::{Session, SessionBuilder, SharedSession};
pub use state::{IdentityMap, ObjectStatus, Snapshot, StateRecord};
pub use transaction::{TransactionInfo, TransactionKind, TransactionState};
pub use types::{BindId, IdentityKey, InstanceId, SessionId, TransactionId};
pub use unit_of_work::{
    Applied, ChangeExecutor, ChangeOp, DefaultUnitOfWork, FlushFailure, FlushPlan, FlushResult,
    FlushedChange, PlannedChange, UnitOfWork,
};
