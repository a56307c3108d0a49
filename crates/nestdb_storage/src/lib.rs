//! # NestDB Storage
//!
//! Connection abstraction and an in-memory transactional engine for NestDB.
//!
//! This crate is the lowest layer of NestDB. It knows about tables, rows,
//! transactions and savepoints, and nothing about sessions, identity maps or
//! units of work.
//!
//! ## Design Principles
//!
//! - A [`Connection`] is a physical transaction boundary: begin, commit,
//!   rollback, prepare and nested savepoints
//! - Rows are primary-key addressed maps of [`Value`]s
//! - Engines are `Send + Sync` and hand out connections
//! - Failures are plain [`StorageError`]s; the session layer classifies them
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - multi-version store with snapshot reads, savepoints,
//!   two-phase commit and fault injection
//!
//! ## Example
//!
//! ```rust
//! use nestdb_storage::{row, Connection, Engine, MemoryEngine, TableDef};
//!
//! let engine = MemoryEngine::new();
//! engine.create_table(TableDef::new("users", "id").autoincrement());
//!
//! let mut conn = engine.connect().unwrap();
//! conn.begin().unwrap();
//! let sp = conn.begin_savepoint("sp_1").unwrap();
//! conn.insert("users", row([("name", "ed")])).unwrap();
//! conn.rollback_to_savepoint(&sp).unwrap();
//! conn.commit().unwrap();
//!
//! assert_eq!(engine.committed_count("users"), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod fault;
mod memory;
mod schema;
mod value;

pub use connection::{Connection, ConnectionId, Engine, SavepointHandle};
pub use error::{StorageError, StorageResult};
pub use fault::{FaultInjector, FaultKind, FaultPoint};
pub use memory::{EngineOptions, JournalEntry, MemoryConnection, MemoryEngine, TxnOp};
pub use schema::TableDef;
pub use value::{row, Row, Value};
