//! In-memory engine for tests and embedded use.

mod connection;
mod engine;

pub use connection::MemoryConnection;
pub use engine::{EngineOptions, JournalEntry, MemoryEngine, TxnOp};
