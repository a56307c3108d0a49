//! Transaction nodes and the transaction stack.
//!
//! A session keeps one stack of open transactions. The bottom node is the
//! root and owns the physical connection leases. Nodes above it are either
//! savepoints (`begin_nested()`) or transparent subtransactions (reentrant
//! `begin()`).

mod node;
mod stack;

pub use node::{TransactionInfo, TransactionKind, TransactionState};

pub(crate) use node::{Deactivation, NodeKind, TransactionNode};
pub(crate) use stack::TransactionStack;
