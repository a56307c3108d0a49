//! Core type definitions for NestDB.

use nestdb_storage::Value;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a transaction node.
///
/// Transaction IDs are monotonically increasing within a session and never
/// reused, so an ID that is no longer on the stack always refers to a closed
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Handle to a tracked object inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Identifier of a session, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an engine bound to a session.
///
/// [`BindId::DEFAULT`] is the engine the session was built with; entity
/// types bound elsewhere get further IDs in bind order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindId(pub u32);

impl BindId {
    /// The session's default engine.
    pub const DEFAULT: Self = Self(0);
}

impl fmt::Display for BindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bind:{}", self.0)
    }
}

/// Key under which a persistent object lives in the identity map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey {
    /// Entity type (table) name.
    pub entity: String,
    /// Primary key value.
    pub pk: Value,
}

impl IdentityKey {
    /// Creates an identity key.
    #[must_use]
    pub fn new(entity: impl Into<String>, pk: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            pk: pk.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity, self.pk)
    }
}
