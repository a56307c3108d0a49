//! Transaction nodes: one frame of the transaction stack.

use crate::error::CoreError;
use crate::state::Snapshot;
use crate::types::{BindId, IdentityKey, InstanceId, TransactionId};
use nestdb_storage::{Connection, SavepointHandle};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Kind of a transaction node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Outermost transaction; owns the connection leases.
    Root,
    /// Reentrant `begin()` layer with no physical counterpart.
    Subtransaction,
    /// `begin_nested()` layer backed by a savepoint on every lease.
    Savepoint,
}

/// State of a transaction node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting work.
    Active,
    /// Failed or rolled back underneath; only `rollback()` is accepted.
    Deactive,
    /// Prepared for two-phase commit; only `commit()` or `rollback()` is accepted.
    Prepared,
    /// Committed; `after_commit` listeners are running.
    Committed,
    /// Finished. Closed nodes are no longer on the stack.
    Closed,
}

/// Why a node was deactivated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deactivation {
    /// A flush or commit failed with this message.
    Failure(String),
    /// A subtransaction underneath was rolled back.
    NestedRollback,
}

impl Deactivation {
    pub(crate) fn cause(&self) -> Option<&str> {
        match self {
            Self::Failure(message) => Some(message),
            Self::NestedRollback => None,
        }
    }
}

pub(crate) type Leases = BTreeMap<BindId, Box<dyn Connection>>;

pub(crate) enum NodeKind {
    Root { leases: Leases },
    Subtransaction,
    Savepoint {
        name: String,
        handles: BTreeMap<BindId, SavepointHandle>,
    },
}

impl NodeKind {
    pub(crate) fn kind(&self) -> TransactionKind {
        match self {
            Self::Root { .. } => TransactionKind::Root,
            Self::Subtransaction => TransactionKind::Subtransaction,
            Self::Savepoint { .. } => TransactionKind::Savepoint,
        }
    }
}

/// One frame of the transaction stack.
///
/// The `dirty`, `new` and `deleted` sets attribute flushed changes to the
/// node that was current when they were flushed. `captured` holds the
/// record values a rollback of an enclosing savepoint restores, and
/// `key_switches` the identity keys objects had before an UPDATE changed
/// their primary key.
pub(crate) struct TransactionNode {
    pub(crate) id: TransactionId,
    pub(crate) parent: Option<TransactionId>,
    pub(crate) kind: NodeKind,
    pub(crate) state: TransactionState,
    pub(crate) deactivation: Option<Deactivation>,
    pub(crate) rolled_back: bool,
    pub(crate) dirty: BTreeSet<InstanceId>,
    pub(crate) new: BTreeSet<InstanceId>,
    pub(crate) deleted: BTreeSet<InstanceId>,
    pub(crate) captured: HashMap<InstanceId, Snapshot>,
    pub(crate) key_switches: HashMap<InstanceId, IdentityKey>,
}

impl TransactionNode {
    pub(crate) fn new(id: TransactionId, parent: Option<TransactionId>, kind: NodeKind) -> Self {
        Self {
            id,
            parent,
            kind,
            state: TransactionState::Active,
            deactivation: None,
            rolled_back: false,
            dirty: BTreeSet::new(),
            new: BTreeSet::new(),
            deleted: BTreeSet::new(),
            captured: HashMap::new(),
            key_switches: HashMap::new(),
        }
    }

    pub(crate) fn kind(&self) -> TransactionKind {
        self.kind.kind()
    }

    pub(crate) fn is_boundary(&self) -> bool {
        !matches!(self.kind, NodeKind::Subtransaction)
    }

    pub(crate) fn deactivate(&mut self, reason: Deactivation) {
        if self.state != TransactionState::Closed {
            self.state = TransactionState::Deactive;
        }
        if self.deactivation.is_none() {
            self.deactivation = Some(reason);
        }
    }

    /// Primary cause recorded when the node was deactivated by a failure.
    pub(crate) fn failure(&self) -> Option<&str> {
        self.deactivation.as_ref().and_then(Deactivation::cause)
    }

    /// The error an operation other than rollback gets in the current state.
    pub(crate) fn unavailable(&self) -> Option<CoreError> {
        match self.state {
            TransactionState::Active => None,
            TransactionState::Deactive => Some(match &self.deactivation {
                Some(Deactivation::Failure(cause)) => CoreError::pending_rollback(cause.clone()),
                Some(Deactivation::NestedRollback) => CoreError::inactive(
                    "this transaction is inactive due to a rollback in a subtransaction; \
                     issue rollback() to fully reset",
                ),
                None => CoreError::inactive("this transaction has been rolled back"),
            }),
            TransactionState::Prepared => Some(CoreError::invalid_request(
                "this transaction is prepared; no further SQL can be emitted",
            )),
            TransactionState::Committed => Some(CoreError::invalid_request(
                "this transaction is in the committed state; no further SQL can be emitted",
            )),
            TransactionState::Closed => Some(CoreError::ClosedTransaction { txn: self.id }),
        }
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.dirty.is_empty() && self.new.is_empty() && self.deleted.is_empty()
    }

    /// Folds a finished child's bookkeeping into this node.
    ///
    /// Values already captured by this node win: they are older.
    pub(crate) fn absorb(&mut self, child: &mut TransactionNode) {
        self.dirty.append(&mut child.dirty);
        self.new.append(&mut child.new);
        self.deleted.append(&mut child.deleted);
        for (id, snapshot) in child.captured.drain() {
            self.captured.entry(id).or_insert(snapshot);
        }
        for (id, key) in child.key_switches.drain() {
            self.key_switches.entry(id).or_insert(key);
        }
    }

    pub(crate) fn info(&self, depth: usize) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            parent: self.parent,
            kind: self.kind(),
            state: self.state,
            depth,
            savepoint: match &self.kind {
                NodeKind::Savepoint { name, .. } => Some(name.clone()),
                _ => None,
            },
            dirty: self.dirty.iter().copied().collect(),
            new: self.new.iter().copied().collect(),
            deleted: self.deleted.iter().copied().collect(),
        }
    }
}

impl fmt::Debug for TransactionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionNode")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("kind", &self.kind())
            .field("state", &self.state)
            .field("deactivation", &self.deactivation)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a live transaction node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Node ID.
    pub id: TransactionId,
    /// Enclosing node, if any.
    pub parent: Option<TransactionId>,
    /// Node kind.
    pub kind: TransactionKind,
    /// Node state.
    pub state: TransactionState,
    /// Position on the stack; the root is at depth 0.
    pub depth: usize,
    /// Savepoint name for savepoint nodes.
    pub savepoint: Option<String>,
    /// Objects updated by flushes attributed to this node.
    pub dirty: Vec<InstanceId>,
    /// Objects inserted by flushes attributed to this node.
    pub new: Vec<InstanceId>,
    /// Objects deleted by flushes attributed to this node.
    pub deleted: Vec<InstanceId>,
}

impl TransactionInfo {
    /// True for savepoint-backed nodes.
    #[must_use]
    pub fn nested(&self) -> bool {
        self.kind == TransactionKind::Savepoint
    }

    /// True while the node accepts work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }
}
