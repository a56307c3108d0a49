//! Session lifecycle listeners.

use crate::error::CoreResult;
use crate::session::Session;
use crate::transaction::TransactionKind;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Lifecycle points at which listeners run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A transaction node was pushed.
    AfterBegin,
    /// A flush is about to compute its plan; listeners may still add objects.
    BeforeFlush,
    /// A flush executed; record state not yet updated.
    AfterFlush,
    /// A flush executed and record state is updated.
    AfterFlushPostexec,
    /// A root or savepoint commit is about to flush.
    BeforeCommit,
    /// A root transaction committed. No SQL may be issued from here.
    AfterCommit,
    /// A physical rollback happened. No SQL may be issued from here.
    AfterRollback,
    /// A transaction node was rolled back and removed from the stack.
    AfterSoftRollback,
}

/// What a listener is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Lifecycle point.
    pub kind: EventKind,
    /// Transaction involved, if any.
    pub transaction: Option<TransactionId>,
    /// Kind of that transaction.
    pub transaction_kind: Option<TransactionKind>,
}

/// Handle returned by `Session::listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// A registered callback.
pub type ListenerFn = Box<dyn FnMut(&mut Session, &SessionEvent) -> CoreResult<()> + Send>;

pub(crate) type SharedCallback = Arc<Mutex<ListenerFn>>;

pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) kind: EventKind,
    pub(crate) callback: SharedCallback,
}

/// Ordered list of listeners.
///
/// Dispatch works on a snapshot of the callbacks registered for one kind, so
/// callbacks can take `&mut Session` and events raised from inside a
/// callback still reach every listener. A callback already running further
/// up the stack is not re-entered.
#[derive(Default)]
pub(crate) struct Listeners {
    pub(crate) entries: Vec<Listener>,
    next_id: u64,
}

impl Listeners {
    pub(crate) fn add(&mut self, kind: EventKind, callback: ListenerFn) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push(Listener {
            id,
            kind,
            callback: Arc::new(Mutex::new(callback)),
        });
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) {
        self.entries.retain(|l| l.id != id);
    }

    pub(crate) fn contains(&self, id: ListenerId) -> bool {
        self.entries.iter().any(|l| l.id == id)
    }

    /// Callbacks for `kind`, in registration order.
    pub(crate) fn snapshot(&self, kind: EventKind) -> Vec<(ListenerId, SharedCallback)> {
        self.entries
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| (l.id, Arc::clone(&l.callback)))
            .collect()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ListenerFn {
        Box::new(|_, _| Ok(()))
    }

    #[test]
    fn ids_are_distinct() {
        let mut listeners = Listeners::default();
        let a = listeners.add(EventKind::AfterBegin, noop());
        let b = listeners.add(EventKind::AfterBegin, noop());
        assert_ne!(a, b);
        assert_eq!(listeners.snapshot(EventKind::AfterBegin).len(), 2);
        assert!(listeners.snapshot(EventKind::AfterCommit).is_empty());
    }

    #[test]
    fn snapshot_keeps_order_and_survives_removal() {
        let mut listeners = Listeners::default();
        let a = listeners.add(EventKind::AfterBegin, noop());
        let b = listeners.add(EventKind::AfterBegin, noop());
        listeners.add(EventKind::AfterCommit, noop());

        let snapshot = listeners.snapshot(EventKind::AfterBegin);
        listeners.remove(a);

        let ids: Vec<_> = snapshot.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(!listeners.contains(a));
        assert!(listeners.contains(b));
    }
}
