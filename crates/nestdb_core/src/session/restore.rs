//! Bringing in-memory state back to the start of a rolled back scope.

use super::Session;
use crate::state::{ObjectStatus, Snapshot};
use crate::types::{IdentityKey, InstanceId, TransactionId};
use std::collections::{BTreeSet, HashMap};

impl Session {
    /// Reverts tracked objects to how they stood when the node at `pos`
    /// began, consuming the bookkeeping of that node and every node above it.
    ///
    /// A root scope expires every persistent object, since its values may
    /// predate the transaction. A savepoint scope restores the values
    /// captured while it was open and leaves untouched objects alone.
    pub(crate) fn restore_scope(&mut self, pos: usize) {
        let Some(boundary) = self.stack.at(pos) else { return };
        let boundary_id = boundary.id;
        let is_root = pos == 0;

        let mut new = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        let mut captured: HashMap<InstanceId, Snapshot> = HashMap::new();
        let mut key_switches: HashMap<InstanceId, IdentityKey> = HashMap::new();
        for node in self.stack.iter_mut().skip(pos) {
            new.append(&mut node.new);
            deleted.append(&mut node.deleted);
            node.dirty.clear();
            for (id, snapshot) in node.captured.drain() {
                captured.entry(id).or_insert(snapshot);
            }
            for (id, key) in node.key_switches.drain() {
                key_switches.entry(id).or_insert(key);
            }
        }

        let in_scope =
            move |txn: Option<TransactionId>| is_root || txn.unwrap_or(TransactionId(0)) >= boundary_id;

        // Objects inserted or added inside the scope.
        let added: Vec<InstanceId> = self
            .pending_new
            .iter()
            .copied()
            .filter(|id| self.records.get(id).is_some_and(|r| in_scope(r.added_in)))
            .collect();
        let mut settled = BTreeSet::new();
        for id in new.into_iter().chain(added) {
            let Some(rec) = self.records.get_mut(&id) else { continue };
            if let Some(key) = rec.key.take() {
                self.identity.remove(&key, id);
            }
            self.pending_deleted.remove(&id);
            rec.is_deleted = false;
            rec.deleted_in = None;
            if in_scope(rec.added_in) {
                rec.status = ObjectStatus::Transient;
                rec.committed.clear();
                rec.added_in = None;
                self.pending_new.remove(&id);
            } else {
                // Added before the scope and inserted inside it: pending again.
                match captured.get(&id) {
                    Some(snapshot) => rec.restore(snapshot),
                    None => rec.committed.clear(),
                }
                rec.status = ObjectStatus::Pending;
                self.pending_new.insert(id);
            }
            settled.insert(id);
        }

        for (id, original) in key_switches {
            if settled.contains(&id) {
                continue;
            }
            let Some(rec) = self.records.get_mut(&id) else { continue };
            if let Some(key) = rec.key.take() {
                self.identity.remove(&key, id);
            }
            if rec.status == ObjectStatus::Persistent {
                self.identity.insert(original.clone(), id);
            }
            rec.key = Some(original);
        }

        // Deletions made inside the scope.
        let marked: Vec<InstanceId> = self
            .pending_deleted
            .iter()
            .copied()
            .filter(|id| self.records.get(id).is_some_and(|r| in_scope(r.deleted_in)))
            .collect();
        for id in deleted.into_iter().chain(marked) {
            if settled.contains(&id) {
                continue;
            }
            let Some(rec) = self.records.get_mut(&id) else { continue };
            if in_scope(rec.deleted_in) {
                rec.is_deleted = false;
                rec.deleted_in = None;
                self.pending_deleted.remove(&id);
            } else {
                self.pending_deleted.insert(id);
            }
            rec.status = ObjectStatus::Persistent;
            if let Some(key) = rec.key.clone() {
                self.identity.insert(key, id);
            }
        }

        // Values.
        let mapped: Vec<InstanceId> = self.identity.instances().collect();
        if is_root {
            for id in mapped {
                if let Some(rec) = self.records.get_mut(&id) {
                    rec.expire();
                }
            }
        } else {
            for (id, snapshot) in &captured {
                if settled.contains(id) {
                    continue;
                }
                if let Some(rec) = self.records.get_mut(id) {
                    rec.restore(snapshot);
                }
            }
            for id in mapped {
                if captured.contains_key(&id) {
                    continue;
                }
                if let Some(rec) = self.records.get_mut(&id) {
                    if rec.is_modified() {
                        rec.revert();
                    }
                }
            }
        }

        tracing::debug!(
            session = %self.id,
            txn = %boundary_id,
            root = is_root,
            evicted = settled.len(),
            "in-memory state restored"
        );
    }
}
