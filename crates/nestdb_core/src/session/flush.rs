//! Flush: writing pending changes through the unit of work.

use super::Session;
use crate::error::{CoreError, CoreResult};
use crate::events::EventKind;
use crate::state::ObjectStatus;
use crate::transaction::Deactivation;
use crate::types::{BindId, IdentityKey, InstanceId};
use crate::unit_of_work::{
    Applied, ChangeExecutor, ChangeOp, FlushPlan, FlushedChange, PlannedChange,
};
use nestdb_storage::{Connection, StorageError, StorageResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Runs planned writes on the root's leased connections.
struct LeaseExecutor<'a> {
    leases: &'a mut BTreeMap<BindId, Box<dyn Connection>>,
    binds: &'a HashMap<String, BindId>,
}

impl ChangeExecutor for LeaseExecutor<'_> {
    fn execute(&mut self, change: &PlannedChange) -> StorageResult<Applied> {
        let bind = self
            .binds
            .get(&change.entity)
            .copied()
            .unwrap_or(BindId::DEFAULT);
        let conn = self.leases.get_mut(&bind).ok_or_else(|| {
            StorageError::Unsupported(format!("no connection leased for {bind}"))
        })?;
        match &change.op {
            ChangeOp::Insert => {
                let key = conn.insert(&change.entity, change.row.clone())?;
                Ok(Applied::Inserted { key })
            }
            ChangeOp::Update { key } => {
                conn.update(&change.entity, key, change.row.clone())?;
                Ok(Applied::Updated)
            }
            ChangeOp::Delete { key } => {
                conn.delete(&change.entity, key)?;
                Ok(Applied::Deleted)
            }
        }
    }
}

impl Session {
    /// Writes every pending change to the current transaction.
    ///
    /// A storage failure leaves the in-memory state untouched and
    /// deactivates the current transaction: every operation except
    /// `rollback()` then fails with `PendingRollback`.
    pub fn flush(&mut self) -> CoreResult<()> {
        if self.flushing {
            return Err(CoreError::invalid_request("session is already flushing"));
        }
        if self.is_clean() {
            return Ok(());
        }
        self.ensure_sql_allowed()?;

        self.flushing = true;
        let result = self.flush_once();
        self.flushing = false;
        if !result? {
            return Ok(());
        }

        let current = self.current_ref();
        if let Err(e) = self.dispatch(EventKind::AfterFlushPostexec, current) {
            return Err(self.fail_current(e));
        }
        Ok(())
    }

    /// One flush pass; returns whether anything was written.
    fn flush_once(&mut self) -> CoreResult<bool> {
        let current = self.current_ref();
        if let Err(e) = self.dispatch(EventKind::BeforeFlush, current) {
            return Err(self.fail_current(e));
        }

        let plan = self.build_plan();
        if plan.is_empty() {
            return Ok(false);
        }
        let mut entities: BTreeSet<&str> = BTreeSet::new();
        for change in &plan.changes {
            entities.insert(&change.entity);
        }
        for entity in entities {
            let bind = self.bind_for(entity);
            self.engage(bind)?;
            self.table_def(entity)?;
        }
        if self.stack.has_savepoint() {
            self.capture_for_flush(&plan);
        }

        let result = {
            let Some(leases) = self.stack.leases_mut() else {
                return Err(CoreError::invalid_request("no transaction is begun"));
            };
            let mut executor = LeaseExecutor {
                leases,
                binds: &self.entity_binds,
            };
            self.unit_of_work.flush(&plan, &mut executor)
        };

        if let Some(failure) = result.failed {
            let message = format!(
                "{} on {} failed: {}",
                failure.op.verb(),
                failure.entity,
                failure.error
            );
            tracing::warn!(
                session = %self.id,
                txn = ?current.map(|(id, _)| id),
                instance = %failure.instance,
                executed = result.committed.len(),
                %message,
                "flush failed; transaction deactivated"
            );
            if let Some(node) = self.stack.current_mut() {
                node.deactivate(Deactivation::Failure(failure.error.to_string()));
            }
            return Err(CoreError::persistence(message, failure.error));
        }

        if let Err(e) = self.dispatch(EventKind::AfterFlush, current) {
            return Err(self.fail_current(e));
        }
        self.apply_flush(&plan, &result.committed)?;
        tracing::debug!(
            session = %self.id,
            txn = ?current.map(|(id, _)| id),
            writes = result.committed.len(),
            "flushed"
        );
        Ok(true)
    }

    /// Deactivates the current node after a listener failure.
    pub(crate) fn fail_current(&mut self, error: CoreError) -> CoreError {
        if let Some(node) = self.stack.current_mut() {
            node.deactivate(Deactivation::Failure(error.to_string()));
        }
        match error {
            CoreError::Persistence { .. } => error,
            CoreError::Storage(source) => {
                CoreError::persistence("flush listener failed", source)
            }
            other => CoreError::persistence_msg(format!("flush listener failed: {other}")),
        }
    }

    fn build_plan(&self) -> FlushPlan {
        let mut changes = Vec::new();
        for &id in &self.pending_deleted {
            let Some(rec) = self.records.get(&id) else { continue };
            if let Some(key) = rec.key() {
                changes.push(PlannedChange {
                    instance: id,
                    entity: rec.entity().to_owned(),
                    op: ChangeOp::Delete {
                        key: key.pk.clone(),
                    },
                    row: rec.committed().clone(),
                });
            }
        }
        for id in self.identity.instances() {
            let Some(rec) = self.records.get(&id) else { continue };
            if !Self::needs_update(rec) {
                continue;
            }
            if let Some(key) = rec.key() {
                changes.push(PlannedChange {
                    instance: id,
                    entity: rec.entity().to_owned(),
                    op: ChangeOp::Update {
                        key: key.pk.clone(),
                    },
                    row: rec.current().clone(),
                });
            }
        }
        for &id in &self.pending_new {
            let Some(rec) = self.records.get(&id) else { continue };
            changes.push(PlannedChange {
                instance: id,
                entity: rec.entity().to_owned(),
                op: ChangeOp::Insert,
                row: rec.current().clone(),
            });
        }
        FlushPlan { changes }
    }

    /// Records, on the current node, the values an enclosing savepoint
    /// rollback must bring back for every object this flush touches.
    fn capture_for_flush(&mut self, plan: &FlushPlan) {
        let Some(node) = self.stack.current_mut() else { return };
        for change in &plan.changes {
            let Some(rec) = self.records.get(&change.instance) else { continue };
            let snapshot = match change.op {
                ChangeOp::Insert => rec.snapshot(),
                _ => rec.clean_snapshot(),
            };
            node.captured.entry(change.instance).or_insert(snapshot);
        }
    }

    /// Moves records to their post-flush state and attributes each change
    /// to the current node.
    fn apply_flush(&mut self, plan: &FlushPlan, committed: &[FlushedChange]) -> CoreResult<()> {
        let planned: HashMap<InstanceId, &PlannedChange> =
            plan.changes.iter().map(|c| (c.instance, c)).collect();
        for change in committed {
            let Some(planned) = planned.get(&change.instance) else { continue };
            let def = self.table_def(&planned.entity)?;
            let id = change.instance;
            let Some(node) = self.stack.current_mut() else {
                return Err(CoreError::invalid_request("no transaction is begun"));
            };
            let Some(rec) = self.records.get_mut(&id) else { continue };

            match &change.applied {
                Applied::Inserted { key } => {
                    rec.current
                        .insert(def.primary_key.clone(), key.clone());
                    rec.mark_flushed();
                    rec.status = ObjectStatus::Persistent;
                    let identity_key = IdentityKey::new(&planned.entity, key.clone());
                    rec.key = Some(identity_key.clone());
                    self.identity.insert(identity_key, id);
                    self.pending_new.remove(&id);
                    node.new.insert(id);
                }
                Applied::Updated => {
                    rec.mark_flushed();
                    if let Some(old) = rec.key.clone() {
                        let pk = def.key_of(&rec.current).unwrap_or_else(|| old.pk.clone());
                        if pk != old.pk {
                            let switched = IdentityKey::new(&planned.entity, pk);
                            self.identity.remove(&old, id);
                            self.identity.insert(switched.clone(), id);
                            rec.key = Some(switched);
                            node.key_switches.entry(id).or_insert(old);
                        }
                    }
                    node.dirty.insert(id);
                }
                Applied::Deleted => {
                    if let Some(key) = &rec.key {
                        self.identity.remove(key, id);
                    }
                    rec.status = ObjectStatus::Deleted;
                    self.pending_deleted.remove(&id);
                    node.deleted.insert(id);
                }
            }
        }
        Ok(())
    }
}
