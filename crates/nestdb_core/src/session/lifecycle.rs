//! Begin, commit, prepare, rollback and close.

use super::Session;
use crate::config::RollbackScope;
use crate::error::{CoreError, CoreResult};
use crate::events::EventKind;
use crate::state::ObjectStatus;
use crate::transaction::{
    Deactivation, NodeKind, TransactionKind, TransactionNode, TransactionState,
};
use crate::types::{BindId, TransactionId};
use nestdb_storage::StorageError;
use std::collections::BTreeMap;

impl Session {
    /// Begins a transaction.
    ///
    /// With no transaction open this begins the root; connections are
    /// leased lazily on first use. Otherwise it begins a subtransaction,
    /// a marker that shares its enclosing transaction's fate; this needs
    /// `allow_subtransactions`.
    pub fn begin(&mut self) -> CoreResult<TransactionId> {
        let Some(current) = self.stack.current() else {
            return self.begin_root();
        };
        if !self.config.allow_subtransactions {
            return Err(CoreError::invalid_request(
                "a transaction is already begun; use begin_nested() for a savepoint",
            ));
        }
        if let Some(err) = current.unavailable() {
            return Err(err);
        }
        let id = self.stack.push(NodeKind::Subtransaction);
        tracing::debug!(session = %self.id, txn = %id, depth = self.stack.len(), "begin subtransaction");
        self.dispatch(EventKind::AfterBegin, Some((id, TransactionKind::Subtransaction)))?;
        Ok(id)
    }

    pub(crate) fn begin_root(&mut self) -> CoreResult<TransactionId> {
        let id = self.stack.push(NodeKind::Root {
            leases: BTreeMap::new(),
        });
        tracing::debug!(session = %self.id, txn = %id, "begin");
        self.dispatch(EventKind::AfterBegin, Some((id, TransactionKind::Root)))?;
        Ok(id)
    }

    /// Begins a savepoint inside the current transaction.
    ///
    /// Pending changes are flushed first (see `flush_on_begin_nested`), so
    /// that a rollback of the savepoint only discards what happened after
    /// this call. Every leased connection gets the savepoint.
    pub fn begin_nested(&mut self) -> CoreResult<TransactionId> {
        let Some(current) = self.stack.current() else {
            return Err(CoreError::unsupported(
                "begin_nested() requires an enclosing transaction",
            ));
        };
        if let Some(err) = current.unavailable() {
            return Err(err);
        }
        if self.config.flush_on_begin_nested {
            self.flush()?;
        }
        if self.stack.leases().map_or(true, BTreeMap::is_empty) {
            self.engage(BindId::DEFAULT)?;
        }
        if let Some(leases) = self.stack.leases() {
            if let Some(bind) = leases
                .iter()
                .find(|(_, conn)| !conn.supports_savepoints())
                .map(|(bind, _)| *bind)
            {
                return Err(CoreError::unsupported(format!(
                    "the connection for {bind} does not support savepoints"
                )));
            }
        }

        self.savepoint_seq += 1;
        let name = format!("{}_{}", self.config.savepoint_prefix, self.savepoint_seq);
        let mut handles = BTreeMap::new();
        if let Some(leases) = self.stack.leases_mut() {
            let mut failure = None;
            for (bind, conn) in leases.iter_mut() {
                match conn.begin_savepoint(&name) {
                    Ok(handle) => {
                        handles.insert(*bind, handle);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(error) = failure {
                for (bind, handle) in &handles {
                    if let Some(conn) = leases.get_mut(bind) {
                        if let Err(e) = conn.release_savepoint(handle) {
                            tracing::warn!(savepoint = %name, %bind, error = %e, "release after failed savepoint begin failed");
                        }
                    }
                }
                return Err(error.into());
            }
        }

        let captured = self
            .identity
            .instances()
            .filter_map(|id| {
                let rec = self.records.get(&id)?;
                rec.is_modified().then(|| (id, rec.snapshot()))
            })
            .collect();
        let id = self.stack.push(NodeKind::Savepoint {
            name: name.clone(),
            handles,
        });
        if let Some(node) = self.stack.current_mut() {
            node.captured = captured;
        }
        tracing::debug!(session = %self.id, txn = %id, savepoint = %name, depth = self.stack.len(), "begin nested");
        self.dispatch(EventKind::AfterBegin, Some((id, TransactionKind::Savepoint)))?;
        Ok(id)
    }

    /// Commits the current transaction.
    ///
    /// With no transaction open, pending changes are committed in a fresh
    /// root transaction; otherwise this is a no-op.
    pub fn commit(&mut self) -> CoreResult<()> {
        match self.stack.current().map(|n| n.id) {
            Some(id) => self.commit_transaction(id),
            None if self.is_clean() => Ok(()),
            None => {
                let id = self.begin_root()?;
                self.commit_transaction(id)
            }
        }
    }

    /// Commits `id`, first committing every transaction opened inside it.
    pub fn commit_transaction(&mut self, id: TransactionId) -> CoreResult<()> {
        let pos = self.stack.locate(id)?;
        if let Some(node) = self.stack.at(pos) {
            if matches!(
                node.state,
                TransactionState::Deactive | TransactionState::Committed
            ) {
                if let Some(err) = node.unavailable() {
                    return Err(err);
                }
            }
        }
        while self.stack.len() > pos + 1 {
            self.commit_current()?;
        }
        self.commit_current()
    }

    fn commit_current(&mut self) -> CoreResult<()> {
        let Some(node) = self.stack.current() else {
            return Ok(());
        };
        let (id, kind, state) = (node.id, node.kind(), node.state);
        match state {
            TransactionState::Active => {
                self.pre_commit(id, kind)?;
                if kind == TransactionKind::Root && self.config.two_phase {
                    self.prepare_leases()?;
                }
            }
            TransactionState::Prepared => {}
            _ => {
                return Err(node
                    .unavailable()
                    .unwrap_or(CoreError::ClosedTransaction { txn: id }));
            }
        }

        let physical = match kind {
            TransactionKind::Root => self.commit_leases(),
            TransactionKind::Savepoint => self.release_savepoint(),
            TransactionKind::Subtransaction => Ok(()),
        };
        if let Err(error) = physical {
            tracing::warn!(session = %self.id, txn = %id, %error, "commit failed; transaction deactivated");
            if let Some(node) = self.stack.current_mut() {
                node.deactivate(Deactivation::Failure(error.to_string()));
            }
            return Err(CoreError::persistence(format!("commit of {id} failed"), error));
        }

        if let Some(node) = self.stack.current_mut() {
            node.state = TransactionState::Committed;
        }
        tracing::debug!(session = %self.id, txn = %id, kind = ?kind, "commit");

        let listener = if kind == TransactionKind::Root {
            self.dispatch(EventKind::AfterCommit, Some((id, kind)))
        } else {
            Ok(())
        };
        if let Some(node) = self.stack.pop_into_parent() {
            if kind == TransactionKind::Root {
                self.finish_root_commit(&node);
            }
        }
        listener
    }

    /// Runs `before_commit` listeners and flushes until nothing is pending.
    fn pre_commit(&mut self, id: TransactionId, kind: TransactionKind) -> CoreResult<()> {
        if kind != TransactionKind::Subtransaction {
            if let Err(e) = self.dispatch(EventKind::BeforeCommit, Some((id, kind))) {
                if let Some(node) = self.stack.current_mut() {
                    node.deactivate(Deactivation::Failure(e.to_string()));
                }
                return Err(e);
            }
        }

        let limit = self.config.max_flush_iterations;
        let mut flushes = 0;
        while !self.is_clean() {
            if flushes >= limit {
                tracing::warn!(session = %self.id, txn = %id, limit, "flush loop limit reached during commit");
                let error = CoreError::FlushLoop { limit };
                if let Some(node) = self.stack.current_mut() {
                    node.deactivate(Deactivation::Failure(error.to_string()));
                }
                return Err(error);
            }
            self.flush()?;
            flushes += 1;
        }
        Ok(())
    }

    fn commit_leases(&mut self) -> Result<(), StorageError> {
        let Some(leases) = self.stack.leases_mut() else {
            return Ok(());
        };
        for conn in leases.values_mut() {
            conn.commit()?;
        }
        Ok(())
    }

    fn release_savepoint(&mut self) -> Result<(), StorageError> {
        let handles = match self.stack.current().map(|n| &n.kind) {
            Some(NodeKind::Savepoint { handles, .. }) => handles.clone(),
            _ => return Ok(()),
        };
        let Some(leases) = self.stack.leases_mut() else {
            return Ok(());
        };
        for (bind, handle) in &handles {
            if let Some(conn) = leases.get_mut(bind) {
                conn.release_savepoint(handle)?;
            }
        }
        Ok(())
    }

    fn finish_root_commit(&mut self, root: &TransactionNode) {
        for id in &root.deleted {
            if let Some(rec) = self.records.get_mut(id) {
                if rec.status == ObjectStatus::Deleted {
                    rec.status = ObjectStatus::Detached;
                }
            }
        }
        if self.config.expire_on_commit {
            self.expire_all();
        }
    }

    /// Flushes and prepares the root transaction for two-phase commit.
    ///
    /// After this only `commit()` or `rollback()` is accepted.
    pub fn prepare(&mut self) -> CoreResult<()> {
        if !self.config.two_phase {
            return Err(CoreError::unsupported(
                "prepare() requires two-phase commit to be enabled",
            ));
        }
        let Some(node) = self.stack.current() else {
            return Err(CoreError::invalid_request("no transaction is begun"));
        };
        if node.kind() != TransactionKind::Root {
            return Err(CoreError::unsupported(
                "only the root transaction can be prepared",
            ));
        }
        if let Some(err) = node.unavailable() {
            return Err(err);
        }
        let (id, kind) = (node.id, node.kind());
        self.pre_commit(id, kind)?;
        self.prepare_leases()
    }

    /// Prepares every leased connection; on failure rolls all of them back.
    fn prepare_leases(&mut self) -> CoreResult<()> {
        let failure = {
            let Some(leases) = self.stack.leases_mut() else {
                return Ok(());
            };
            if let Some(bind) = leases
                .iter()
                .find(|(_, conn)| !conn.supports_two_phase())
                .map(|(bind, _)| *bind)
            {
                return Err(CoreError::unsupported(format!(
                    "the connection for {bind} does not support two-phase commit"
                )));
            }
            let mut failure = None;
            for (bind, conn) in leases.iter_mut() {
                if let Err(e) = conn.prepare() {
                    failure = Some((*bind, e));
                    break;
                }
            }
            if failure.is_some() {
                for (bind, conn) in leases.iter_mut() {
                    if let Err(e) = conn.rollback() {
                        tracing::warn!(%bind, error = %e, "rollback after failed prepare failed; invalidating connection");
                        conn.invalidate();
                    }
                }
            }
            failure
        };

        let Some((bind, error)) = failure else {
            if let Some(root) = self.stack.at_mut(0) {
                root.state = TransactionState::Prepared;
            }
            tracing::debug!(session = %self.id, "prepared");
            return Ok(());
        };
        tracing::warn!(session = %self.id, %bind, %error, "prepare failed; transaction rolled back");
        self.restore_scope(0);
        if let Some(root) = self.stack.at_mut(0) {
            root.deactivate(Deactivation::Failure(error.to_string()));
            root.rolled_back = true;
        }
        Err(CoreError::persistence(
            format!("prepare failed for {bind}"),
            error,
        ))
    }

    /// Rolls back the current transaction, or the root when
    /// `rollback_scope` is `Outermost`.
    ///
    /// With no transaction open this is a no-op.
    pub fn rollback(&mut self) -> CoreResult<()> {
        let target = match self.config.rollback_scope {
            RollbackScope::Innermost => self.stack.current(),
            RollbackScope::Outermost => self.stack.root(),
        }
        .map(|n| n.id);
        match target {
            Some(id) => self.rollback_transaction(id),
            None => Ok(()),
        }
    }

    /// Rolls back `id`, closing every transaction opened inside it first.
    ///
    /// Rolling back a subtransaction rolls back the enclosing savepoint or
    /// root and leaves it inactive until it is rolled back in turn.
    pub fn rollback_transaction(&mut self, id: TransactionId) -> CoreResult<()> {
        let pos = self.stack.locate(id)?;
        if self
            .stack
            .current()
            .is_some_and(|n| n.state == TransactionState::Committed)
        {
            return Err(CoreError::invalid_request(
                "this transaction is in the committed state; it cannot be rolled back",
            ));
        }
        let primary = self
            .stack
            .iter()
            .skip(pos)
            .find_map(|n| n.failure().map(str::to_owned));
        while self.stack.len() > pos + 1 {
            if let Some(node) = self.stack.pop_into_parent() {
                tracing::debug!(session = %self.id, txn = %node.id, "closed by enclosing rollback");
            }
        }
        match self.stack.current().map(TransactionNode::kind) {
            Some(TransactionKind::Subtransaction) => self.rollback_subtransaction(primary),
            Some(_) => self.rollback_boundary(primary),
            None => Ok(()),
        }
    }

    fn rollback_subtransaction(&mut self, primary: Option<String>) -> CoreResult<()> {
        let top = self.stack.len() - 1;
        let boundary = self.stack.boundary_at_or_below(top);
        let reason = match &primary {
            Some(cause) => Deactivation::Failure(cause.clone()),
            None => Deactivation::NestedRollback,
        };
        for pos in boundary + 1..top {
            if let Some(node) = self.stack.at_mut(pos) {
                node.deactivate(reason.clone());
            }
        }

        let mut secondary = None;
        let (boundary_id, boundary_kind, rolled_back) = match self.stack.at(boundary) {
            Some(node) => (node.id, node.kind(), node.rolled_back),
            None => return Ok(()),
        };
        if rolled_back {
            if !self.is_clean() {
                tracing::warn!(session = %self.id, "session state changed on a transaction that was already rolled back; discarding it");
                self.restore_scope(boundary);
            }
        } else {
            secondary = self.physical_rollback(boundary);
            if boundary_kind == TransactionKind::Savepoint && boundary > 0 {
                if let Some(error) = &secondary {
                    let cause = primary.clone().unwrap_or_else(|| error.to_string());
                    self.fail_enclosing(boundary - 1, cause);
                }
            }
            self.restore_scope(boundary);
            if let Some(node) = self.stack.at_mut(boundary) {
                node.deactivate(reason);
                node.rolled_back = true;
            }
            tracing::debug!(session = %self.id, txn = %boundary_id, "rolled back by subtransaction");
            if let Err(e) = self.dispatch(EventKind::AfterRollback, Some((boundary_id, boundary_kind))) {
                secondary.get_or_insert(e);
            }
        }

        if let Some(node) = self.stack.pop() {
            tracing::debug!(session = %self.id, txn = %node.id, "rollback subtransaction");
            if let Err(e) = self.dispatch(
                EventKind::AfterSoftRollback,
                Some((node.id, TransactionKind::Subtransaction)),
            ) {
                secondary.get_or_insert(e);
            }
        }
        self.finish_rollback(primary, secondary)
    }

    fn rollback_boundary(&mut self, primary: Option<String>) -> CoreResult<()> {
        let pos = self.stack.len() - 1;
        let Some(node) = self.stack.at(pos) else {
            return Ok(());
        };
        let (id, kind) = (node.id, node.kind());
        let physical = match node.state {
            TransactionState::Active | TransactionState::Prepared => true,
            TransactionState::Deactive => !node.rolled_back,
            TransactionState::Committed | TransactionState::Closed => false,
        };

        let mut secondary = None;
        let mut savepoint_failure = None;
        if physical {
            secondary = self.physical_rollback(pos);
            if kind == TransactionKind::Savepoint {
                savepoint_failure = secondary.as_ref().map(ToString::to_string);
            }
            self.restore_scope(pos);
            if let Some(node) = self.stack.at_mut(pos) {
                node.state = TransactionState::Deactive;
                node.rolled_back = true;
            }
            tracing::debug!(session = %self.id, txn = %id, kind = ?kind, "rollback");
            if let Err(e) = self.dispatch(EventKind::AfterRollback, Some((id, kind))) {
                secondary.get_or_insert(e);
            }
        } else if !self.is_clean() {
            tracing::warn!(
                session = %self.id,
                txn = %id,
                "session state changed on a non-active transaction; this state will be discarded"
            );
            self.restore_scope(pos);
        }

        self.stack.pop();
        if kind == TransactionKind::Savepoint {
            while let Some(parent) = self.stack.current() {
                if parent.kind() != TransactionKind::Subtransaction
                    || parent.state != TransactionState::Active
                {
                    break;
                }
                let Some(closed) = self.stack.pop_into_parent() else {
                    break;
                };
                tracing::debug!(session = %self.id, txn = %closed.id, "rolled back with its savepoint");
                if let Err(e) = self.dispatch(
                    EventKind::AfterSoftRollback,
                    Some((closed.id, TransactionKind::Subtransaction)),
                ) {
                    secondary.get_or_insert(e);
                }
            }
        }
        if let Some(error) = savepoint_failure {
            if let Some(top) = self.stack.len().checked_sub(1) {
                self.fail_enclosing(top, primary.clone().unwrap_or(error));
            }
        }
        if let Err(e) = self.dispatch(EventKind::AfterSoftRollback, Some((id, kind))) {
            secondary.get_or_insert(e);
        }
        self.finish_rollback(primary, secondary)
    }

    /// Deactivates the node at `top` and everything down to its boundary.
    ///
    /// Used when a savepoint could not be rolled back: its writes are still
    /// part of the enclosing transaction, which must not commit them.
    fn fail_enclosing(&mut self, top: usize, cause: String) {
        let boundary = self.stack.boundary_at_or_below(top);
        for pos in boundary..=top {
            if let Some(node) = self.stack.at_mut(pos) {
                node.deactivate(Deactivation::Failure(cause.clone()));
            }
        }
        tracing::warn!(session = %self.id, %cause, "savepoint rollback failed; enclosing transaction deactivated");
    }

    /// Rolls back the connections of the boundary node at `pos`.
    ///
    /// Returns the first error; every connection is attempted.
    fn physical_rollback(&mut self, pos: usize) -> Option<CoreError> {
        let savepoint = match &self.stack.at(pos)?.kind {
            NodeKind::Root { .. } => None,
            NodeKind::Savepoint { name, handles } => Some((name.clone(), handles.clone())),
            NodeKind::Subtransaction => return None,
        };
        let leases = self.stack.leases_mut()?;
        let mut first: Option<CoreError> = None;
        match savepoint {
            None => {
                for (bind, conn) in leases.iter_mut() {
                    if let Err(e) = conn.rollback() {
                        tracing::warn!(%bind, error = %e, "rollback failed; invalidating connection");
                        conn.invalidate();
                        first.get_or_insert(e.into());
                    }
                }
            }
            Some((name, handles)) => {
                for (bind, handle) in &handles {
                    let Some(conn) = leases.get_mut(bind) else { continue };
                    match conn.rollback_to_savepoint(handle) {
                        Ok(()) => {}
                        Err(e) if e.is_savepoint_lost() => {
                            tracing::warn!(savepoint = %name, %bind, "savepoint already deassociated from the connection; skipping");
                        }
                        Err(e) => {
                            first.get_or_insert(e.into());
                        }
                    }
                }
            }
        }
        first
    }

    /// The original failure wins over errors raised while rolling back.
    fn finish_rollback(&self, primary: Option<String>, secondary: Option<CoreError>) -> CoreResult<()> {
        match (primary, secondary) {
            (_, None) => Ok(()),
            (Some(cause), Some(error)) => {
                tracing::warn!(session = %self.id, %error, %cause, "error during rollback suppressed in favour of the original failure");
                Ok(())
            }
            (None, Some(error)) => Err(error),
        }
    }

    /// Rolls back and closes every transaction and detaches every object.
    pub fn close(&mut self) {
        for mut node in self.stack.clear() {
            if let NodeKind::Root { leases } = &mut node.kind {
                for (bind, conn) in leases.iter_mut() {
                    if conn.is_valid() && conn.in_transaction() {
                        if let Err(e) = conn.rollback() {
                            tracing::warn!(session = %self.id, %bind, error = %e, "rollback on close failed");
                        }
                    }
                }
            }
        }
        self.expunge_all();
        tracing::debug!(session = %self.id, "closed");
    }

    /// Invalidates every leased connection, then closes.
    pub fn invalidate(&mut self) {
        if let Some(leases) = self.stack.leases_mut() {
            for conn in leases.values_mut() {
                conn.invalidate();
            }
        }
        self.close();
    }

    fn expunge_all(&mut self) {
        for rec in self.records.values_mut() {
            rec.status = match rec.status {
                ObjectStatus::Pending => ObjectStatus::Transient,
                ObjectStatus::Persistent | ObjectStatus::Deleted => ObjectStatus::Detached,
                other => other,
            };
        }
        self.identity.clear();
        self.pending_new.clear();
        self.pending_deleted.clear();
    }

    /// Runs `f` in a transaction: commits on `Ok`, rolls back on `Err`.
    ///
    /// Begins the root when none is open, otherwise a subtransaction.
    pub fn with_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Session) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let id = self.begin()?;
        self.run_scoped(id, f)
    }

    /// Runs `f` in a savepoint: releases it on `Ok`, rolls it back on `Err`.
    pub fn with_nested<T>(&mut self, f: impl FnOnce(&mut Session) -> CoreResult<T>) -> CoreResult<T> {
        let id = self.begin_nested()?;
        self.run_scoped(id, f)
    }

    fn run_scoped<T>(
        &mut self,
        id: TransactionId,
        f: impl FnOnce(&mut Session) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let result = f(self).and_then(|value| {
            if self.stack.position(id).is_none() {
                return Ok(value);
            }
            self.commit_transaction(id).map(|()| value)
        });
        if result.is_err() && self.stack.position(id).is_some() {
            if let Err(e) = self.rollback_transaction(id) {
                tracing::warn!(session = %self.id, txn = %id, error = %e, "rollback after failed block failed");
            }
        }
        result
    }
}
