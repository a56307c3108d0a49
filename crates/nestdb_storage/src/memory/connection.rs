//! Connections to a [`super::MemoryEngine`].

use super::engine::{Shared, TxnOp, Version};
use crate::connection::{Connection, ConnectionId, SavepointHandle};
use crate::error::{StorageError, StorageResult};
use crate::fault::FaultPoint;
use crate::schema::TableDef;
use crate::value::{Row, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single private write: `None` deletes the key.
#[derive(Debug, Clone)]
struct Write {
    table: String,
    key: Value,
    row: Option<Row>,
}

#[derive(Debug, Clone)]
struct Mark {
    handle: SavepointHandle,
    log_len: usize,
}

#[derive(Debug, Default)]
struct TxnState {
    snapshot: u64,
    log: Vec<Write>,
    overlay: BTreeMap<String, BTreeMap<Value, Option<Row>>>,
    marks: Vec<Mark>,
    prepared: bool,
}

impl TxnState {
    fn push(&mut self, write: Write) {
        self.overlay
            .entry(write.table.clone())
            .or_default()
            .insert(write.key.clone(), write.row.clone());
        self.log.push(write);
    }

    fn truncate(&mut self, len: usize) {
        self.log.truncate(len);
        self.overlay.clear();
        for write in &self.log {
            self.overlay
                .entry(write.table.clone())
                .or_default()
                .insert(write.key.clone(), write.row.clone());
        }
    }

    fn pending(&self, table: &str, key: &Value) -> Option<&Option<Row>> {
        self.overlay.get(table)?.get(key)
    }

    fn position(&self, handle: &SavepointHandle) -> StorageResult<usize> {
        self.marks
            .iter()
            .position(|m| &m.handle == handle)
            .ok_or_else(|| StorageError::SavepointNotFound {
                name: handle.name.clone(),
            })
    }
}

/// A connection to a [`super::MemoryEngine`].
pub struct MemoryConnection {
    id: ConnectionId,
    shared: Arc<Shared>,
    txn: Option<TxnState>,
    valid: bool,
    next_savepoint: u64,
}

impl MemoryConnection {
    pub(crate) fn new(id: ConnectionId, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            txn: None,
            valid: true,
            next_savepoint: 1,
        }
    }

    fn ensure_valid(&self) -> StorageResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(StorageError::ConnectionInvalidated)
        }
    }

    fn writable_txn(&mut self) -> StorageResult<&mut TxnState> {
        self.ensure_valid()?;
        let txn = self.txn.as_mut().ok_or(StorageError::NoTransaction)?;
        if txn.prepared {
            return Err(StorageError::Prepared);
        }
        Ok(txn)
    }

    fn record(&self, op: TxnOp) {
        self.shared.record(self.id, op);
    }

    /// Row visible to this connection under `key`.
    fn read(&self, table: &str, key: &Value) -> StorageResult<Option<Row>> {
        self.ensure_valid()?;
        if let Some(txn) = &self.txn {
            if let Some(pending) = txn.pending(table, key) {
                return Ok(pending.clone());
            }
        }
        let store = self.shared.store.read();
        let seq = self.snapshot(store.committed_seq);
        Ok(store.table(table)?.visible(key, seq).cloned())
    }

    fn snapshot(&self, committed: u64) -> u64 {
        self.txn.as_ref().map_or(committed, |t| t.snapshot)
    }

    /// Whether inserting `key` would collide with a visible or committed row.
    fn key_taken(&self, table: &str, key: &Value) -> StorageResult<bool> {
        if let Some(txn) = &self.txn {
            if let Some(pending) = txn.pending(table, key) {
                return Ok(pending.is_some());
            }
        }
        let store = self.shared.store.read();
        Ok(store.table(table)?.latest_exists(key))
    }

    fn check_conflicts(&self, txn: &TxnState) -> StorageResult<()> {
        let store = self.shared.store.read();
        for (table, writes) in &txn.overlay {
            let t = store.table(table)?;
            for key in writes.keys() {
                if t.latest_seq(key).is_some_and(|seq| seq > txn.snapshot) {
                    return Err(StorageError::WriteConflict {
                        table: table.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn begin(&mut self) -> StorageResult<()> {
        self.ensure_valid()?;
        if self.txn.is_some() {
            return Err(StorageError::TransactionInProgress);
        }
        self.shared.faults.check(FaultPoint::Begin, None)?;
        let snapshot = self.shared.store.read().committed_seq;
        self.txn = Some(TxnState {
            snapshot,
            ..TxnState::default()
        });
        self.record(TxnOp::Begin);
        tracing::trace!(connection = %self.id, snapshot, "begin");
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.ensure_valid()?;
        let Some(txn) = self.txn.as_ref() else {
            return Err(StorageError::NoTransaction);
        };
        self.shared.faults.check(FaultPoint::Commit, None)?;
        if !txn.prepared {
            self.check_conflicts(txn)?;
        }
        let Some(txn) = self.txn.take() else {
            return Err(StorageError::NoTransaction);
        };
        {
            let mut store = self.shared.store.write();
            store.committed_seq += 1;
            let seq = store.committed_seq;
            for (table, writes) in txn.overlay {
                let t = store.table_mut(&table)?;
                for (key, row) in writes {
                    t.rows.entry(key).or_default().push(Version { seq, row });
                }
            }
        }
        self.record(TxnOp::Commit);
        tracing::trace!(connection = %self.id, "commit");
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.ensure_valid()?;
        self.shared.faults.check(FaultPoint::Rollback, None)?;
        self.txn = None;
        self.record(TxnOp::Rollback);
        tracing::trace!(connection = %self.id, "rollback");
        Ok(())
    }

    fn prepare(&mut self) -> StorageResult<()> {
        self.ensure_valid()?;
        if !self.shared.options.two_phase {
            return Err(StorageError::Unsupported("two-phase commit".into()));
        }
        let Some(txn) = self.txn.as_ref() else {
            return Err(StorageError::NoTransaction);
        };
        self.shared.faults.check(FaultPoint::Prepare, None)?;
        self.check_conflicts(txn)?;
        if let Some(txn) = self.txn.as_mut() {
            txn.prepared = true;
        }
        self.record(TxnOp::Prepare);
        Ok(())
    }

    fn begin_savepoint(&mut self, name: &str) -> StorageResult<SavepointHandle> {
        if !self.shared.options.savepoints {
            return Err(StorageError::Unsupported("savepoints".into()));
        }
        self.writable_txn()?;
        self.shared.faults.check(FaultPoint::BeginSavepoint, Some(name))?;
        let handle = SavepointHandle {
            name: name.to_owned(),
            seq: self.next_savepoint,
        };
        self.next_savepoint += 1;
        let txn = self.writable_txn()?;
        let log_len = txn.log.len();
        txn.marks.push(Mark {
            handle: handle.clone(),
            log_len,
        });
        self.record(TxnOp::Savepoint(name.to_owned()));
        Ok(handle)
    }

    fn release_savepoint(&mut self, handle: &SavepointHandle) -> StorageResult<()> {
        self.writable_txn()?;
        self.shared
            .faults
            .check(FaultPoint::ReleaseSavepoint, Some(&handle.name))?;
        let txn = self.writable_txn()?;
        let pos = txn.position(handle)?;
        txn.marks.truncate(pos);
        self.record(TxnOp::Release(handle.name.clone()));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, handle: &SavepointHandle) -> StorageResult<()> {
        self.ensure_valid()?;
        if self.txn.is_none() {
            return Err(StorageError::NoTransaction);
        }
        self.shared
            .faults
            .check(FaultPoint::RollbackToSavepoint, Some(&handle.name))?;
        let Some(txn) = self.txn.as_mut() else {
            return Err(StorageError::NoTransaction);
        };
        let pos = txn.position(handle)?;
        let log_len = txn.marks[pos].log_len;
        txn.truncate(log_len);
        txn.marks.truncate(pos + 1);
        txn.prepared = false;
        self.record(TxnOp::RollbackTo(handle.name.clone()));
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.valid && self.txn.is_some()
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn invalidate(&mut self) {
        if self.valid {
            self.valid = false;
            self.txn = None;
            self.record(TxnOp::Invalidate);
            tracing::debug!(connection = %self.id, "connection invalidated");
        }
    }

    fn supports_savepoints(&self) -> bool {
        self.shared.options.savepoints
    }

    fn supports_two_phase(&self) -> bool {
        self.shared.options.two_phase
    }

    fn table_def(&self, table: &str) -> StorageResult<TableDef> {
        self.ensure_valid()?;
        Ok(self.shared.store.read().table(table)?.def.clone())
    }

    fn insert(&mut self, table: &str, mut row: Row) -> StorageResult<Value> {
        self.writable_txn()?;
        self.shared.faults.check(FaultPoint::Insert, None)?;
        let def = self.table_def(table)?;
        let key = match def.key_of(&row) {
            Some(key) => {
                if self.key_taken(table, &key)? {
                    return Err(StorageError::UniqueViolation {
                        table: table.to_owned(),
                        key,
                    });
                }
                self.shared.store.write().table_mut(table)?.bump_auto(&key);
                key
            }
            None if def.autoincrement => {
                let mut store = self.shared.store.write();
                let t = store.table_mut(table)?;
                let key = Value::Int(t.next_auto);
                t.next_auto += 1;
                row.insert(def.primary_key.clone(), key.clone());
                key
            }
            None => {
                return Err(StorageError::NotNull {
                    table: table.to_owned(),
                    column: def.primary_key,
                })
            }
        };
        def.check_required(&row)?;
        self.writable_txn()?.push(Write {
            table: table.to_owned(),
            key: key.clone(),
            row: Some(row),
        });
        Ok(key)
    }

    fn update(&mut self, table: &str, key: &Value, mut row: Row) -> StorageResult<()> {
        self.writable_txn()?;
        self.shared.faults.check(FaultPoint::Update, None)?;
        let def = self.table_def(table)?;
        if self.read(table, key)?.is_none() {
            return Err(StorageError::RowNotFound {
                table: table.to_owned(),
                key: key.clone(),
            });
        }
        let new_key = match def.key_of(&row) {
            Some(k) => k,
            None => {
                row.insert(def.primary_key.clone(), key.clone());
                key.clone()
            }
        };
        def.check_required(&row)?;
        if &new_key != key && self.key_taken(table, &new_key)? {
            return Err(StorageError::UniqueViolation {
                table: table.to_owned(),
                key: new_key,
            });
        }
        let txn = self.writable_txn()?;
        if &new_key != key {
            txn.push(Write {
                table: table.to_owned(),
                key: key.clone(),
                row: None,
            });
        }
        txn.push(Write {
            table: table.to_owned(),
            key: new_key,
            row: Some(row),
        });
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &Value) -> StorageResult<()> {
        self.writable_txn()?;
        self.shared.faults.check(FaultPoint::Delete, None)?;
        if self.read(table, key)?.is_none() {
            return Err(StorageError::RowNotFound {
                table: table.to_owned(),
                key: key.clone(),
            });
        }
        self.writable_txn()?.push(Write {
            table: table.to_owned(),
            key: key.clone(),
            row: None,
        });
        Ok(())
    }

    fn get(&mut self, table: &str, key: &Value) -> StorageResult<Option<Row>> {
        self.read(table, key)
    }

    fn scan(&mut self, table: &str) -> StorageResult<Vec<Row>> {
        self.ensure_valid()?;
        let mut rows: BTreeMap<Value, Row> = {
            let store = self.shared.store.read();
            let seq = self.snapshot(store.committed_seq);
            let t = store.table(table)?;
            t.rows
                .keys()
                .filter_map(|k| t.visible(k, seq).map(|r| (k.clone(), r.clone())))
                .collect()
        };
        if let Some(pending) = self.txn.as_ref().and_then(|t| t.overlay.get(table)) {
            for (key, row) in pending {
                match row {
                    Some(row) => {
                        rows.insert(key.clone(), row.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows.into_values().collect())
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("valid", &self.valid)
            .field("in_transaction", &self.txn.is_some())
            .finish_non_exhaustive()
    }
}
