//! Shared multi-version store behind [`MemoryEngine`].

use super::connection::MemoryConnection;
use crate::connection::{Connection, ConnectionId, Engine};
use crate::error::{StorageError, StorageResult};
use crate::fault::FaultInjector;
use crate::schema::TableDef;
use crate::value::{Row, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Capabilities advertised by a [`MemoryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Whether connections accept savepoint calls.
    pub savepoints: bool,
    /// Whether connections accept `prepare`.
    pub two_phase: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            savepoints: true,
            two_phase: true,
        }
    }
}

impl EngineOptions {
    /// Sets savepoint support.
    #[must_use]
    pub const fn savepoints(mut self, enabled: bool) -> Self {
        self.savepoints = enabled;
        self
    }

    /// Sets two-phase commit support.
    #[must_use]
    pub const fn two_phase(mut self, enabled: bool) -> Self {
        self.two_phase = enabled;
        self
    }
}

/// Transaction-control operation recorded in the engine journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// `begin()`.
    Begin,
    /// `commit()`.
    Commit,
    /// `rollback()`.
    Rollback,
    /// `prepare()`.
    Prepare,
    /// `begin_savepoint(name)`.
    Savepoint(String),
    /// `release_savepoint(name)`.
    Release(String),
    /// `rollback_to_savepoint(name)`.
    RollbackTo(String),
    /// `invalidate()`.
    Invalidate,
}

/// One journal line: which connection issued which operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Issuing connection.
    pub connection: ConnectionId,
    /// Operation issued.
    pub op: TxnOp,
}

#[derive(Debug, Clone)]
pub(crate) struct Version {
    pub(crate) seq: u64,
    pub(crate) row: Option<Row>,
}

#[derive(Debug)]
pub(crate) struct Table {
    pub(crate) def: TableDef,
    pub(crate) rows: BTreeMap<Value, Vec<Version>>,
    pub(crate) next_auto: i64,
}

impl Table {
    /// Row visible at snapshot `seq`.
    pub(crate) fn visible(&self, key: &Value, seq: u64) -> Option<&Row> {
        self.rows
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.seq <= seq)
            .and_then(|v| v.row.as_ref())
    }

    /// Sequence number of the newest committed version of `key`.
    pub(crate) fn latest_seq(&self, key: &Value) -> Option<u64> {
        self.rows.get(key)?.last().map(|v| v.seq)
    }

    /// Whether the newest committed version of `key` is a live row.
    pub(crate) fn latest_exists(&self, key: &Value) -> bool {
        self.rows
            .get(key)
            .and_then(|versions| versions.last())
            .is_some_and(|v| v.row.is_some())
    }

    pub(crate) fn bump_auto(&mut self, key: &Value) {
        if let Some(k) = key.as_int() {
            if k >= self.next_auto {
                self.next_auto = k + 1;
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    pub(crate) tables: BTreeMap<String, Table>,
    pub(crate) committed_seq: u64,
    pub(crate) journal: Vec<JournalEntry>,
}

impl Store {
    pub(crate) fn table(&self, name: &str) -> StorageResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_owned()))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> StorageResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_owned()))
    }
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) options: EngineOptions,
    pub(crate) store: RwLock<Store>,
    pub(crate) faults: FaultInjector,
    next_connection: AtomicU64,
}

impl Shared {
    pub(crate) fn record(&self, connection: ConnectionId, op: TxnOp) {
        self.store.write().journal.push(JournalEntry { connection, op });
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// An in-memory, multi-version transactional engine.
///
/// Every connection opened from the same engine shares one store. Each
/// transaction reads a snapshot fixed at `begin` (repeatable read) and its
/// writes stay private until commit. A commit that overwrites a row some
/// other transaction committed after this snapshot fails with
/// [`StorageError::WriteConflict`].
///
/// Savepoints and two-phase commit are supported unless disabled through
/// [`EngineOptions`]. Every transaction-control call is appended to a
/// journal that tests can inspect.
///
/// # Example
///
/// ```rust
/// use nestdb_storage::{row, Connection, Engine, MemoryEngine, TableDef, Value};
///
/// let engine = MemoryEngine::new();
/// engine.create_table(TableDef::new("users", "id").autoincrement());
///
/// let mut conn = engine.connect().unwrap();
/// conn.begin().unwrap();
/// let pk = conn.insert("users", row([("name", "ed")])).unwrap();
/// conn.commit().unwrap();
///
/// assert_eq!(pk, Value::Int(1));
/// assert_eq!(engine.committed_count("users"), 1);
/// ```
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an engine with every capability enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    /// Creates an engine with the given capabilities.
    #[must_use]
    pub fn with_options(options: EngineOptions) -> Self {
        Self::named("memory", options)
    }

    /// Creates a named engine; the name shows up in logs.
    #[must_use]
    pub fn named(name: impl Into<String>, options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                options,
                store: RwLock::new(Store::default()),
                faults: FaultInjector::new(),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Defines a table. Redefining an existing table keeps its rows.
    pub fn create_table(&self, def: TableDef) {
        let mut store = self.shared.store.write();
        match store.tables.get_mut(&def.name) {
            Some(table) => table.def = def,
            None => {
                store.tables.insert(
                    def.name.clone(),
                    Table {
                        def,
                        rows: BTreeMap::new(),
                        next_auto: 1,
                    },
                );
            }
        }
    }

    /// Commits rows directly, bypassing connections.
    ///
    /// Useful for seeding fixtures. Autoincrement keys are assigned to rows
    /// that lack one.
    pub fn load(&self, table: &str, rows: impl IntoIterator<Item = Row>) -> StorageResult<()> {
        let mut store = self.shared.store.write();
        store.committed_seq += 1;
        let seq = store.committed_seq;
        let table = store.table_mut(table)?;
        for mut row in rows {
            table.def.check_required(&row)?;
            let key = match table.def.key_of(&row) {
                Some(key) => key,
                None if table.def.autoincrement => {
                    let key = Value::Int(table.next_auto);
                    row.insert(table.def.primary_key.clone(), key.clone());
                    key
                }
                None => {
                    return Err(StorageError::NotNull {
                        table: table.def.name.clone(),
                        column: table.def.primary_key.clone(),
                    })
                }
            };
            if table.latest_exists(&key) {
                return Err(StorageError::UniqueViolation {
                    table: table.def.name.clone(),
                    key,
                });
            }
            table.bump_auto(&key);
            table
                .rows
                .entry(key)
                .or_default()
                .push(Version { seq, row: Some(row) });
        }
        Ok(())
    }

    /// Returns the fault injector shared by this engine's connections.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.shared.faults
    }

    /// Returns a copy of the transaction-control journal.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.shared.store.read().journal.clone()
    }

    /// Empties the journal.
    pub fn clear_journal(&self) {
        self.shared.store.write().journal.clear();
    }

    /// Returns the latest committed rows of `table`, ordered by key.
    #[must_use]
    pub fn committed_rows(&self, table: &str) -> Vec<Row> {
        let store = self.shared.store.read();
        let seq = store.committed_seq;
        store
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .keys()
                    .filter_map(|k| t.visible(k, seq).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of committed rows in `table`.
    #[must_use]
    pub fn committed_count(&self, table: &str) -> usize {
        self.committed_rows(table).len()
    }

    /// Returns the engine's capabilities.
    #[must_use]
    pub fn options(&self) -> EngineOptions {
        self.shared.options
    }
}

impl Engine for MemoryEngine {
    fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        let id = ConnectionId(self.shared.next_connection.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(engine = %self.shared.name, connection = %id, "connection opened");
        Ok(Box::new(MemoryConnection::new(id, Arc::clone(&self.shared))))
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("name", &self.shared.name)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}
