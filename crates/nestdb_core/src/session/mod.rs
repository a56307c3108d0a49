//! The session: identity map, transaction stack and unit of work together.
//!
//! A [`Session`] tracks objects (as [`StateRecord`]s keyed by [`InstanceId`])
//! and a stack of logical transactions over one connection lease per bound
//! engine. Callers add, edit and delete objects in memory; `flush()` writes
//! the pending changes through the unit of work, and `commit()`/`rollback()`
//! on a transaction decide which of them survive, in the database and in
//! memory.
//!
//! # Concurrency
//!
//! A session is `Send` but expects serialized access. Use [`SharedSession`]
//! to share one across threads. Separate sessions hold separate
//! connections; isolation between them is whatever the engine provides.
//!
//! # Example
//!
//! ```rust
//! use nestdb_core::Session;
//! use nestdb_storage::{row, MemoryEngine, TableDef};
//!
//! let engine = MemoryEngine::new();
//! engine.create_table(TableDef::new("users", "id").autoincrement());
//!
//! let mut session = Session::new(engine.clone());
//! session.begin().unwrap();
//! session.add("users", row([("name", "ed")]));
//! session.begin_nested().unwrap();
//! session.add("users", row([("name", "jack")]));
//! assert_eq!(session.count("users").unwrap(), 2);
//! session.rollback().unwrap();
//! session.commit().unwrap();
//!
//! assert_eq!(engine.committed_count("users"), 1);
//! ```

mod flush;
mod lifecycle;
mod restore;
mod shared;

pub use shared::SharedSession;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventKind, ListenerFn, ListenerId, Listeners, SessionEvent};
use crate::state::{IdentityMap, ObjectStatus, StateRecord};
use crate::transaction::{
    NodeKind, TransactionInfo, TransactionKind, TransactionState, TransactionStack,
};
use crate::types::{BindId, IdentityKey, InstanceId, SessionId, TransactionId};
use crate::unit_of_work::{DefaultUnitOfWork, UnitOfWork};
use nestdb_storage::{Connection, Engine, Row, TableDef, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Builds a [`Session`].
pub struct SessionBuilder {
    engine: Arc<dyn Engine>,
    binds: Vec<(String, Arc<dyn Engine>)>,
    config: Config,
    unit_of_work: Box<dyn UnitOfWork>,
}

impl SessionBuilder {
    /// Starts a builder whose default engine is `engine`.
    #[must_use]
    pub fn new(engine: impl Engine + 'static) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    /// Starts a builder from a shared engine.
    #[must_use]
    pub fn from_arc(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            binds: Vec::new(),
            config: Config::default(),
            unit_of_work: Box::new(DefaultUnitOfWork),
        }
    }

    /// Routes `entity` to `engine` instead of the default engine.
    #[must_use]
    pub fn bind_entity(mut self, entity: impl Into<String>, engine: impl Engine + 'static) -> Self {
        self.binds.push((entity.into(), Arc::new(engine)));
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Enables or disables two-phase commit.
    #[must_use]
    pub fn two_phase(mut self, enabled: bool) -> Self {
        self.config.two_phase = enabled;
        self
    }

    /// Replaces the unit of work.
    #[must_use]
    pub fn unit_of_work(mut self, unit_of_work: impl UnitOfWork + 'static) -> Self {
        self.unit_of_work = Box::new(unit_of_work);
        self
    }

    /// Builds the session.
    #[must_use]
    pub fn build(self) -> Session {
        let mut engines = vec![self.engine];
        let mut entity_binds = HashMap::new();
        for (entity, engine) in self.binds {
            let bind = BindId(u32::try_from(engines.len()).unwrap_or(u32::MAX));
            engines.push(engine);
            entity_binds.insert(entity, bind);
        }
        let session = Session {
            id: SessionId::generate(),
            config: self.config,
            engines,
            entity_binds,
            schemas: HashMap::new(),
            stack: TransactionStack::new(),
            records: BTreeMap::new(),
            identity: IdentityMap::new(),
            pending_new: BTreeSet::new(),
            pending_deleted: BTreeSet::new(),
            next_instance: 1,
            savepoint_seq: 0,
            listeners: Listeners::default(),
            unit_of_work: self.unit_of_work,
            flushing: false,
        };
        tracing::debug!(session = %session.id, binds = session.engines.len(), "session created");
        session
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Coordinates tracked objects with a stack of nested transactions.
pub struct Session {
    id: SessionId,
    config: Config,
    engines: Vec<Arc<dyn Engine>>,
    entity_binds: HashMap<String, BindId>,
    schemas: HashMap<String, TableDef>,
    stack: TransactionStack,
    records: BTreeMap<InstanceId, StateRecord>,
    identity: IdentityMap,
    pending_new: BTreeSet<InstanceId>,
    pending_deleted: BTreeSet<InstanceId>,
    next_instance: u64,
    savepoint_seq: u64,
    listeners: Listeners,
    unit_of_work: Box<dyn UnitOfWork>,
    flushing: bool,
}

impl Session {
    /// Creates a session over `engine` with default configuration.
    #[must_use]
    pub fn new(engine: impl Engine + 'static) -> Self {
        SessionBuilder::new(engine).build()
    }

    /// Starts a [`SessionBuilder`].
    #[must_use]
    pub fn builder(engine: impl Engine + 'static) -> SessionBuilder {
        SessionBuilder::new(engine)
    }

    /// Returns the session ID.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// True while any transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.stack.is_empty()
    }

    /// True while a savepoint transaction is open.
    #[must_use]
    pub fn in_nested_transaction(&self) -> bool {
        self.stack.has_savepoint()
    }

    /// The root transaction, if one is open.
    #[must_use]
    pub fn get_transaction(&self) -> Option<TransactionId> {
        self.stack.root().map(|n| n.id)
    }

    /// The innermost savepoint transaction, if one is open.
    #[must_use]
    pub fn get_nested_transaction(&self) -> Option<TransactionId> {
        self.stack.innermost_savepoint().map(|n| n.id)
    }

    /// The innermost open transaction.
    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.stack.current().map(|n| n.id)
    }

    /// Details of a live transaction.
    #[must_use]
    pub fn transaction_info(&self, id: TransactionId) -> Option<TransactionInfo> {
        let pos = self.stack.position(id)?;
        self.stack.at(pos).map(|n| n.info(pos))
    }

    /// State of any transaction this session created; retired ones are closed.
    #[must_use]
    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        self.stack.state_of(id)
    }

    /// Number of open transactions.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// False while the current transaction refuses work.
    ///
    /// A session with no transaction is active: the next operation begins one.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stack
            .current()
            .map_or(true, |n| n.state == TransactionState::Active)
    }

    /// True if `id` is pending or persistent in this session.
    #[must_use]
    pub fn contains(&self, id: InstanceId) -> bool {
        self.records
            .get(&id)
            .is_some_and(|r| matches!(r.status, ObjectStatus::Pending | ObjectStatus::Persistent))
    }

    /// Lifecycle status of `id`.
    #[must_use]
    pub fn status(&self, id: InstanceId) -> Option<ObjectStatus> {
        self.records.get(&id).map(StateRecord::status)
    }

    /// True if `id` has unflushed edits.
    #[must_use]
    pub fn is_modified(&self, id: InstanceId) -> bool {
        self.records.get(&id).is_some_and(StateRecord::is_modified)
    }

    /// Read-only view of a record.
    #[must_use]
    pub fn state(&self, id: InstanceId) -> Option<&StateRecord> {
        self.records.get(&id)
    }

    /// The identity map.
    #[must_use]
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity
    }

    /// Instance stored under `key`, if loaded.
    #[must_use]
    pub fn instance_for(&self, key: &IdentityKey) -> Option<InstanceId> {
        self.identity.get(key)
    }

    /// Objects awaiting INSERT.
    #[must_use]
    pub fn new_instances(&self) -> Vec<InstanceId> {
        self.pending_new.iter().copied().collect()
    }

    /// Persistent objects with unflushed edits.
    #[must_use]
    pub fn dirty_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self
            .identity
            .instances()
            .filter(|id| self.records.get(id).is_some_and(Self::needs_update))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Objects awaiting DELETE.
    #[must_use]
    pub fn deleted_instances(&self) -> Vec<InstanceId> {
        self.pending_deleted.iter().copied().collect()
    }

    /// True if a flush has anything to write.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.is_clean()
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Adds a new object; it is inserted by the next flush.
    pub fn add(&mut self, entity: impl Into<String>, values: Row) -> InstanceId {
        let id = self.next_instance_id();
        let added_in = self.stack.current().map(|n| n.id);
        self.records
            .insert(id, StateRecord::pending(id, entity, values, added_in));
        self.pending_new.insert(id);
        tracing::trace!(session = %self.id, instance = %id, "added");
        id
    }

    /// Re-attaches a transient or detached object.
    pub fn add_instance(&mut self, id: InstanceId) -> CoreResult<()> {
        let current = self.stack.current().map(|n| n.id);
        let rec = self
            .records
            .get_mut(&id)
            .ok_or(CoreError::UnknownInstance(id))?;
        match rec.status {
            ObjectStatus::Pending | ObjectStatus::Persistent => Ok(()),
            ObjectStatus::Transient => {
                rec.status = ObjectStatus::Pending;
                rec.added_in = current;
                rec.key = None;
                rec.committed.clear();
                self.pending_new.insert(id);
                Ok(())
            }
            ObjectStatus::Detached => {
                let Some(key) = rec.key.clone().filter(|_| !rec.is_deleted) else {
                    return Err(CoreError::invalid_request(format!(
                        "instance {id} has been deleted and cannot be re-attached"
                    )));
                };
                if self.identity.get(&key).is_some_and(|other| other != id) {
                    return Err(CoreError::invalid_request(format!(
                        "another instance with key {key} is already present in this session"
                    )));
                }
                rec.status = ObjectStatus::Persistent;
                self.identity.insert(key, id);
                Ok(())
            }
            ObjectStatus::Deleted => Err(CoreError::invalid_request(format!(
                "instance {id} has been deleted; commit or roll back first"
            ))),
        }
    }

    /// Marks a persistent object for deletion by the next flush.
    pub fn delete(&mut self, id: InstanceId) -> CoreResult<()> {
        let current = self.stack.current().map(|n| n.id);
        let rec = self
            .records
            .get_mut(&id)
            .ok_or(CoreError::UnknownInstance(id))?;
        match rec.status {
            ObjectStatus::Persistent => {
                if !rec.is_deleted {
                    rec.is_deleted = true;
                    rec.deleted_in = current;
                    self.pending_deleted.insert(id);
                }
                Ok(())
            }
            ObjectStatus::Deleted => Ok(()),
            ObjectStatus::Pending => Err(CoreError::invalid_request(format!(
                "instance {id} is not persisted"
            ))),
            ObjectStatus::Transient | ObjectStatus::Detached => {
                Err(CoreError::DetachedInstance(id))
            }
        }
    }

    /// Removes an object from the session without touching the database.
    pub fn expunge(&mut self, id: InstanceId) -> CoreResult<()> {
        let rec = self
            .records
            .get_mut(&id)
            .ok_or(CoreError::UnknownInstance(id))?;
        match rec.status {
            ObjectStatus::Pending => {
                rec.status = ObjectStatus::Transient;
                self.pending_new.remove(&id);
                Ok(())
            }
            ObjectStatus::Persistent | ObjectStatus::Deleted => {
                if let Some(key) = &rec.key {
                    self.identity.remove(key, id);
                }
                rec.status = ObjectStatus::Detached;
                self.pending_deleted.remove(&id);
                Ok(())
            }
            ObjectStatus::Transient | ObjectStatus::Detached => Err(CoreError::invalid_request(
                format!("instance {id} is not present in this session"),
            )),
        }
    }

    /// Loads an object by primary key, consulting the identity map first.
    pub fn get(&mut self, entity: &str, pk: impl Into<Value>) -> CoreResult<Option<InstanceId>> {
        let key = IdentityKey::new(entity, pk);
        self.ensure_sql_allowed()?;
        self.autoflush()?;
        if let Some(id) = self.identity.get(&key) {
            if !self.records.get(&id).is_some_and(StateRecord::is_expired) {
                return Ok(Some(id));
            }
            return match self.load_expired(id) {
                Ok(()) => Ok(Some(id)),
                Err(CoreError::ObjectDeleted { .. }) => Ok(None),
                Err(e) => Err(e),
            };
        }
        let bind = self.bind_for(entity);
        let row = self.lease(bind)?.get(entity, &key.pk)?;
        Ok(row.map(|row| self.register_loaded(key, row)))
    }

    /// Loads every row of `entity`; objects already in the identity map keep
    /// their in-memory values.
    pub fn query(&mut self, entity: &str) -> CoreResult<Vec<InstanceId>> {
        self.ensure_sql_allowed()?;
        self.autoflush()?;
        let def = self.table_def(entity)?;
        let bind = self.bind_for(entity);
        let rows = self.lease(bind)?.scan(entity)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(pk) = def.key_of(&row) {
                ids.push(self.register_loaded(IdentityKey::new(entity, pk), row));
            }
        }
        Ok(ids)
    }

    /// Counts rows of `entity` as seen by the current transaction.
    pub fn count(&mut self, entity: &str) -> CoreResult<usize> {
        self.ensure_sql_allowed()?;
        self.autoflush()?;
        let bind = self.bind_for(entity);
        Ok(self.lease(bind)?.count(entity)?)
    }

    /// Reads one column, reloading an expired object first.
    pub fn value(&mut self, id: InstanceId, column: &str) -> CoreResult<Value> {
        if self.record(id)?.is_expired() {
            self.load_expired(id)?;
        }
        Ok(self
            .record(id)?
            .get(column)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Reads every column, reloading an expired object first.
    pub fn values(&mut self, id: InstanceId) -> CoreResult<Row> {
        if self.record(id)?.is_expired() {
            self.load_expired(id)?;
        }
        Ok(self.record(id)?.current().clone())
    }

    /// Sets one column in memory; the next flush writes it.
    pub fn set_value(
        &mut self,
        id: InstanceId,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let rec = self.record(id)?;
        if rec.status() == ObjectStatus::Deleted {
            return Err(CoreError::invalid_request(format!(
                "instance {id} has been deleted"
            )));
        }
        if rec.is_expired() {
            self.load_expired(id)?;
        }
        self.record_mut(id)?.set(column, value.into());
        Ok(())
    }

    /// Discards in-memory values and reloads them from the database.
    pub fn refresh(&mut self, id: InstanceId) -> CoreResult<()> {
        if self.record(id)?.status() != ObjectStatus::Persistent {
            return Err(CoreError::DetachedInstance(id));
        }
        self.record_mut(id)?.expire();
        self.load_expired(id)
    }

    /// Marks an object's values stale; the next read reloads them.
    pub fn expire(&mut self, id: InstanceId) -> CoreResult<()> {
        let rec = self.record_mut(id)?;
        if rec.status() == ObjectStatus::Persistent {
            rec.expire();
        }
        Ok(())
    }

    /// Expires every object in the identity map.
    pub fn expire_all(&mut self) {
        for id in self.identity.instances() {
            if let Some(rec) = self.records.get_mut(&id) {
                rec.expire();
            }
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// The default engine's connection for the current transaction.
    ///
    /// Begins a transaction if none is open and autobegin is enabled.
    pub fn connection(&mut self) -> CoreResult<&mut dyn Connection> {
        self.ensure_sql_allowed()?;
        self.lease(BindId::DEFAULT)
    }

    /// The connection `entity` is routed to.
    pub fn connection_for(&mut self, entity: &str) -> CoreResult<&mut dyn Connection> {
        self.ensure_sql_allowed()?;
        let bind = self.bind_for(entity);
        self.lease(bind)
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers a listener; listeners run in registration order.
    pub fn listen<F>(&mut self, kind: EventKind, callback: F) -> ListenerId
    where
        F: FnMut(&mut Session, &SessionEvent) -> CoreResult<()> + Send + 'static,
    {
        self.listeners.add(kind, Box::new(callback))
    }

    /// Removes a listener.
    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(id);
    }

    pub(crate) fn dispatch(
        &mut self,
        kind: EventKind,
        transaction: Option<(TransactionId, TransactionKind)>,
    ) -> CoreResult<()> {
        let targets = self.listeners.snapshot(kind);
        if targets.is_empty() {
            return Ok(());
        }
        let event = SessionEvent {
            kind,
            transaction: transaction.map(|(id, _)| id),
            transaction_kind: transaction.map(|(_, k)| k),
        };
        for (id, callback) in targets {
            if !self.listeners.contains(id) {
                continue;
            }
            let Some(mut guard) = callback.try_lock() else {
                continue;
            };
            let callback: &mut ListenerFn = &mut guard;
            callback(self, &event)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn next_instance_id(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        id
    }

    pub(crate) fn record(&self, id: InstanceId) -> CoreResult<&StateRecord> {
        self.records.get(&id).ok_or(CoreError::UnknownInstance(id))
    }

    pub(crate) fn record_mut(&mut self, id: InstanceId) -> CoreResult<&mut StateRecord> {
        self.records
            .get_mut(&id)
            .ok_or(CoreError::UnknownInstance(id))
    }

    fn needs_update(rec: &StateRecord) -> bool {
        rec.status == ObjectStatus::Persistent && !rec.is_deleted && rec.is_modified()
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.pending_new.is_empty()
            && self.pending_deleted.is_empty()
            && !self
                .identity
                .instances()
                .any(|id| self.records.get(&id).is_some_and(Self::needs_update))
    }

    pub(crate) fn current_ref(&self) -> Option<(TransactionId, TransactionKind)> {
        self.stack.current().map(|n| (n.id, n.kind()))
    }

    pub(crate) fn bind_for(&self, entity: &str) -> BindId {
        self.entity_binds
            .get(entity)
            .copied()
            .unwrap_or(BindId::DEFAULT)
    }

    /// Fails unless the current transaction may issue SQL, beginning one if allowed.
    pub(crate) fn ensure_sql_allowed(&mut self) -> CoreResult<()> {
        if self.stack.is_empty() {
            if !self.config.autobegin {
                return Err(CoreError::invalid_request(
                    "no transaction is begun and autobegin is disabled",
                ));
            }
            self.begin_root()?;
        }
        match self.stack.current().and_then(|n| n.unavailable()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn autoflush(&mut self) -> CoreResult<()> {
        if self.config.autoflush && !self.flushing && !self.is_clean() {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Acquires the connection lease for `bind` if the root does not hold it yet.
    ///
    /// A fresh connection begins a transaction and establishes every open
    /// savepoint, so it joins the stack at the current depth.
    pub(crate) fn engage(&mut self, bind: BindId) -> CoreResult<()> {
        let Some(leases) = self.stack.leases() else {
            return Err(CoreError::invalid_request("no transaction is begun"));
        };
        if leases.contains_key(&bind) {
            return Ok(());
        }
        let engine = usize::try_from(bind.0)
            .ok()
            .and_then(|i| self.engines.get(i))
            .ok_or_else(|| CoreError::invalid_request(format!("unknown {bind}")))?;
        let mut conn = engine.connect()?;
        if let Err(e) = conn.begin() {
            tracing::warn!(session = %self.id, %bind, error = %e, "begin failed; invalidating connection");
            conn.invalidate();
            return Err(e.into());
        }

        let open: Vec<(TransactionId, String)> = self
            .stack
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Savepoint { name, .. } => Some((n.id, name.clone())),
                _ => None,
            })
            .collect();
        let mut established = HashMap::new();
        for (txn, name) in open {
            match conn.begin_savepoint(&name) {
                Ok(handle) => {
                    established.insert(txn, handle);
                }
                Err(e) => {
                    if let Err(re) = conn.rollback() {
                        tracing::warn!(session = %self.id, %bind, error = %re, "rollback of partially engaged connection failed");
                    }
                    return Err(e.into());
                }
            }
        }
        for node in self.stack.iter_mut() {
            if let (Some(handle), NodeKind::Savepoint { handles, .. }) =
                (established.remove(&node.id), &mut node.kind)
            {
                handles.insert(bind, handle);
            }
        }

        tracing::debug!(session = %self.id, %bind, connection = %conn.id(), "connection engaged");
        if let Some(leases) = self.stack.leases_mut() {
            leases.insert(bind, conn);
        }
        Ok(())
    }

    /// The leased connection for `bind`, engaging it if needed.
    pub(crate) fn lease(&mut self, bind: BindId) -> CoreResult<&mut dyn Connection> {
        self.engage(bind)?;
        match self.stack.leases_mut().and_then(|l| l.get_mut(&bind)) {
            Some(conn) => Ok(&mut **conn),
            None => Err(CoreError::invalid_request(format!("no connection for {bind}"))),
        }
    }

    pub(crate) fn table_def(&mut self, entity: &str) -> CoreResult<TableDef> {
        if let Some(def) = self.schemas.get(entity) {
            return Ok(def.clone());
        }
        let bind = self.bind_for(entity);
        let def = self.lease(bind)?.table_def(entity)?;
        self.schemas.insert(entity.to_owned(), def.clone());
        Ok(def)
    }

    /// Adopts a loaded row, reusing the identity-mapped record if there is one.
    fn register_loaded(&mut self, key: IdentityKey, row: Row) -> InstanceId {
        if let Some(id) = self.identity.get(&key) {
            if let Some(rec) = self.records.get_mut(&id) {
                if rec.is_expired() {
                    rec.load(row);
                }
            }
            return id;
        }
        let id = self.next_instance_id();
        self.records
            .insert(id, StateRecord::loaded(id, key.clone(), row));
        self.identity.insert(key, id);
        id
    }

    /// Reloads an expired persistent object.
    pub(crate) fn load_expired(&mut self, id: InstanceId) -> CoreResult<()> {
        let rec = self.record(id)?;
        let key = match (rec.status(), rec.key()) {
            (ObjectStatus::Persistent, Some(key)) => key.clone(),
            _ => return Err(CoreError::DetachedInstance(id)),
        };
        self.ensure_sql_allowed()?;
        let bind = self.bind_for(&key.entity);
        let row = self.lease(bind)?.get(&key.entity, &key.pk)?;
        match row {
            Some(row) => {
                self.record_mut(id)?.load(row);
                Ok(())
            }
            None => Err(CoreError::ObjectDeleted { instance: id, key }),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("stack", &self.stack)
            .field("records", &self.records.len())
            .field("identity", &self.identity.len())
            .finish_non_exhaustive()
    }
}
