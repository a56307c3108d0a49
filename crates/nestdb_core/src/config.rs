//! Session configuration.

/// Which transaction `Session::rollback()` discharges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackScope {
    /// The innermost (current) transaction.
    #[default]
    Innermost,
    /// The whole stack, back to and including the root.
    Outermost,
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether SQL-issuing operations begin a root transaction implicitly.
    pub autobegin: bool,

    /// Whether reads flush pending changes first.
    pub autoflush: bool,

    /// Whether a root commit expires every identity-mapped object.
    pub expire_on_commit: bool,

    /// Whether a root commit prepares every connection before committing.
    pub two_phase: bool,

    /// Maximum number of flushes a single commit may run.
    pub max_flush_iterations: usize,

    /// What `Session::rollback()` rolls back.
    pub rollback_scope: RollbackScope,

    /// Whether `begin()` inside an open transaction opens a subtransaction.
    pub allow_subtransactions: bool,

    /// Whether `begin_nested()` flushes before establishing the savepoint.
    pub flush_on_begin_nested: bool,

    /// Prefix of generated savepoint names.
    pub savepoint_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            autobegin: true,
            autoflush: true,
            expire_on_commit: true,
            two_phase: false,
            max_flush_iterations: 100,
            rollback_scope: RollbackScope::Innermost,
            allow_subtransactions: true,
            flush_on_begin_nested: true,
            savepoint_prefix: "sp".to_owned(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets implicit begin.
    #[must_use]
    pub const fn autobegin(mut self, value: bool) -> Self {
        self.autobegin = value;
        self
    }

    /// Sets autoflush before reads.
    #[must_use]
    pub const fn autoflush(mut self, value: bool) -> Self {
        self.autoflush = value;
        self
    }

    /// Sets expiry of all objects on root commit.
    #[must_use]
    pub const fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    /// Sets two-phase commit.
    #[must_use]
    pub const fn two_phase(mut self, value: bool) -> Self {
        self.two_phase = value;
        self
    }

    /// Sets the flush-loop ceiling.
    #[must_use]
    pub const fn max_flush_iterations(mut self, value: usize) -> Self {
        self.max_flush_iterations = value;
        self
    }

    /// Sets what `rollback()` discharges.
    #[must_use]
    pub const fn rollback_scope(mut self, value: RollbackScope) -> Self {
        self.rollback_scope = value;
        self
    }

    /// Sets whether reentrant `begin()` is allowed.
    #[must_use]
    pub const fn allow_subtransactions(mut self, value: bool) -> Self {
        self.allow_subtransactions = value;
        self
    }

    /// Sets whether `begin_nested()` flushes first.
    #[must_use]
    pub const fn flush_on_begin_nested(mut self, value: bool) -> Self {
        self.flush_on_begin_nested = value;
        self
    }

    /// Sets the savepoint name prefix.
    #[must_use]
    pub fn savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.savepoint_prefix = prefix.into();
        self
    }
}
