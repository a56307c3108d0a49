//! Test fixtures and session helpers.
//!
//! Provides the schema shared by the test suites, engines seeded from JSON
//! fixtures and shortcuts for inspecting what was committed.

use nestdb_core::{Config, Session};
use nestdb_storage::{row, EngineOptions, MemoryEngine, Row, TableDef, TxnOp, Value};
use serde::{Deserialize, Serialize};
use std::sync::Once;

/// Users table name.
pub const USERS: &str = "users";

/// Addresses table name.
pub const ADDRESSES: &str = "addresses";

/// Seed rows for the users table.
pub const SEED_USERS: &str = r#"[
    {"id": 7, "name": "jack"},
    {"id": 8, "name": "ed"},
    {"id": 9, "name": "fred"},
    {"id": 10, "name": "chuck"}
]"#;

/// A user row as stored in fixtures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFixture {
    /// Primary key; assigned by the engine when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// User name.
    pub name: String,
}

impl UserFixture {
    /// Converts the fixture to a storage row.
    pub fn to_row(&self) -> Row {
        let mut values = row([("name", self.name.as_str())]);
        if let Some(id) = self.id {
            values.insert("id".into(), Value::Int(id));
        }
        values
    }
}

/// Parses the seed users.
pub fn seed_users() -> Vec<UserFixture> {
    serde_json::from_str(SEED_USERS).expect("Seed fixture is valid JSON")
}

/// Parses a JSON array of objects into rows.
pub fn rows_from_json(json: &str) -> Vec<Row> {
    serde_json::from_str(json).expect("Fixture rows are valid JSON")
}

/// Users table: autoincrement `id`, required `name`.
pub fn users_table() -> TableDef {
    TableDef::new(USERS, "id").autoincrement().required("name")
}

/// Addresses table: autoincrement `id`, required `email`.
pub fn addresses_table() -> TableDef {
    TableDef::new(ADDRESSES, "id")
        .autoincrement()
        .required("email")
}

/// An empty engine with the fixture tables.
pub fn engine() -> MemoryEngine {
    engine_with(EngineOptions::default())
}

/// An empty engine with the given capabilities and the fixture tables.
pub fn engine_with(options: EngineOptions) -> MemoryEngine {
    let engine = MemoryEngine::with_options(options);
    engine.create_table(users_table());
    engine.create_table(addresses_table());
    engine
}

/// An engine with the seed users committed.
pub fn seeded_engine() -> MemoryEngine {
    let engine = engine();
    engine
        .load(USERS, seed_users().iter().map(UserFixture::to_row))
        .expect("Failed to load seed users");
    engine
}

/// A session over `engine` with default configuration.
pub fn session(engine: &MemoryEngine) -> Session {
    init_tracing();
    Session::new(engine.clone())
}

/// A session over `engine` with `config`.
pub fn session_with(engine: &MemoryEngine, config: Config) -> Session {
    init_tracing();
    Session::builder(engine.clone()).config(config).build()
}

/// A new user row.
pub fn user(name: &str) -> Row {
    row([("name", name)])
}

/// A new user row with an explicit primary key.
pub fn user_with_id(id: i64, name: &str) -> Row {
    row([("id", Value::Int(id)), ("name", Value::from(name))])
}

/// A new address row.
pub fn address(email: &str) -> Row {
    row([("email", email)])
}

/// Names of the committed users, sorted.
pub fn committed_names(engine: &MemoryEngine) -> Vec<String> {
    let mut names: Vec<String> = engine
        .committed_rows(USERS)
        .iter()
        .filter_map(|r| r.get("name").and_then(Value::as_text).map(str::to_owned))
        .collect();
    names.sort();
    names
}

/// Transaction-control operations the engine saw, in order.
pub fn txn_ops(engine: &MemoryEngine) -> Vec<TxnOp> {
    engine.journal().into_iter().map(|e| e.op).collect()
}

/// Number of journal entries equal to `op`.
pub fn count_ops(engine: &MemoryEngine, op: &TxnOp) -> usize {
    engine.journal().iter().filter(|e| &e.op == op).count()
}

/// Installs a `tracing` subscriber once per process.
///
/// The filter comes from `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
