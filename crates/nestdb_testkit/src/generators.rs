//! Property-based test generators using proptest.
//!
//! Provides strategies for generating values, rows and scripted session
//! scenarios.

use crate::scenario::Step;
use nestdb_storage::{Row, Value};
use proptest::prelude::*;

/// Strategy for generating user names.
pub fn user_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for generating column values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[a-z]{0,12}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

/// Strategy for generating rows with a few text-named columns.
pub fn row_strategy() -> impl Strategy<Value = Row> {
    prop::collection::btree_map("[a-z]{1,6}", value_strategy(), 0..5)
}

/// Strategy for generating a single scenario step.
pub fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => user_name_strategy().prop_map(Step::Add),
        3 => (0..4usize, user_name_strategy()).prop_map(|(slot, name)| Step::Rename(slot, name)),
        1 => (0..4usize).prop_map(Step::Delete),
        2 => Just(Step::BeginNested),
        2 => Just(Step::Commit),
        2 => Just(Step::Rollback),
    ]
}

/// Strategy for generating scenario scripts.
pub fn scenario_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(step_strategy(), 1..40)
}

/// Strategy for generating a batch of renames applied inside one savepoint.
pub fn rename_batch_strategy() -> impl Strategy<Value = Vec<(usize, String)>> {
    prop::collection::vec((0..4usize, user_name_strategy()), 1..6)
}
