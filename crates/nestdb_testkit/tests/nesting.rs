//! Nesting behaviour: savepoints, subtransactions and their rollbacks.

use nestdb_core::{
    Config, CoreError, ObjectStatus, RollbackScope, TransactionKind, TransactionState,
};
use nestdb_storage::{TxnOp, Value};
use nestdb_testkit::prelude::*;

#[test]
fn test_heavy_nesting() {
    let engine = engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    session.add(USERS, user("user1"));
    session.begin().unwrap();
    session.begin_nested().unwrap();
    session.add(USERS, user("user2"));
    assert_eq!(session.count(USERS).unwrap(), 2);

    session.rollback().unwrap();
    assert_eq!(session.count(USERS).unwrap(), 1);
    assert!(!session.in_nested_transaction());

    session.add(USERS, user("user3"));
    session.commit().unwrap();
    assert!(!session.in_transaction());
    assert_eq!(committed_names(&engine), vec!["user1", "user3"]);
}

#[test]
fn test_savepoint_rollback_discards_only_nested_work() {
    let engine = engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let outer = session.add(USERS, user("outer"));
    session.begin_nested().unwrap();
    let inner = session.add(USERS, user("inner"));
    session.flush().unwrap();
    assert_eq!(session.status(inner), Some(ObjectStatus::Persistent));

    session.rollback().unwrap();
    assert_eq!(session.status(outer), Some(ObjectStatus::Persistent));
    assert_eq!(session.status(inner), Some(ObjectStatus::Transient));
    assert!(session.state(inner).unwrap().key().is_none());

    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["outer"]);
}

#[test]
fn test_savepoint_rollback_restores_flushed_values() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.set_value(jack, "name", "first").unwrap();
    session.begin_nested().unwrap();
    session.set_value(jack, "name", "second").unwrap();
    session.flush().unwrap();

    session.rollback().unwrap();
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("first"));
    assert!(!session.state(jack).unwrap().is_expired());
    assert!(!session.is_modified(jack));
}

#[test]
fn test_inner_commit_then_outer_root_rollback() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.begin_nested().unwrap();
    session.set_value(jack, "name", "zed").unwrap();
    session.commit().unwrap();
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("zed"));

    session.rollback().unwrap();
    assert!(session.state(jack).unwrap().is_expired());
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack"));
}

#[test]
fn test_inner_commit_then_outer_savepoint_rollback() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.begin_nested().unwrap();
    session.begin_nested().unwrap();
    session.set_value(jack, "name", "zed").unwrap();
    session.commit().unwrap();
    assert_eq!(session.depth(), 2);

    session.rollback().unwrap();
    assert_eq!(session.depth(), 1);
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack"));
    assert!(!session.state(jack).unwrap().is_expired());

    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["chuck", "ed", "fred", "jack"]);
}

#[test]
fn test_rollback_leaves_clean_objects_alone() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    let ed = session.get(USERS, 8).unwrap().unwrap();
    session.set_value(jack, "name", "jack modified").unwrap();

    session.begin_nested().unwrap();
    session.set_value(ed, "name", "ed modified").unwrap();
    session.rollback().unwrap();

    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack modified"));
    assert!(!session.state(jack).unwrap().is_expired());
    assert_eq!(session.value(ed, "name").unwrap(), Value::from("ed"));
}

#[test]
fn test_rollback_restores_unflushed_edits_made_before_savepoint() {
    let engine = seeded_engine();
    let mut session = session_with(&engine, Config::default().flush_on_begin_nested(false));

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    let ed = session.get(USERS, 8).unwrap().unwrap();
    session.set_value(jack, "name", "jack modified").unwrap();

    session.begin_nested().unwrap();
    session.set_value(ed, "name", "ed modified").unwrap();
    session.flush().unwrap();
    assert!(!session.is_modified(jack));

    session.rollback().unwrap();
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack modified"));
    assert!(session.is_modified(jack));
    assert_eq!(session.value(ed, "name").unwrap(), Value::from("ed"));
}

#[test]
fn test_pending_objects_added_before_savepoint_survive_its_rollback() {
    let engine = engine();
    let mut session = session_with(&engine, Config::default().flush_on_begin_nested(false));

    session.begin().unwrap();
    let before = session.add(USERS, user("before"));
    session.begin_nested().unwrap();
    let inside = session.add(USERS, user("inside"));
    session.rollback().unwrap();

    assert_eq!(session.status(before), Some(ObjectStatus::Pending));
    assert_eq!(session.status(inside), Some(ObjectStatus::Transient));
    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["before"]);
}

#[test]
fn test_deletes_inside_savepoint_are_undone() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.begin_nested().unwrap();
    session.delete(jack).unwrap();
    session.flush().unwrap();
    assert_eq!(session.status(jack), Some(ObjectStatus::Deleted));
    assert_eq!(session.get(USERS, 7).unwrap(), None);

    session.rollback().unwrap();
    assert_eq!(session.status(jack), Some(ObjectStatus::Persistent));
    assert!(!session.state(jack).unwrap().is_deleted());
    assert_eq!(session.get(USERS, 7).unwrap(), Some(jack));
}

#[test]
fn test_subtransaction_commit_issues_no_physical_commit() {
    let engine = engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    session.begin().unwrap();
    session.add(USERS, user("ed"));
    session.commit().unwrap();
    assert!(session.in_transaction());
    assert_eq!(count_ops(&engine, &TxnOp::Commit), 0);
    assert_eq!(engine.committed_count(USERS), 0);

    session.commit().unwrap();
    assert_eq!(count_ops(&engine, &TxnOp::Commit), 1);
    assert_eq!(engine.committed_count(USERS), 1);
}

#[test]
fn test_subtransaction_rollback_deactivates_enclosing_root() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    let ed = session.add(USERS, user("ed"));
    session.begin().unwrap();
    session.rollback().unwrap();

    assert_eq!(session.current_transaction(), Some(root));
    assert_eq!(session.transaction_state(root), Some(TransactionState::Deactive));
    assert!(!session.is_active());
    assert_eq!(session.status(ed), Some(ObjectStatus::Transient));
    assert!(matches!(
        session.count(USERS),
        Err(CoreError::InactiveTransaction { .. })
    ));
    assert!(matches!(
        session.commit(),
        Err(CoreError::InactiveTransaction { .. })
    ));

    session.rollback().unwrap();
    assert!(!session.in_transaction());
    assert_eq!(session.count(USERS).unwrap(), 0);
}

#[test]
fn test_subtransaction_rollback_deactivates_chain() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    let middle = session.begin().unwrap();
    let inner = session.begin().unwrap();
    session.rollback().unwrap();

    assert_eq!(session.transaction_state(inner), Some(TransactionState::Closed));
    assert_eq!(session.transaction_state(middle), Some(TransactionState::Deactive));
    assert_eq!(session.transaction_state(root), Some(TransactionState::Deactive));
    assert!(session.begin().is_err());

    session.rollback().unwrap();
    assert_eq!(session.current_transaction(), Some(root));
    session.rollback().unwrap();
    assert!(!session.in_transaction());
    assert_eq!(count_ops(&engine, &TxnOp::Rollback), 0);
}

#[test]
fn test_subtransaction_inside_savepoint_only_affects_savepoint() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    session.add(USERS, user("kept"));
    let sp = session.begin_nested().unwrap();
    session.begin().unwrap();
    session.add(USERS, user("lost"));
    session.flush().unwrap();
    session.rollback().unwrap();

    assert_eq!(session.transaction_state(sp), Some(TransactionState::Deactive));
    assert_eq!(session.transaction_state(root), Some(TransactionState::Active));
    session.rollback().unwrap();
    assert_eq!(session.current_transaction(), Some(root));

    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["kept"]);
}

#[test]
fn test_savepoint_rollback_closes_enclosing_subtransactions() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    let sub = session.begin().unwrap();
    session.begin_nested().unwrap();
    session.rollback().unwrap();

    assert_eq!(session.transaction_state(sub), Some(TransactionState::Closed));
    assert_eq!(session.current_transaction(), Some(root));
    assert!(session.is_active());
}

#[test]
fn test_rollback_of_outer_transaction_closes_descendants() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    let sp = session.begin_nested().unwrap();
    session.add(USERS, user("ed"));
    session.flush().unwrap();

    session.rollback_transaction(root).unwrap();
    assert!(!session.in_transaction());
    assert_eq!(session.transaction_state(sp), Some(TransactionState::Closed));
    assert_eq!(engine.committed_count(USERS), 0);
}

#[test]
fn test_outermost_rollback_scope() {
    let engine = engine();
    let mut session = session_with(
        &engine,
        Config::default().rollback_scope(RollbackScope::Outermost),
    );

    session.begin().unwrap();
    session.begin_nested().unwrap();
    session.begin_nested().unwrap();
    session.rollback().unwrap();
    assert!(!session.in_transaction());
}

#[test]
fn test_transaction_info_reports_nesting() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    let sp = session.begin_nested().unwrap();
    let ed = session.add(USERS, user("ed"));
    session.flush().unwrap();

    let info = session.transaction_info(sp).unwrap();
    assert_eq!(info.kind, TransactionKind::Savepoint);
    assert_eq!(info.parent, Some(root));
    assert_eq!(info.savepoint.as_deref(), Some("sp_1"));
    assert!(info.nested());
    assert!(info.is_active());
    assert_eq!(info.new, vec![ed]);

    assert_eq!(session.get_transaction(), Some(root));
    assert_eq!(session.get_nested_transaction(), Some(sp));

    session.commit().unwrap();
    let info = session.transaction_info(root).unwrap();
    assert!(!info.nested());
    assert_eq!(info.new, vec![ed]);
    assert_eq!(session.transaction_state(sp), Some(TransactionState::Closed));
}
