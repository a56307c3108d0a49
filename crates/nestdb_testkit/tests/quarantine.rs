//! Failure handling: deactivation, pending rollback and closed transactions.

use nestdb_core::{Config, CoreError, EventKind, ObjectStatus, TransactionState};
use nestdb_storage::{FaultKind, FaultPoint, StorageError, TxnOp, Value};
use nestdb_testkit::prelude::*;

#[test]
fn test_primary_key_violation_requires_rollback() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let dup = session.add(USERS, user_with_id(7, "duplicate"));
    let err = session.flush().unwrap_err();
    assert!(matches!(
        err,
        CoreError::Persistence {
            source: Some(StorageError::UniqueViolation { .. }),
            ..
        }
    ));
    assert!(!session.is_active());

    let err = session.count(USERS).unwrap_err();
    assert!(matches!(err, CoreError::PendingRollback { .. }));
    assert!(err.to_string().contains("Original error"));
    assert!(err.is_recoverable_by_rollback());
    assert!(matches!(
        session.commit(),
        Err(CoreError::PendingRollback { .. })
    ));
    assert!(matches!(
        session.begin_nested(),
        Err(CoreError::PendingRollback { .. })
    ));

    session.rollback().unwrap();
    assert!(session.is_active());
    assert_eq!(session.status(dup), Some(ObjectStatus::Transient));
    assert_eq!(session.count(USERS).unwrap(), 4);

    session.add(USERS, user("wendy"));
    session.commit().unwrap();
    assert_eq!(engine.committed_count(USERS), 5);
}

#[test]
fn test_duplicate_key_on_commit_reverts_edits() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.set_value(jack, "name", "jackie").unwrap();
    let dup = session.add(USERS, user_with_id(8, "duplicate"));

    assert!(matches!(
        session.commit(),
        Err(CoreError::Persistence { .. })
    ));
    assert!(matches!(
        session.commit(),
        Err(CoreError::PendingRollback { .. })
    ));
    session.rollback().unwrap();

    assert_eq!(session.status(dup), Some(ObjectStatus::Transient));
    assert_eq!(session.status(jack), Some(ObjectStatus::Persistent));
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack"));
    assert_eq!(engine.committed_count(USERS), 4);
    assert!(!committed_names(&engine).contains(&"jackie".to_string()));
}

#[test]
fn test_flush_failure_inside_savepoint_keeps_outer_work() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    session.add(USERS, user("wendy"));
    let sp = session.begin_nested().unwrap();
    session.add(USERS, user_with_id(8, "duplicate"));
    assert!(session.flush().is_err());

    assert_eq!(session.transaction_state(sp), Some(TransactionState::Deactive));
    assert_eq!(session.transaction_state(root), Some(TransactionState::Active));
    assert!(matches!(
        session.get(USERS, 7),
        Err(CoreError::PendingRollback { .. })
    ));

    session.rollback().unwrap();
    assert_eq!(session.current_transaction(), Some(root));
    assert_eq!(session.count(USERS).unwrap(), 5);
    session.commit().unwrap();
    assert!(committed_names(&engine).contains(&"wendy".to_string()));
    assert!(!committed_names(&engine).contains(&"duplicate".to_string()));
}

#[test]
fn test_failure_in_subtransaction_reaches_root() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    session.begin().unwrap();
    session.add(USERS, user_with_id(7, "duplicate"));
    assert!(session.commit().is_err());

    session.rollback().unwrap();
    assert_eq!(session.current_transaction(), Some(root));
    assert!(matches!(
        session.count(USERS),
        Err(CoreError::PendingRollback { .. })
    ));
    session.rollback().unwrap();
    assert_eq!(session.count(USERS).unwrap(), 4);
}

#[test]
fn test_closed_transactions_reject_commit_and_rollback() {
    let engine = engine();
    let mut session = session(&engine);

    let root = session.begin().unwrap();
    session.commit().unwrap();
    assert_eq!(session.transaction_state(root), Some(TransactionState::Closed));
    assert!(matches!(
        session.commit_transaction(root),
        Err(CoreError::ClosedTransaction { txn }) if txn == root
    ));
    assert!(matches!(
        session.rollback_transaction(root),
        Err(CoreError::ClosedTransaction { .. })
    ));

    session.begin().unwrap();
    let sp = session.begin_nested().unwrap();
    session.rollback().unwrap();
    assert!(matches!(
        session.rollback_transaction(sp),
        Err(CoreError::ClosedTransaction { .. })
    ));
    assert!(matches!(
        session.commit_transaction(sp),
        Err(CoreError::ClosedTransaction { .. })
    ));
}

#[test]
fn test_flush_loop_guard() {
    let engine = engine();
    let mut session = session_with(&engine, Config::default().max_flush_iterations(5));
    session.listen(EventKind::AfterFlushPostexec, |s, _| {
        s.add(USERS, user("again"));
        Ok(())
    });

    session.add(USERS, user("first"));
    let err = session.commit().unwrap_err();
    assert!(matches!(err, CoreError::FlushLoop { limit: 5 }));
    assert!(!session.is_active());
    assert!(matches!(
        session.count(USERS),
        Err(CoreError::PendingRollback { .. })
    ));

    session.rollback().unwrap();
    assert_eq!(engine.committed_count(USERS), 0);
}

#[test]
fn test_flush_listener_error_deactivates() {
    let engine = engine();
    let mut session = session(&engine);
    let listener = session.listen(EventKind::AfterFlush, |_, _| {
        Err(CoreError::invalid_request("listener refused"))
    });

    let ed = session.add(USERS, user("ed"));
    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::Persistence { .. }));
    assert!(err.to_string().contains("listener refused"));
    assert_eq!(session.status(ed), Some(ObjectStatus::Pending));
    assert!(matches!(
        session.count(USERS),
        Err(CoreError::PendingRollback { .. })
    ));

    session.remove_listener(listener);
    session.rollback().unwrap();
    assert_eq!(session.count(USERS).unwrap(), 0);
}

#[test]
fn test_before_flush_listener_error_deactivates() {
    let engine = engine();
    let mut session = session(&engine);
    let listener = session.listen(EventKind::BeforeFlush, |_, _| {
        Err(CoreError::invalid_request("boom"))
    });

    session.add(USERS, user("ed"));
    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::Persistence { .. }));
    assert!(err.to_string().contains("boom"));
    assert!(!session.is_active());
    assert!(matches!(
        session.commit(),
        Err(CoreError::PendingRollback { .. })
    ));

    session.remove_listener(listener);
    session.rollback().unwrap();
    assert_eq!(session.count(USERS).unwrap(), 0);
    assert_eq!(engine.committed_count(USERS), 0);
}

#[test]
fn test_before_commit_listener_error_deactivates() {
    let engine = engine();
    let mut session = session(&engine);
    session.listen(EventKind::BeforeCommit, |_, _| {
        Err(CoreError::invalid_request("not today"))
    });

    session.begin().unwrap();
    session.add(USERS, user("ed"));
    assert!(matches!(
        session.commit(),
        Err(CoreError::InvalidRequest { .. })
    ));
    assert!(matches!(
        session.flush(),
        Err(CoreError::PendingRollback { .. })
    ));
    session.rollback().unwrap();
    assert_eq!(engine.committed_count(USERS), 0);
}

#[test]
fn test_physical_commit_failure() {
    let engine = engine();
    let mut session = session(&engine);

    session.add(USERS, user("ed"));
    engine
        .faults()
        .fail_once(FaultPoint::Commit, FaultKind::Backend("disk full".into()));
    let err = session.commit().unwrap_err();
    assert!(matches!(err, CoreError::Persistence { .. }));
    assert!(!session.is_active());

    session.rollback().unwrap();
    assert_eq!(engine.committed_count(USERS), 0);
    assert_eq!(count_ops(&engine, &TxnOp::Rollback), 1);
}

#[test]
fn test_first_error_wins_when_rollback_also_fails() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.add(USERS, user_with_id(7, "duplicate"));
    assert!(session.flush().is_err());
    engine
        .faults()
        .fail_once(FaultPoint::Rollback, FaultKind::Backend("socket closed".into()));

    session.rollback().unwrap();
    assert!(!session.in_transaction());
    assert_eq!(count_ops(&engine, &TxnOp::Invalidate), 1);
    assert_eq!(session.count(USERS).unwrap(), 4);
}

#[test]
fn test_rollback_failure_without_prior_error_is_reported() {
    let engine = engine();
    let mut session = session(&engine);

    session.add(USERS, user("ed"));
    session.flush().unwrap();
    engine
        .faults()
        .fail_once(FaultPoint::Rollback, FaultKind::Backend("socket closed".into()));

    let err = session.rollback().unwrap_err();
    assert!(matches!(
        err,
        CoreError::Storage(StorageError::Injected { .. })
    ));
    assert!(!session.in_transaction());
}

#[test]
fn test_non_active_state_changes_are_discarded() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.begin().unwrap();
    session.rollback().unwrap();

    let late = session.add(USERS, user("late"));
    session.rollback().unwrap();
    assert_eq!(session.status(late), Some(ObjectStatus::Transient));
    assert!(session.state(jack).unwrap().is_expired());
}
