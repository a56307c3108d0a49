//! Session surface: scoped blocks, configuration flags, object lifecycle,
//! listeners and sharing.

use nestdb_core::{
    Config, CoreError, EventKind, IdentityKey, ObjectStatus, Session, SharedSession,
    TransactionKind,
};
use nestdb_storage::{TxnOp, Value};
use nestdb_testkit::prelude::*;
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn test_with_transaction_commits_on_ok() {
    let engine = engine();
    let mut session = session(&engine);

    let id = session
        .with_transaction(|s| Ok(s.add(USERS, user("ed"))))
        .unwrap();
    assert!(!session.in_transaction());
    assert_eq!(committed_names(&engine), vec!["ed"]);
    assert_eq!(session.status(id), Some(ObjectStatus::Persistent));
}

#[test]
fn test_with_transaction_rolls_back_on_err() {
    let engine = engine();
    let mut session = session(&engine);

    let result: Result<(), _> = session.with_transaction(|s| {
        s.add(USERS, user("ed"));
        s.flush()?;
        Err(CoreError::invalid_request("changed my mind"))
    });
    assert!(matches!(result, Err(CoreError::InvalidRequest { .. })));
    assert!(!session.in_transaction());
    assert_eq!(engine.committed_count(USERS), 0);
    assert_eq!(count_ops(&engine, &TxnOp::Rollback), 1);
}

#[test]
fn test_with_nested_scopes_work() {
    let engine = engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    session
        .with_nested(|s| {
            s.add(USERS, user("kept"));
            Ok(())
        })
        .unwrap();
    let lost: Result<(), _> = session.with_nested(|s| {
        s.add(USERS, user("lost"));
        Err(CoreError::invalid_request("no"))
    });
    assert!(lost.is_err());
    assert_eq!(session.depth(), 1);

    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["kept"]);
}

#[test]
fn test_autobegin_disabled() {
    let engine = engine();
    let mut session = session_with(&engine, Config::default().autobegin(false));

    assert!(matches!(
        session.count(USERS),
        Err(CoreError::InvalidRequest { .. })
    ));
    assert!(!session.in_transaction());

    session.begin().unwrap();
    assert_eq!(session.count(USERS).unwrap(), 0);
}

#[test]
fn test_subtransactions_disabled() {
    let engine = engine();
    let mut session = session_with(&engine, Config::default().allow_subtransactions(false));

    session.begin().unwrap();
    assert!(matches!(
        session.begin(),
        Err(CoreError::InvalidRequest { .. })
    ));
    assert_eq!(session.depth(), 1);
}

#[test]
fn test_autoflush_disabled() {
    let engine = engine();
    let mut session = session_with(&engine, Config::default().autoflush(false));

    session.add(USERS, user("ed"));
    assert_eq!(session.count(USERS).unwrap(), 0);
    session.flush().unwrap();
    assert_eq!(session.count(USERS).unwrap(), 1);
}

#[test]
fn test_expire_on_commit() {
    let engine = seeded_engine();

    let mut session = session(&engine);
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.commit().unwrap();
    assert!(session.state(jack).unwrap().is_expired());

    let mut session = session_with(&engine, Config::default().expire_on_commit(false));
    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.commit().unwrap();
    assert!(!session.state(jack).unwrap().is_expired());
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack"));
}

#[test]
fn test_pending_collections() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let jack = session.get(USERS, 7).unwrap().unwrap();
    let fred = session.get(USERS, 9).unwrap().unwrap();
    let ed = session.add(USERS, user("ed"));
    session.set_value(jack, "name", "jackie").unwrap();
    session.delete(fred).unwrap();

    assert!(session.has_pending_changes());
    assert_eq!(session.new_instances(), vec![ed]);
    assert_eq!(session.dirty_instances(), vec![jack]);
    assert_eq!(session.deleted_instances(), vec![fred]);
    assert!(session.contains(ed));

    session.flush().unwrap();
    assert!(!session.has_pending_changes());
    assert!(session.new_instances().is_empty());
    assert!(session.dirty_instances().is_empty());
    assert!(session.deleted_instances().is_empty());
    assert!(!session.contains(fred));
}

#[test]
fn test_close_rolls_back_and_detaches() {
    let engine = engine();
    let mut session = session(&engine);

    let ed = session.add(USERS, user("ed"));
    session.flush().unwrap();
    let fred = session.add(USERS, user("fred"));
    session.close();

    assert!(!session.in_transaction());
    assert_eq!(session.status(ed), Some(ObjectStatus::Detached));
    assert_eq!(session.status(fred), Some(ObjectStatus::Transient));
    assert!(session.identity_map().is_empty());
    assert_eq!(txn_ops(&engine), vec![TxnOp::Begin, TxnOp::Rollback]);
    assert_eq!(engine.committed_count(USERS), 0);
}

#[test]
fn test_invalidate_discards_connection() {
    let engine = engine();
    let mut session = session(&engine);

    session.add(USERS, user("ed"));
    session.flush().unwrap();
    session.invalidate();

    assert!(!session.in_transaction());
    assert_eq!(txn_ops(&engine), vec![TxnOp::Begin, TxnOp::Invalidate]);
    assert_eq!(session.count(USERS).unwrap(), 0);
}

#[test]
fn test_detached_instance_can_be_reattached() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.close();
    assert!(matches!(
        session.refresh(jack),
        Err(CoreError::DetachedInstance(_))
    ));

    session.add_instance(jack).unwrap();
    assert_eq!(
        session.instance_for(&IdentityKey::new(USERS, 7)),
        Some(jack)
    );
    session.set_value(jack, "name", "jackie").unwrap();
    session.commit().unwrap();
    assert!(committed_names(&engine).contains(&"jackie".to_string()));
}

#[test]
fn test_transient_instance_can_be_added_again() {
    let engine = engine();
    let mut session = session(&engine);

    session.begin().unwrap();
    let ed = session.add(USERS, user("ed"));
    session.rollback().unwrap();
    assert_eq!(session.status(ed), Some(ObjectStatus::Transient));

    session.add_instance(ed).unwrap();
    assert_eq!(session.status(ed), Some(ObjectStatus::Pending));
    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["ed"]);
}

#[test]
fn test_delete_requires_persistent_instance() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let ed = session.add(USERS, user("ed"));
    assert!(matches!(
        session.delete(ed),
        Err(CoreError::InvalidRequest { .. })
    ));

    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.delete(jack).unwrap();
    session.commit().unwrap();
    assert_eq!(session.status(jack), Some(ObjectStatus::Detached));
    assert_eq!(engine.committed_count(USERS), 4);
    assert!(!committed_names(&engine).contains(&"jack".to_string()));
}

#[test]
fn test_identity_map_returns_one_instance_per_key() {
    let engine = seeded_engine();
    let mut session = session(&engine);

    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.set_value(jack, "name", "unsaved").unwrap();
    let all = session.query(USERS).unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.contains(&jack));
    assert_eq!(session.get(USERS, 7).unwrap(), Some(jack));
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("unsaved"));
    assert_eq!(session.identity_map().len(), 4);
    assert_eq!(session.get(USERS, 99).unwrap(), None);
}

#[test]
fn test_refresh_and_expire_reload_values() {
    let engine = seeded_engine();
    let mut session = session_with(&engine, Config::default().autoflush(false));

    let jack = session.get(USERS, 7).unwrap().unwrap();
    session.set_value(jack, "name", "scratch").unwrap();
    session.refresh(jack).unwrap();
    assert_eq!(session.value(jack, "name").unwrap(), Value::from("jack"));
    assert!(!session.is_modified(jack));

    session.expire(jack).unwrap();
    assert!(session.state(jack).unwrap().is_expired());
    assert_eq!(session.values(jack).unwrap().get("name"), Some(&Value::from("jack")));
}

#[test]
fn test_expired_object_deleted_elsewhere() {
    let engine = seeded_engine();
    let mut reader = session(&engine);
    let mut writer = session(&engine);

    let jack = reader.get(USERS, 7).unwrap().unwrap();
    reader.commit().unwrap();

    let doomed = writer.get(USERS, 7).unwrap().unwrap();
    writer.delete(doomed).unwrap();
    writer.commit().unwrap();

    assert!(matches!(
        reader.value(jack, "name"),
        Err(CoreError::ObjectDeleted { .. })
    ));
    assert_eq!(reader.get(USERS, 7).unwrap(), None);
}

#[test]
fn test_sessions_are_isolated() {
    let engine = seeded_engine();
    let mut first = session(&engine);
    let mut second = session(&engine);

    first.begin().unwrap();
    assert_eq!(first.count(USERS).unwrap(), 4);

    second.add(USERS, user("wendy"));
    second.commit().unwrap();
    assert_eq!(first.count(USERS).unwrap(), 4);

    first.commit().unwrap();
    assert_eq!(first.count(USERS).unwrap(), 5);
}

#[test]
fn test_no_sql_after_commit_or_rollback() {
    let engine = engine();
    let mut session = session(&engine);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    session.listen(EventKind::AfterCommit, move |s, _| {
        let refused = matches!(s.count(USERS), Err(CoreError::InvalidRequest { .. }));
        sink.lock().unwrap().push(("after_commit", refused));
        Ok(())
    });
    let sink = Arc::clone(&seen);
    session.listen(EventKind::AfterRollback, move |s, _| {
        let refused = matches!(s.count(USERS), Err(CoreError::InactiveTransaction { .. }));
        sink.lock().unwrap().push(("after_rollback", refused));
        Ok(())
    });

    session.add(USERS, user("ed"));
    session.commit().unwrap();
    session.add(USERS, user("fred"));
    session.flush().unwrap();
    session.rollback().unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("after_commit", true), ("after_rollback", true)]
    );
    assert_eq!(committed_names(&engine), vec!["ed"]);
}

#[test]
fn test_listener_order_and_removal() {
    let engine = engine();
    let mut session = session(&engine);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&calls);
    let first = session.listen(EventKind::AfterBegin, move |_, event| {
        sink.lock().unwrap().push((1, event.transaction_kind));
        Ok(())
    });
    let sink = Arc::clone(&calls);
    session.listen(EventKind::AfterBegin, move |_, event| {
        sink.lock().unwrap().push((2, event.transaction_kind));
        Ok(())
    });

    session.begin().unwrap();
    session.remove_listener(first);
    session.begin_nested().unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            (1, Some(TransactionKind::Root)),
            (2, Some(TransactionKind::Root)),
            (2, Some(TransactionKind::Savepoint)),
        ]
    );
}

#[test]
fn test_listener_can_add_objects_before_flush() {
    let engine = engine();
    let mut session = session(&engine);
    session.listen(EventKind::BeforeFlush, |s, _| {
        if s.new_instances().len() == 1 {
            s.add(USERS, user("audit"));
        }
        Ok(())
    });

    session.add(USERS, user("ed"));
    session.commit().unwrap();
    assert_eq!(committed_names(&engine), vec!["audit", "ed"]);
}

#[test]
fn test_events_raised_inside_a_listener_reach_other_listeners() {
    let engine = engine();
    let mut session = session(&engine);
    let flushes = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&flushes);
    session.listen(EventKind::BeforeFlush, move |_, _| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });
    session.listen(EventKind::BeforeCommit, |s, _| {
        s.add(USERS, user("from_listener"));
        s.flush()
    });

    session.begin().unwrap();
    session.commit().unwrap();
    assert_eq!(*flushes.lock().unwrap(), 1);
    assert_eq!(committed_names(&engine), vec!["from_listener"]);
}

#[test]
fn test_listener_is_not_reentered_by_its_own_events() {
    let engine = engine();
    let mut session = session(&engine);
    let begins = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&begins);
    session.listen(EventKind::AfterBegin, move |s, event| {
        *counter.lock().unwrap() += 1;
        if event.transaction_kind == Some(TransactionKind::Root) {
            s.begin_nested()?;
        }
        Ok(())
    });

    session.begin().unwrap();
    assert!(session.in_nested_transaction());
    assert_eq!(*begins.lock().unwrap(), 1);
}

#[test]
fn test_savepoint_rollback_reports_wrapping_subtransactions() {
    let engine = engine();
    let mut session = session(&engine);
    let rolled_back = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&rolled_back);
    session.listen(EventKind::AfterSoftRollback, move |_, event| {
        sink.lock().unwrap().push(event.transaction_kind);
        Ok(())
    });

    let root = session.begin().unwrap();
    session.begin().unwrap();
    session.begin_nested().unwrap();
    session.rollback().unwrap();

    assert_eq!(session.current_transaction(), Some(root));
    assert!(session.is_active());
    assert_eq!(
        *rolled_back.lock().unwrap(),
        vec![
            Some(TransactionKind::Subtransaction),
            Some(TransactionKind::Savepoint),
        ]
    );
}

#[test]
fn test_shared_session_across_threads() {
    let engine = engine();
    let shared = SharedSession::new(session(&engine));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let shared = shared.clone();
            thread::spawn(move || {
                shared
                    .transaction(|s| {
                        s.add(USERS, user(&format!("user{i}")));
                        Ok(())
                    })
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.committed_count(USERS), 4);
    assert!(!shared.with(|s| s.in_transaction()));
}

#[test]
fn test_entities_route_to_bound_engines() {
    let users = engine();
    let addresses = engine();
    init_tracing();
    let mut session = Session::builder(users.clone())
        .bind_entity(ADDRESSES, addresses.clone())
        .build();

    session.add(USERS, user("ed"));
    session.add(ADDRESSES, address("ed@example.com"));
    session.flush().unwrap();
    assert_eq!(
        session.connection_for(ADDRESSES).unwrap().count(ADDRESSES).unwrap(),
        1
    );
    assert_eq!(session.connection().unwrap().count(ADDRESSES).unwrap(), 0);
    session.commit().unwrap();

    assert_eq!(users.committed_count(USERS), 1);
    assert_eq!(users.committed_count(ADDRESSES), 0);
    assert_eq!(addresses.committed_count(ADDRESSES), 1);
}
