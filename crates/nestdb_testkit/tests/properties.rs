//! Property tests over random nesting scripts.

use nestdb_core::{Config, CoreError, TransactionState};
use nestdb_storage::Value;
use nestdb_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_commit_matches_model(steps in scenario_strategy()) {
        let outcome = run_scenario(&steps);
        prop_assert_eq!(outcome.committed, outcome.expected);
    }

    #[test]
    fn prop_savepoint_rollback_restores_values(
        renames in rename_batch_strategy(),
        flush_on_begin in any::<bool>(),
        flush_inside in any::<bool>(),
    ) {
        let engine = seeded_engine();
        let mut session = session_with(
            &engine,
            Config::default().flush_on_begin_nested(flush_on_begin),
        );
        session.begin().unwrap();
        let ids = session.query(USERS).unwrap();
        session.set_value(ids[0], "name", "before").unwrap();
        let before: Vec<Value> = ids
            .iter()
            .map(|id| session.value(*id, "name").unwrap())
            .collect();

        session.begin_nested().unwrap();
        for (slot, name) in &renames {
            session.set_value(ids[slot % ids.len()], "name", name.as_str()).unwrap();
        }
        if flush_inside {
            session.flush().unwrap();
        }
        session.rollback().unwrap();

        for (id, expected) in ids.iter().zip(&before) {
            prop_assert_eq!(&session.value(*id, "name").unwrap(), expected);
        }
        session.commit().unwrap();
        prop_assert!(committed_names(&engine).contains(&"before".to_string()));
    }

    #[test]
    fn prop_committed_transactions_are_closed(depth in 1usize..5) {
        let engine = engine();
        let mut session = session(&engine);
        let mut ids = vec![session.begin().unwrap()];
        for _ in 1..depth {
            ids.push(session.begin_nested().unwrap());
        }
        session.commit_transaction(ids[0]).unwrap();

        prop_assert!(!session.in_transaction());
        for id in ids {
            prop_assert_eq!(session.transaction_state(id), Some(TransactionState::Closed));
            let closed = matches!(
                session.commit_transaction(id),
                Err(CoreError::ClosedTransaction { .. })
            );
            prop_assert!(closed);
            let closed = matches!(
                session.rollback_transaction(id),
                Err(CoreError::ClosedTransaction { .. })
            );
            prop_assert!(closed);
        }
    }

    #[test]
    fn prop_failed_flush_requires_rollback(depth in 0usize..4) {
        let engine = seeded_engine();
        let mut session = session(&engine);
        session.begin().unwrap();
        for _ in 0..depth {
            session.begin_nested().unwrap();
        }

        session.add(USERS, user_with_id(7, "duplicate"));
        prop_assert!(session.flush().is_err());
        let pending = matches!(
            session.count(USERS),
            Err(CoreError::PendingRollback { .. })
        );
        prop_assert!(pending);

        session.rollback().unwrap();
        prop_assert!(session.is_active());
        prop_assert_eq!(session.depth(), depth);
        prop_assert_eq!(session.count(USERS).unwrap(), 4);
    }
}
