// tests/store_flush.rs

//! State store durability: atomic deferred flushes and transaction cleanup.

use bake::Error;
use bake::store::{Store, TransactionStatus, TransactionType};
use rusqlite::Connection;
use tempfile::TempDir;

const DAY: i64 = 24 * 60 * 60;

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_failed_flush_leaves_database_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");
    let store = Store::open(&path).unwrap();

    let side = Connection::open(&path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER refuse_transactions BEFORE INSERT ON transactions
         BEGIN SELECT RAISE(ABORT, 'refused'); END;",
    )
    .unwrap();

    let mut guard = store.lock();
    guard.add_application("greeter", Vec::new(), Vec::new()).unwrap();
    guard
        .add_transaction(TransactionType::Install, "greeter", None)
        .unwrap();
    assert_eq!(guard.pending_ops(), 2);
    let err = guard.unlock().unwrap_err();
    assert!(matches!(err, Error::StateInconsistent(_)));

    // Neither op reached the database
    assert_eq!(count(&side, "applications"), 0);
    assert_eq!(count(&side, "transactions"), 0);

    // Memory kept the ops, but the store refuses changes until reloaded
    let mut guard = store.lock();
    assert!(guard.is_dirty());
    assert!(guard.application("greeter").is_some());
    let err = guard
        .add_transaction(TransactionType::Build, "other", None)
        .unwrap_err();
    assert!(matches!(err, Error::StateInconsistent(_)));
    drop(guard);

    side.execute_batch("DROP TRIGGER refuse_transactions;").unwrap();
    store.reload().unwrap();

    let mut guard = store.lock();
    assert!(!guard.is_dirty());
    assert!(guard.application("greeter").is_none());
    guard.add_application("greeter", Vec::new(), Vec::new()).unwrap();
    guard
        .add_transaction(TransactionType::Install, "greeter", None)
        .unwrap();
    guard.unlock().unwrap();

    assert_eq!(count(&side, "applications"), 1);
    assert_eq!(count(&side, "transactions"), 1);
}

#[test]
fn test_nested_guards_flush_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");
    let store = Store::open(&path).unwrap();
    let side = Connection::open(&path).unwrap();

    let mut outer = store.lock();
    {
        let mut inner = outer.lock();
        inner.add_application("greeter", Vec::new(), Vec::new()).unwrap();
        inner.unlock().unwrap();
    }
    assert_eq!(count(&side, "applications"), 0);
    assert!(outer.application("greeter").is_some());
    outer.unlock().unwrap();
    assert_eq!(count(&side, "applications"), 1);
}

#[test]
fn test_cleanup_keeps_ten_most_recent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");
    let now = 1_800_000_000;
    {
        let store = Store::open(&path).unwrap();
        let mut guard = store.lock();
        for i in 0..15 {
            let id = guard
                .add_transaction(TransactionType::Build, &format!("build-{}", i), None)
                .unwrap();
            guard
                .complete_transaction_at(id, TransactionStatus::Completed, now - 10 * DAY + i)
                .unwrap();
        }
        guard.unlock().unwrap();

        let mut guard = store.lock();
        assert_eq!(guard.transaction_cleanup_at(now).unwrap(), 5);
        assert_eq!(guard.transactions().len(), 10);
        guard.unlock().unwrap();
    }

    // The removal is durable and hit the oldest five
    let store = Store::open(&path).unwrap();
    let guard = store.lock();
    let mut names: Vec<String> = guard.transactions().iter().map(|t| t.name.clone()).collect();
    names.sort();
    let mut expected: Vec<String> = (5..15).map(|i| format!("build-{}", i)).collect();
    expected.sort();
    assert_eq!(names, expected);
}

#[test]
fn test_cleanup_spares_recent_transactions() {
    let store = Store::open_in_memory().unwrap();
    let now = 1_800_000_000;
    let mut guard = store.lock();
    for i in 0..15 {
        let id = guard
            .add_transaction(TransactionType::Build, &format!("build-{}", i), None)
            .unwrap();
        guard
            .complete_transaction_at(id, TransactionStatus::Completed, now - DAY)
            .unwrap();
    }
    assert_eq!(guard.transaction_cleanup_at(now).unwrap(), 0);
    assert_eq!(guard.transactions().len(), 15);
}
