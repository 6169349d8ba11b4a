//! Write locks across threads and transaction deadlines.

use nodedb_core::{CoreError, EngineConfig, NodeState};
use nodedb_testkit::prelude::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn second_writer_fails_fast_and_succeeds_after_commit() {
    init_tracing();
    let t = TestEngine::memory();
    let site = t.transaction(|_| add_site(&t, "news")).unwrap();
    let key = site.key().unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let (tried_tx, tried_rx) = mpsc::channel();

    thread::scope(|scope| {
        let engine = &t.engine;
        let first = scope.spawn(move || {
            let txn = engine.begin().unwrap();
            let site = engine.get_node_by_key(&key).unwrap().unwrap();
            site.set_string("title", "first").unwrap();
            locked_tx.send(()).unwrap();
            tried_rx.recv().unwrap();
            txn.commit().unwrap();
        });

        locked_rx.recv().unwrap();
        let txn = t.begin().unwrap();
        let err = site.set_string("title", "second").unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict { .. }));
        assert!(err.is_retryable());
        txn.abort();
        tried_tx.send(()).unwrap();
        first.join().unwrap();
    });

    assert_eq!(site.get_string("title").as_deref(), Some("first"));
    t.transaction(|_| site.set_string("title", "second")).unwrap();
    assert_eq!(site.get_string("title").as_deref(), Some("second"));
    assert_eq!(site.state(), NodeState::Clean);
    assert_eq!(t.stats().conflicts, 1);
}

#[test]
fn contended_increments_lose_nothing() {
    init_tracing();
    let t = TestEngine::memory();
    let site = t.transaction(|_| add_site(&t, "news")).unwrap();
    let key = site.key().unwrap();

    let result = contended_increments(&t, &key, "hits", 4, 10);
    result.print_summary("contended increments");

    assert_eq!(result.successful_ops, 40);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(site.get_integer("hits"), Some(40));
    assert_eq!(t.stats().conflicts as usize, result.conflicts);
}

#[test]
fn expired_transaction_rejects_writes() {
    let t = TestEngine::memory_with_config(
        EngineConfig::default().transaction_timeout(Duration::from_millis(200)),
    );
    let site = t.transaction(|_| add_site(&t, "news")).unwrap();

    let txn = t.begin().unwrap();
    thread::sleep(Duration::from_millis(300));
    let err = site.set_string("title", "late").unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }));
    assert!(err.is_fatal_to_transaction());
    txn.abort();
    assert_eq!(site.get_string("title"), None);
}

#[test]
fn reads_need_no_transaction() {
    let t = TestEngine::memory();
    t.transaction(|_| add_site(&t, "news")).unwrap();
    let site = t.root().unwrap().child("news").unwrap().unwrap();
    assert_eq!(site.get_string("name").as_deref(), Some("news"));

    let err = site.set_string("title", "x").unwrap_err();
    assert!(matches!(err, CoreError::NoTransaction));
}
