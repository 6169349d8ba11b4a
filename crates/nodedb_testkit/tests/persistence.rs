//! Write path: minimal updates, id assignment, failures and reopening.

use nodedb_core::{ChangeFeed, ChangeType, CoreError, Key, NodeState};
use nodedb_storage::{Row, SqlValue, Statement};
use nodedb_testkit::prelude::*;
use std::sync::Arc;

#[test]
fn updates_write_only_changed_columns() {
    init_tracing();
    let t = TestEngine::memory();
    t.db.seed(
        "story",
        Row::new()
            .with("id", 1)
            .with("slug", "a")
            .with("title", "Old")
            .with("category", "news")
            .with("views", 3),
    )
    .unwrap();
    let story = t.get_node_by_key(&Key::relational("story", "1")).unwrap().unwrap();

    t.db.clear_log();
    t.transaction(|_| story.set_string("title", "New")).unwrap();

    let writes = t.db.write_statements();
    assert_eq!(writes.len(), 1);
    match &writes[0] {
        Statement::Update { table, values, .. } => {
            assert_eq!(table, "story");
            assert_eq!(values, &vec![("title".to_string(), SqlValue::Text("New".into()))]);
        }
        other => panic!("expected an update, got {other:?}"),
    }
    assert_eq!(story.state(), NodeState::Clean);
    assert_eq!(story.get_integer("views"), Some(3));
}

#[test]
fn unchanged_nodes_write_nothing() {
    let t = TestEngine::memory();
    t.db.seed(
        "story",
        Row::new().with("id", 1).with("slug", "a").with("title", "Same"),
    )
    .unwrap();
    let story = t.get_node_by_key(&Key::relational("story", "1")).unwrap().unwrap();

    t.db.clear_log();
    t.transaction(|_| story.set_string("title", "Same")).unwrap();
    assert!(t.db.write_statements().is_empty());
    assert_eq!(story.state(), NodeState::Clean);
}

#[test]
fn persisting_twice_keeps_the_first_id() {
    let t = TestEngine::memory();
    let user = t
        .transaction(|_| {
            let user = t.create_node("user")?;
            user.set_string("login", "ada")?;
            user.persist()?;
            let id = user.id();
            user.persist()?;
            assert_eq!(user.id(), id);
            Ok(user)
        })
        .unwrap();

    let rows = t.db.rows("users");
    assert_eq!(rows.len(), 1);
    let stored = rows[0].get("id").unwrap();
    assert!(stored.loosely_equals(&SqlValue::Text(user.id().unwrap())));
    let inserts = t
        .db
        .write_statements()
        .into_iter()
        .filter(|s| matches!(s, Statement::Insert { .. }))
        .count();
    assert_eq!(inserts, 1);
}

#[test]
fn failed_commit_leaves_no_rows() {
    let t = TestEngine::memory();
    t.transaction(|_| add_site(&t, "news")).unwrap();
    t.db.fail_writes(true);

    let result = t.transaction(|_| {
        let site = t.root()?.child("news")?.expect("site exists");
        add_story(&t, &site, "lost", "sports")
    });
    assert!(matches!(result, Err(CoreError::Storage(_))));
    assert!(t.db.rows("story").is_empty());
    assert!(t.stats().aborts >= 1);

    t.db.fail_writes(false);
    let story = t
        .transaction(|_| {
            let site = t.root()?.child("news")?.expect("site exists");
            add_story(&t, &site, "kept", "sports")
        })
        .unwrap();
    assert_eq!(story.state(), NodeState::Clean);
    assert_eq!(t.db.rows("story").len(), 1);
}

#[test]
fn renaming_moves_the_access_name() {
    let t = TestEngine::memory();
    let (site, other) = t
        .transaction(|_| Ok((add_site(&t, "news")?, add_site(&t, "sport")?)))
        .unwrap();

    t.transaction(|_| site.set_string("name", "daily")).unwrap();
    let root = t.root().unwrap();
    assert!(Arc::ptr_eq(&root.child("daily").unwrap().unwrap(), &site));
    assert!(root.child("news").unwrap().is_none());

    let err = t
        .transaction(|_| other.set_string("name", "daily"))
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateName { .. }));
}

#[test]
fn file_store_survives_reopen() {
    let t = TestEngine::file();
    assert!(t.path().is_some());
    t.transaction(|_| {
        let site = add_site(&t, "news")?;
        site.set_integer("rank", 7)?;
        add_story(&t, &site, "a", "sports")?;
        Ok(())
    })
    .unwrap();

    let t = t.reopen();
    assert_eq!(t.cache_size(), 0);
    let site = t.root().unwrap().child("news").unwrap().unwrap();
    assert_eq!(site.get_integer("rank"), Some(7));
    let sports = site.group("sports", false).unwrap().unwrap();
    let story = sports.child_at(0).unwrap().unwrap();
    assert_eq!(story.get_string("slug").as_deref(), Some("a"));
}

#[test]
fn change_feed_sees_committed_keys() {
    let t = TestEngine::memory();
    let feed = Arc::new(ChangeFeed::new());
    t.add_listener(feed.clone());

    let site = t.transaction(|_| add_site(&t, "news")).unwrap();
    let key = site.key().unwrap();
    let events = feed.poll(0, 100);
    assert!(events
        .iter()
        .any(|e| e.key == key && e.change_type == ChangeType::Insert));

    let cursor = feed.latest_sequence();
    t.transaction(|_| site.set_string("title", "Daily")).unwrap();
    let events = feed.poll(cursor, 100);
    assert!(events
        .iter()
        .any(|e| e.key == key && e.change_type == ChangeType::Update));

    let before = feed.latest_sequence();
    let result: Result<(), CoreError> = t.transaction(|_| {
        site.set_string("title", "Dropped")?;
        Err(CoreError::invalid_operation("rolled back"))
    });
    assert!(result.is_err());
    assert_eq!(feed.latest_sequence(), before);
}
