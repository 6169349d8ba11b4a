//! Identity map behavior: one in-memory instance per stored object.

use nodedb_core::Key;
use nodedb_storage::Row;
use nodedb_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn seed_story(t: &TestEngine, id: i64, slug: &str) {
    t.db.seed(
        "story",
        Row::new()
            .with("id", id)
            .with("slug", slug)
            .with("title", format!("Story {slug}"))
            .with("category", "news"),
    )
    .unwrap();
}

#[test]
fn concurrent_fetches_converge_on_one_instance() {
    init_tracing();
    let t = TestEngine::memory();
    seed_story(&t, 1, "first");
    let key = Key::relational("story", "1");

    let nodes = concurrent_fetch(&t, &key, 8).unwrap();
    assert_eq!(nodes.len(), 8);
    assert!(all_same_instance(&nodes));

    let again = t.get_node_by_key(&key).unwrap().unwrap();
    assert!(Arc::ptr_eq(nodes[0].as_ref().unwrap(), &again));
}

#[test]
fn missing_rows_are_absent_not_errors() {
    let t = TestEngine::memory();
    let nodes = concurrent_fetch(&t, &Key::relational("story", "404"), 4).unwrap();
    assert!(nodes.iter().all(Option::is_none));
}

#[test]
fn name_and_key_lookups_share_the_instance() {
    let t = TestEngine::memory();
    let site = t.transaction(|_| add_site(&t, "news")).unwrap();

    let by_name = t.root().unwrap().child("news").unwrap().unwrap();
    let by_key = t.get_node_by_key(&site.key().unwrap()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&site, &by_name));
    assert!(Arc::ptr_eq(&site, &by_key));
}

#[test]
fn evicted_nodes_are_fetched_again() {
    let t = TestEngine::memory();
    seed_story(&t, 1, "first");
    let key = Key::relational("story", "1");

    let before = t.get_node_by_key(&key).unwrap().unwrap();
    t.evict_node(&before);
    let after = t.get_node_by_key(&key).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.get_string("slug").as_deref(), Some("first"));
}

#[test]
fn cleared_cache_still_serves_stored_objects() {
    let t = TestEngine::memory();
    t.transaction(|_| add_site(&t, "news")).unwrap();
    t.clear_cache();
    assert_eq!(t.cache_size(), 0);

    let site = t.root().unwrap().child("news").unwrap().unwrap();
    assert_eq!(site.get_string("name").as_deref(), Some("news"));
}

#[test]
fn first_root_access_from_many_threads_converges() {
    for _ in 0..50 {
        let t = TestEngine::memory();
        let barrier = Barrier::new(8);
        let roots: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        t.root()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let roots: Vec<_> = roots.into_iter().map(Result::unwrap).collect();
        assert!(roots.iter().all(|r| Arc::ptr_eq(r, &roots[0])));
        assert!(Arc::ptr_eq(&roots[0], &t.root().unwrap()));
    }
}

proptest! {
    #[test]
    fn keys_hash_structurally(key in key_strategy()) {
        let rebuilt = key.clone();
        let mut set = HashSet::new();
        set.insert(key);
        prop_assert!(set.contains(&rebuilt));
    }

    #[test]
    fn embedded_and_relational_keys_never_collide(id in id_strategy(), table in table_strategy()) {
        prop_assert_ne!(Key::embedded(id.clone()), Key::relational(table, id));
    }
}
