//! Thread binding and the commit protocol.

use super::state::{TransactionState, Transactor};
use crate::change_feed::ChangeSet;
use crate::engine::{Engine, Shared};
use crate::error::CoreResult;
use crate::mapping::Mapping;
use crate::state::NodeState;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

thread_local! {
    /// Transactions bound to this thread, at most one per engine.
    static BOUND: RefCell<Vec<Arc<Transactor>>> = const { RefCell::new(Vec::new()) };
}

/// Returns the transaction of `engine` bound to the calling thread.
pub(crate) fn current(engine: &Arc<Shared>) -> Option<Arc<Transactor>> {
    BOUND.with(|bound| {
        bound
            .borrow()
            .iter()
            .find(|tx| tx.belongs_to(engine))
            .cloned()
    })
}

pub(crate) fn bind(tx: Arc<Transactor>) {
    BOUND.with(|bound| bound.borrow_mut().push(tx));
}

pub(crate) fn unbind(tx: &Transactor) {
    BOUND.with(|bound| bound.borrow_mut().retain(|t| !std::ptr::eq(t.as_ref(), tx)));
}

/// Flushes every dirty node, then publishes the commit.
///
/// On a write failure the transaction is aborted and the error returned.
pub(crate) fn commit(engine: &Engine, tx: &Transactor) -> CoreResult<ChangeSet> {
    tx.ensure_usable()?;
    let started = Instant::now();
    let (dirty, parents) = tx.pending();
    let mut changes = ChangeSet::default();
    let mut touched: Vec<Arc<Mapping>> = Vec::new();

    let flushed = (|| -> CoreResult<()> {
        for node in &dirty {
            let Some(key) = node.key() else { continue };
            match node.state() {
                NodeState::New => {
                    engine.insert_node(node)?;
                    node.set_state(NodeState::Clean)?;
                    touched.push(node.mapping());
                    changes.inserted.push(key);
                }
                NodeState::Modified => {
                    let mapping_changed = engine.update_node(node)?;
                    node.set_state(NodeState::Clean)?;
                    if mapping_changed {
                        touched.push(node.mapping());
                    }
                    changes.updated.push(key);
                }
                NodeState::Deleted => {
                    let persisted = node.is_persisted();
                    engine.delete_node(node)?;
                    if persisted {
                        touched.push(node.mapping());
                        changes.deleted.push(key);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    })();

    if let Err(err) = flushed {
        tracing::warn!(txn = %tx.id(), error = %err, "commit failed, aborting");
        abort(engine, tx);
        return Err(err);
    }

    if !touched.is_empty() {
        let clock = engine.tick();
        for mapping in &touched {
            mapping.touch(clock);
        }
    }
    for parent in &parents {
        parent.bump_subnode_counter();
        if let Some(key) = parent.key() {
            changes.parents.push(key);
        }
    }
    for node in &dirty {
        node.release_lock(tx);
    }

    tx.finish(TransactionState::Committed);
    drop(tx.take_ledger());
    changes.sequence = engine.next_commit_sequence();
    engine.stats_ref().record_commit();
    tracing::debug!(
        txn = %tx.id(),
        sequence = %changes.sequence,
        inserted = changes.inserted.len(),
        updated = changes.updated.len(),
        deleted = changes.deleted.len(),
        parents = changes.parents.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "transaction committed"
    );
    if !changes.is_empty() {
        engine.notify_listeners(&changes);
    }
    Ok(changes)
}

/// Discards every pending change. Nodes with unflushed writes are evicted
/// and invalidated so the next lookup refetches the stored state.
pub(crate) fn abort(engine: &Engine, tx: &Transactor) {
    if !tx.finish(TransactionState::Aborted) {
        return;
    }
    let ledger = tx.take_ledger();
    let mut evicted = 0usize;
    for node in &ledger.dirty {
        if node.state().is_dirty() {
            engine.evict_node(node);
            evicted += 1;
        } else {
            node.release_lock(tx);
        }
    }
    for parent in &ledger.parents {
        parent.mark_children_stale();
    }
    engine.stats_ref().record_abort();
    tracing::debug!(txn = %tx.id(), evicted, "transaction aborted");
}

#[cfg(test)]
mod tests {
    use crate::change_feed::{ChangeSet, NodeChangeListener};
    use crate::error::CoreError;
    use crate::mapping::{Mapping, MappingRegistry, Relation};
    use crate::node::Node;
    use crate::state::NodeState;
    use crate::{Engine, TransactionState};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ChangeSet>>);

    impl NodeChangeListener for Collect {
        fn nodes_changed(&self, changes: &ChangeSet) {
            self.0.lock().push(changes.clone());
        }
    }

    fn engine() -> Engine {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::embedded("root")
                    .children(Relation::children("page"))
                    .build(),
            )
            .unwrap();
        registry.register(Mapping::embedded("page").build()).unwrap();
        Engine::builder().mappings(registry).build().unwrap()
    }

    fn committed_page(engine: &Engine, title: &str) -> Arc<Node> {
        engine
            .transaction(|_| {
                let page = engine.create_node("page")?;
                page.set_string("title", title)?;
                engine.root()?.add_child(&page)?;
                Ok(page)
            })
            .unwrap()
    }

    #[test]
    fn commit_bumps_parent_counter_once() {
        let engine = engine();
        let root = engine.root().unwrap();
        let before = root.last_subnode_change();
        engine
            .transaction(|_| {
                root.add_child(&engine.create_node("page")?)?;
                root.add_child(&engine.create_node("page")?)
            })
            .unwrap();
        assert_eq!(root.last_subnode_change(), before + 1);
    }

    #[test]
    fn commit_releases_locks() {
        let engine = engine();
        let page = committed_page(&engine, "a");
        assert!(page.lock_holder().is_none());
        let txn = engine.begin().unwrap();
        page.set_string("title", "b").unwrap();
        assert_eq!(page.lock_holder(), Some(txn.id()));
        txn.commit().unwrap();
        assert!(page.lock_holder().is_none());
        assert_eq!(page.state(), NodeState::Clean);
    }

    #[test]
    fn abort_evicts_modified_nodes() {
        let engine = engine();
        let page = committed_page(&engine, "kept");
        let key = page.key().unwrap();

        let txn = engine.begin().unwrap();
        page.set_string("title", "discarded").unwrap();
        txn.abort();

        assert_eq!(page.state(), NodeState::Invalid);
        let fresh = engine.get_node_by_key(&key).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&fresh, &page));
        assert_eq!(fresh.get_string("title").as_deref(), Some("kept"));
    }

    #[test]
    fn dropped_transaction_aborts() {
        let engine = engine();
        let page = committed_page(&engine, "kept");
        {
            let _txn = engine.begin().unwrap();
            page.set_string("title", "lost").unwrap();
        }
        assert_eq!(page.state(), NodeState::Invalid);
        assert_eq!(engine.stats().aborts, 1);
    }

    #[test]
    fn writers_on_other_threads_conflict() {
        let engine = engine();
        let page = committed_page(&engine, "a");
        let txn = engine.begin().unwrap();
        page.set_string("title", "mine").unwrap();

        let (other_engine, other_page) = (engine.clone(), Arc::clone(&page));
        let result = std::thread::spawn(move || {
            let txn = other_engine.begin().unwrap();
            let result = other_page.set_string("title", "theirs");
            txn.abort();
            result
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(CoreError::ConcurrencyConflict { .. })));
        txn.commit().unwrap();
        assert_eq!(page.get_string("title").as_deref(), Some("mine"));
        assert_eq!(engine.stats().conflicts, 1);
    }

    #[test]
    fn writes_need_a_transaction() {
        let engine = engine();
        let page = committed_page(&engine, "a");
        assert!(matches!(
            page.set_string("title", "b"),
            Err(CoreError::NoTransaction)
        ));
    }

    #[test]
    fn listeners_see_each_commit() {
        let engine = engine();
        let listener = Arc::new(Collect::default());
        engine.add_listener(listener.clone());
        let page = committed_page(&engine, "a");
        engine
            .transaction(|_| page.set_string("title", "b"))
            .unwrap();

        let seen = listener.0.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].inserted, vec![page.key().unwrap()]);
        assert_eq!(seen[1].updated, vec![page.key().unwrap()]);
        assert!(seen[1].sequence > seen[0].sequence);
    }

    #[test]
    fn committed_transaction_reports_state() {
        let engine = engine();
        let txn = engine.begin().unwrap();
        assert_eq!(txn.state(), TransactionState::Active);
        let changes = txn.commit().unwrap();
        assert!(changes.is_empty());
    }
}
