//! Commit-time writes.

use super::Engine;
use crate::error::CoreResult;
use crate::hooks::Hook;
use crate::node::Node;
use std::sync::Arc;

impl Engine {
    /// Writes a new node and marks it persisted.
    pub(crate) fn insert_node(&self, node: &Arc<Node>) -> CoreResult<()> {
        self.run_hook(node, Hook::OnPersist);
        let snapshot = node.snapshot()?;
        self.backend_for(&snapshot.mapping)?.insert(&snapshot)?;
        node.mark_persisted(true);
        node.clear_dirty();
        self.0.stats.record_insert();
        tracing::trace!(node = %node.label(), "node inserted");
        Ok(())
    }

    /// Writes the changes of a modified node. Returns true if a
    /// non-private value changed.
    pub(crate) fn update_node(&self, node: &Arc<Node>) -> CoreResult<bool> {
        self.run_hook(node, Hook::OnPersist);
        let mapping = node.mapping();
        let changed = self.backend_for(&mapping)?.update(node)?;
        self.0.stats.record_update();
        tracing::trace!(node = %node.label(), changed, "node updated");
        Ok(changed)
    }

    /// Deletes a node's stored data, if it has any, and evicts it.
    pub(crate) fn delete_node(&self, node: &Arc<Node>) -> CoreResult<()> {
        if node.is_persisted() {
            self.run_hook(node, Hook::OnRemove);
            let snapshot = node.snapshot()?;
            self.backend_for(&snapshot.mapping)?.delete(&snapshot)?;
            node.mark_persisted(false);
            self.0.stats.record_delete();
            tracing::trace!(node = %node.label(), "node deleted");
        }
        self.evict_node(node);
        Ok(())
    }

    /// Runs an application hook. Failures are logged and counted.
    pub(crate) fn run_hook(&self, node: &Arc<Node>, hook: Hook) {
        if !self.0.context.is_active() {
            return;
        }
        if let Err(err) = self.0.context.invoke(node, hook) {
            self.0.stats.record_hook_failure();
            tracing::warn!(
                hook = hook.name(),
                node = %node.label(),
                error = %err,
                "lifecycle hook failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::RequestContext;
    use crate::mapping::{Mapping, MappingRegistry};
    use crate::state::NodeState;
    use parking_lot::Mutex;
    use std::error::Error;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Hook, String)>>,
        fail: bool,
    }

    impl RequestContext for Recorder {
        fn is_active(&self) -> bool {
            true
        }

        fn invoke(&self, node: &Arc<Node>, hook: Hook) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.calls.lock().push((hook, node.prototype()));
            if self.fail {
                Err("hook exploded".into())
            } else {
                Ok(())
            }
        }
    }

    fn engine(context: Arc<Recorder>) -> Engine {
        let mut registry = MappingRegistry::new();
        registry.register(Mapping::embedded("page").build()).unwrap();
        Engine::builder()
            .mappings(registry)
            .request_context(context)
            .build()
            .unwrap()
    }

    #[test]
    fn persist_and_remove_hooks_run() {
        let context = Arc::new(Recorder::default());
        let engine = engine(context.clone());
        let page = engine
            .transaction(|_| {
                let page = engine.create_node("page")?;
                engine.root()?.add_child(&page)?;
                Ok(page)
            })
            .unwrap();
        assert_eq!(page.state(), NodeState::Clean);
        engine.transaction(|_| page.remove()).unwrap();

        let calls = context.calls.lock();
        assert!(calls.contains(&(Hook::OnPersist, "page".to_string())));
        assert!(calls.contains(&(Hook::OnRemove, "page".to_string())));
    }

    #[test]
    fn failing_hook_does_not_abort_commit() {
        let context = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let engine = engine(context);
        engine
            .transaction(|_| {
                let page = engine.create_node("page")?;
                engine.root()?.add_child(&page)
            })
            .unwrap();
        assert!(engine.stats().hook_failures > 0);
    }
}
