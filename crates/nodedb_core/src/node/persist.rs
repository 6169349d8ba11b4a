//! Lifecycle state, write locks and persistence of a node.

use super::{LockHolder, Node};
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::key::Key;
use crate::mapping::{Mapping, MappingKind};
use crate::state::NodeState;
use crate::transaction::Transactor;
use crate::value::{Property, Value};
use std::sync::Arc;

/// A consistent copy of everything the write path needs.
pub(crate) struct NodeSnapshot {
    pub(crate) key: Key,
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) prototype: String,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) created: i64,
    pub(crate) last_modified: i64,
    pub(crate) parent: Option<Key>,
    pub(crate) properties: Vec<Property>,
    pub(crate) children: Vec<Handle>,
    pub(crate) groups: Vec<(String, Arc<Node>)>,
}

impl Node {
    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.status.lock().state
    }

    /// Makes this node and everything reachable from it persistent in the
    /// current transaction. Persisting a node that already has a key does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoTransaction`] without a transaction, or an
    /// error from id generation.
    pub fn persist(&self) -> CoreResult<()> {
        self.make_persistable()
    }

    /// Evicts this node from the shared cache. The next lookup by key
    /// fetches it again.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EngineClosed`] if the engine is gone.
    pub fn invalidate(&self) -> CoreResult<()> {
        let engine = self.engine()?;
        engine.evict_node(&self.arc()?);
        Ok(())
    }

    /// Marks the node invalid without touching any cache.
    pub(crate) fn invalidate_local(&self) {
        let mut status = self.status.lock();
        status.state = NodeState::Invalid;
        status.lock = None;
    }

    /// Forces a state set by the write path after a successful flush.
    pub(crate) fn set_state(&self, to: NodeState) -> CoreResult<()> {
        let mut status = self.status.lock();
        status.state = status.state.transition(to)?;
        Ok(())
    }

    /// Releases the write lock if `transactor` holds it.
    pub(crate) fn release_lock(&self, transactor: &Transactor) {
        let mut status = self.status.lock();
        if status
            .lock
            .as_ref()
            .is_some_and(|holder| holder.id == transactor.id())
        {
            status.lock = None;
        }
    }

    fn take_lock(&self, tx: &Arc<Transactor>) {
        self.status.lock().lock = Some(LockHolder {
            id: tx.id(),
            transactor: Arc::downgrade(tx),
        });
    }

    /// Moves the node to `to` and registers it with the current
    /// transaction. Requests on transient, virtual or invalid nodes are
    /// ignored.
    pub(crate) fn mark_as(&self, to: NodeState) -> CoreResult<()> {
        {
            let mut status = self.status.lock();
            if status.state.is_passive() || status.state == to {
                return Ok(());
            }
            status.state = status.state.transition(to)?;
            if to == NodeState::Clean {
                status.lock = None;
            }
        }
        let Ok(engine) = self.engine() else {
            return Ok(());
        };
        let Some(tx) = engine.current_transactor() else {
            return Ok(());
        };
        let this = self.arc()?;
        match to {
            NodeState::Clean => tx.drop_dirty(&this),
            NodeState::New => {
                tx.visit_dirty(&this);
                if let Some(key) = self.key() {
                    tx.visit_clean(key, &this);
                }
            }
            _ => tx.visit_dirty(&this),
        }
        Ok(())
    }

    /// Takes the write lock for the current transaction.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NoTransaction`] if no transaction is bound to the
    ///   calling thread
    /// - [`CoreError::Timeout`] if the transaction's deadline has passed
    /// - [`CoreError::Invalidated`] if a committed transaction invalidated
    ///   the node
    /// - [`CoreError::ConcurrencyConflict`] if another active transaction
    ///   holds the lock
    pub(crate) fn check_write_lock(&self) -> CoreResult<()> {
        if self.state() == NodeState::Transient {
            return Ok(());
        }
        let engine = self.engine()?;
        let tx = engine.current_transactor().ok_or(CoreError::NoTransaction)?;
        tx.ensure_usable()?;
        let label = self.label();
        {
            let mut status = self.status.lock();
            match status.state {
                NodeState::Invalid => return Err(CoreError::invalidated(label)),
                NodeState::Transient => return Ok(()),
                _ => {}
            }
            if let Some(holder) = &status.lock {
                if holder.id != tx.id()
                    && holder
                        .transactor
                        .upgrade()
                        .is_some_and(|owner| owner.is_active())
                {
                    let holder = holder.id;
                    drop(status);
                    engine.stats_ref().record_conflict();
                    return Err(CoreError::ConcurrencyConflict {
                        node: label,
                        holder,
                    });
                }
            }
            status.lock = Some(LockHolder {
                id: tx.id(),
                transactor: Arc::downgrade(&tx),
            });
        }
        tx.visit_dirty(&self.arc()?);
        Ok(())
    }

    /// Assigns a key to a transient node and persists everything it
    /// reaches. Nodes of derived mappings that need no storage become
    /// virtual instead.
    pub(crate) fn make_persistable(&self) -> CoreResult<()> {
        if self.state() != NodeState::Transient {
            return Ok(());
        }
        let engine = self.engine()?;
        let mapping = self.mapping();
        if mapping.kind() != MappingKind::Normal && !engine.needs_persistence(&mapping) {
            return self.convert_to_virtual(&engine);
        }

        let tx = engine.current_transactor().ok_or(CoreError::NoTransaction)?;
        tx.ensure_usable()?;
        let id = engine.generate_id(&mapping)?;
        let key = mapping.key_for(&id);
        {
            let mut data = self.data.write();
            data.id = Some(id.clone());
            data.key = Some(key.clone());
            data.handle.become_persistent(key.clone());
        }
        {
            let mut status = self.status.lock();
            status.state = status.state.transition(NodeState::New)?;
        }
        self.take_lock(&tx);

        let this = self.arc()?;
        engine.register_key(key.clone(), &this);
        tx.visit_dirty(&this);
        tx.visit_clean(key.clone(), &this);
        tracing::trace!(key = %key, prototype = %self.prototype(), "node became persistable");

        self.persist_reachable(&engine, &key)
    }

    fn convert_to_virtual(&self, engine: &Engine) -> CoreResult<()> {
        let Some(parent_key) = self.parent_handle().and_then(|h| h.key()) else {
            return Ok(());
        };
        let name = self.name();
        let key = Key::synthetic(parent_key, name.clone());
        {
            let mut data = self.data.write();
            data.id = Some(name);
            data.key = Some(key.clone());
            data.handle.become_persistent(key.clone());
        }
        self.set_state(NodeState::Virtual)?;
        let this = self.arc()?;
        engine.register_key(key.clone(), &this);
        self.persist_reachable(engine, &key)
    }

    /// Persists transient children, referenced nodes and group nodes.
    fn persist_reachable(&self, engine: &Engine, key: &Key) -> CoreResult<()> {
        let (reachable, groups) = {
            let data = self.data.read();
            let children = data
                .children
                .as_ref()
                .map(|list| list.handles())
                .unwrap_or_default();
            let references = data
                .properties
                .values()
                .filter(|p| !Property::is_transient_name(p.name()))
                .filter_map(|p| p.value().as_handle().cloned());
            let reachable: Vec<Arc<Node>> = children
                .into_iter()
                .chain(references)
                .filter_map(|h| h.cached())
                .collect();
            let groups: Vec<(String, Arc<Node>)> = data
                .groups
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect();
            (reachable, groups)
        };

        for (value, group) in groups {
            if group.state() == NodeState::Transient {
                group.assign_group_key(engine, Key::synthetic(key.clone(), value))?;
            }
        }
        for node in reachable {
            if node.state() == NodeState::Transient {
                node.make_persistable()?;
            }
        }
        Ok(())
    }

    fn assign_group_key(&self, engine: &Engine, key: Key) -> CoreResult<()> {
        self.data.write().handle.become_persistent(key.clone());
        self.data.write().key = Some(key.clone());
        self.set_state(NodeState::Virtual)?;
        engine.register_key(key.clone(), &self.arc()?);
        self.persist_reachable(engine, &key)
    }

    pub(crate) fn snapshot(&self) -> CoreResult<NodeSnapshot> {
        let data = self.data.read();
        let key = data
            .key
            .clone()
            .ok_or_else(|| CoreError::invalid_operation("a transient node has no stored form"))?;
        Ok(NodeSnapshot {
            id: data.id.clone().unwrap_or_else(|| key.id()),
            key,
            name: data.name.clone(),
            prototype: data.prototype.clone(),
            mapping: Arc::clone(&data.mapping),
            created: data.created,
            last_modified: data.last_modified,
            parent: data.parent.as_ref().and_then(Handle::key),
            properties: data
                .properties
                .values()
                .filter(|p| !Property::is_transient_name(p.name()))
                .cloned()
                .collect(),
            children: data
                .children
                .as_ref()
                .map(|list| list.handles())
                .unwrap_or_default(),
            groups: data
                .groups
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect(),
        })
    }

    /// Returns the persisted properties changed since the last flush.
    pub(crate) fn dirty_properties(&self) -> Vec<Property> {
        self.data
            .read()
            .properties
            .values()
            .filter(|p| p.is_dirty() && !Property::is_transient_name(p.name()))
            .cloned()
            .collect()
    }

    pub(crate) fn mark_properties_clean(&self, names: &[String]) {
        let mut data = self.data.write();
        for name in names {
            if let Some(prop) = data.properties.get_mut(name) {
                prop.mark_clean();
            }
        }
    }

    pub(crate) fn clear_dirty(&self) {
        for prop in self.data.write().properties.values_mut() {
            prop.mark_clean();
        }
    }

    /// Returns the handles held by reference properties.
    pub(crate) fn reference_handles(&self) -> Vec<Handle> {
        self.data
            .read()
            .properties
            .values()
            .filter_map(|p| match p.value() {
                Value::Reference(h) => Some(h.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_nodes_ignore_status_requests() {
        let node = Node::for_test(Key::embedded("1"));
        node.invalidate_local();
        node.mark_as(NodeState::Modified).unwrap();
        assert_eq!(node.state(), NodeState::Invalid);
    }

    #[test]
    fn mark_as_validates_transitions() {
        let node = Node::for_test(Key::embedded("1"));
        node.mark_as(NodeState::Modified).unwrap();
        assert_eq!(node.state(), NodeState::Modified);
        node.mark_as(NodeState::Clean).unwrap();
        assert!(node.mark_as(NodeState::New).is_err());
    }

    #[test]
    fn snapshot_skips_transient_properties() {
        let node = Node::for_test(Key::embedded("1"));
        {
            let mut data = node.data.write();
            data.properties
                .insert("title".into(), Property::changed("title", Value::from("a")));
            data.properties
                .insert("_scratch".into(), Property::changed("_scratch", Value::from("b")));
        }
        let snap = node.snapshot().unwrap();
        assert_eq!(snap.properties.len(), 1);
        assert_eq!(node.dirty_properties().len(), 1);
        node.mark_properties_clean(&["title".to_string()]);
        assert!(node.dirty_properties().is_empty());
    }

    #[test]
    fn lock_checks_need_an_engine() {
        let node = Node::for_test(Key::embedded("1"));
        assert!(matches!(node.check_write_lock(), Err(CoreError::EngineClosed)));
    }
}
