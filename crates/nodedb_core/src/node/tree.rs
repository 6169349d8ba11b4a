//! Parent and child collection operations.

use super::Node;
use crate::children::Slot;
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::key::Key;
use crate::mapping::MappingKind;
use crate::state::NodeState;
use std::sync::Arc;

impl Node {
    /// Returns the parent node.
    ///
    /// The parent is the node this one was attached to, or else the node
    /// referenced by the mapping's parent property.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the parent has to be fetched and the
    /// fetch fails.
    pub fn parent(&self) -> CoreResult<Option<Arc<Node>>> {
        if let Some(handle) = self.parent_handle() {
            let engine = self.engine()?;
            if let Some(parent) = handle.resolve(&engine)? {
                return Ok(Some(parent));
            }
        }
        let mapping = self.mapping();
        match mapping.parent_property() {
            Some(property) => self.get_node(property),
            None => Ok(None),
        }
    }

    /// Returns the number of children.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the collection has to be loaded and the
    /// query fails.
    pub fn child_count(&self) -> CoreResult<usize> {
        let engine = self.engine()?;
        engine.ensure_children(&self.arc()?)?;
        Ok(self.with_children(|list| list.map_or(0, |l| l.len())))
    }

    /// Returns the child at `index`, loading its window first for segmented
    /// collections.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a load or fetch fails.
    pub fn child_at(&self, index: usize) -> CoreResult<Option<Arc<Node>>> {
        let engine = self.engine()?;
        let this = self.arc()?;
        engine.ensure_children(&this)?;
        let mut slot = self.with_children(|list| list.map_or(Slot::OutOfRange, |l| l.slot(index)));
        if matches!(slot, Slot::Unloaded) {
            engine.load_windows(&this, index, 1)?;
            slot = self.with_children(|list| list.map_or(Slot::OutOfRange, |l| l.slot(index)));
        }
        match slot {
            Slot::Loaded(handle) => engine.resolve_child(&this, &handle),
            Slot::Unloaded | Slot::OutOfRange => Ok(None),
        }
    }

    /// Returns the handles of all children, loading every window.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the collection has to be loaded and the
    /// query fails.
    pub fn child_handles(&self) -> CoreResult<Vec<Handle>> {
        let engine = self.engine()?;
        let this = self.arc()?;
        engine.materialize_children(&this)?;
        Ok(self.with_children(|list| list.map(|l| l.handles()).unwrap_or_default()))
    }

    /// Returns all children, fetching uncached ones in one batch.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a load or fetch fails.
    pub fn children(&self) -> CoreResult<Vec<Arc<Node>>> {
        let engine = self.engine()?;
        let this = self.arc()?;
        let handles = self.child_handles()?;
        engine.prefetch_handles(&this, &handles);
        let mut nodes = Vec::with_capacity(handles.len());
        for handle in &handles {
            if let Some(node) = engine.resolve_child(&this, handle)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Looks up a child by name through the child collection relation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup has to query and fails.
    pub fn child(&self, name: &str) -> CoreResult<Option<Arc<Node>>> {
        let engine = self.engine()?;
        let mapping = self.mapping();
        match mapping.relation_for_name(name) {
            Some(rel) => engine.get_node_by_relation(&self.arc()?, name, rel),
            None => Ok(None),
        }
    }

    /// Returns the position of `node` in the child collection.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the collection has to be loaded and the
    /// query fails.
    pub fn index_of(&self, node: &Node) -> CoreResult<Option<usize>> {
        let handle = node.handle();
        Ok(self.child_handles()?.iter().position(|h| *h == handle))
    }

    /// Returns true if `node` is a child of this node.
    ///
    /// # Errors
    ///
    /// See [`Node::index_of`].
    pub fn contains(&self, node: &Node) -> CoreResult<bool> {
        Ok(self.index_of(node)?.is_some())
    }

    /// Loads the given window of a segmented collection and fetches every
    /// child in it with one query.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the window cannot be loaded. Prefetch
    /// failures themselves are only logged.
    pub fn prefetch_children(&self, start: usize, length: usize) -> CoreResult<()> {
        let engine = self.engine()?;
        let this = self.arc()?;
        engine.ensure_children(&this)?;
        engine.load_windows(&this, start, length)?;
        let handles = self.with_children(|list| {
            list.map(|l| {
                (start..start.saturating_add(length).min(l.len()))
                    .filter_map(|i| match l.slot(i) {
                        Slot::Loaded(h) => Some(h),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
        });
        engine.prefetch_handles(&this, &handles);
        Ok(())
    }

    /// Returns the group node for `value`, creating it if `create` is set.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the collection has to be loaded and the
    /// query fails.
    pub fn group(&self, value: &str, create: bool) -> CoreResult<Option<Arc<Node>>> {
        self.engine()?.group_node(&self.arc()?, value, create)
    }

    /// Appends a child.
    ///
    /// # Errors
    ///
    /// See [`Node::insert_child`].
    pub fn add_child(&self, child: &Arc<Node>) -> CoreResult<()> {
        self.insert_child(usize::MAX, child)
    }

    /// Inserts a child at `index`, or appends if the index is past the end.
    /// Adding a node that is already a child moves it.
    ///
    /// For grouped collections the child goes into the group matching its
    /// group-by property, and the index applies within that group.
    ///
    /// # Errors
    ///
    /// - write-lock errors for this node or the child
    /// - [`CoreError::DuplicateName`] if a different child already has the
    ///   same access name
    /// - [`CoreError::InvalidOperation`] when adding a node to itself
    pub fn insert_child(&self, index: usize, child: &Arc<Node>) -> CoreResult<()> {
        let this = self.arc()?;
        if Arc::ptr_eq(&this, child) {
            return Err(CoreError::invalid_operation("a node cannot contain itself"));
        }
        let engine = self.engine()?;
        let mapping = self.mapping();
        let relation = mapping.subnode_relation().cloned();
        let persistent = self.state() != NodeState::Transient;
        let ignore = engine.ignores_subnode_change(self);

        if let Some(groupby) = relation.as_ref().and_then(|rel| rel.groupby()) {
            let value = child.get_string(groupby).unwrap_or_default();
            if persistent && !ignore {
                self.check_write_lock()?;
            }
            let group = engine
                .group_node(&this, &value, true)?
                .ok_or_else(|| CoreError::invalid_operation("group could not be created"))?;
            return group.insert_child(index, child);
        }

        if persistent {
            if !ignore {
                self.check_write_lock()?;
            }
            child.check_write_lock()?;
        }

        let access = relation
            .as_ref()
            .and_then(|rel| rel.get_accessname())
            .and_then(|acc| child.get_string(acc))
            .filter(|name| !name.is_empty());
        if let (Some(rel), Some(name)) = (&relation, &access) {
            if let Some(existing) = engine.get_node_by_relation(&this, name, rel)? {
                if !Arc::ptr_eq(&existing, child) {
                    return Err(CoreError::duplicate_name(name.clone(), self.label()));
                }
            }
        }

        if let Some(rel) = &relation {
            engine.set_constraints(&this, child, rel)?;
        }
        if persistent && child.state() == NodeState::Transient {
            child.make_persistable()?;
        }
        if persistent {
            self.mark_collection_owner(ignore)?;
        }
        if matches!(child.state(), NodeState::Clean | NodeState::Deleted) {
            child.mark_as(NodeState::Modified)?;
        }

        engine.materialize_children(&this)?;
        let handle = child.handle();
        self.with_children_mut(|list| {
            list.remove(&handle);
            list.insert(index, handle);
        });

        if let (Some(name), Some(key)) = (access, self.key()) {
            engine.register_key(Key::synthetic(key, name), child);
        }
        let needs_parent = child.parent_handle().map_or(true, |p| !p.is_persistent());
        if needs_parent {
            child.set_parent_handle(Some(self.handle()));
        }
        if !persistent || child.state() == NodeState::Transient {
            self.pin(child);
        }
        if persistent {
            self.register_subnode_change()?;
        }
        Ok(())
    }

    /// Detaches a child without deleting it.
    ///
    /// Removing the last child of a group node removes the group as well.
    ///
    /// # Errors
    ///
    /// Returns write-lock errors for this node or the child.
    pub fn remove_child(&self, child: &Arc<Node>) -> CoreResult<()> {
        let this = self.arc()?;
        let engine = self.engine()?;
        let mapping = self.mapping();
        let relation = mapping.subnode_relation().cloned();

        if let Some(groupby) = relation.as_ref().and_then(|rel| rel.groupby()) {
            let value = child.get_string(groupby).unwrap_or_default();
            if let Some(group) = engine.group_node(&this, &value, false)? {
                group.remove_child(child)?;
            }
            return Ok(());
        }

        let persistent = self.state() != NodeState::Transient;
        let ignore = engine.ignores_subnode_change(self);
        if persistent {
            if !ignore {
                self.check_write_lock()?;
            }
            child.check_write_lock()?;
        }

        engine.materialize_children(&this)?;
        let handle = child.handle();
        if self.with_children_mut(|list| list.remove(&handle)).is_none() {
            return Ok(());
        }
        self.unpin(child);

        let access = relation
            .as_ref()
            .and_then(|rel| rel.get_accessname())
            .and_then(|acc| child.get_string(acc));
        if let (Some(name), Some(key)) = (access, self.key()) {
            engine.evict_key(&Key::synthetic(key, name));
        }
        if child.parent_handle().is_some_and(|p| p.refers_to(self)) {
            child.set_parent_handle(None);
            if persistent && child.state() == NodeState::Clean {
                child.mark_as(NodeState::Modified)?;
            }
        }

        if persistent {
            self.mark_collection_owner(ignore)?;
            self.register_subnode_change()?;
        }

        if mapping.kind() == MappingKind::Group
            && self.with_children(|list| list.map_or(true, |l| l.is_empty()))
        {
            if let Some(home) = self.parent()? {
                home.release_group(&this)?;
            }
        }
        Ok(())
    }

    /// Drops an empty group node from this node's collection.
    fn release_group(&self, group: &Arc<Node>) -> CoreResult<()> {
        let engine = self.engine()?;
        let this = self.arc()?;
        let persistent = self.state() != NodeState::Transient;
        let ignore = engine.ignores_subnode_change(self);
        if persistent && !ignore {
            self.check_write_lock()?;
        }
        engine.materialize_children(&this)?;
        let handle = group.handle();
        self.with_children_mut(|list| list.remove(&handle));
        let value = group.name();
        self.unpin_group(&value);
        if let Some(key) = group.key() {
            engine.evict_key(&key);
        }
        group.invalidate_local();
        tracing::debug!(group = %value, parent = %self.label(), "released empty group");

        if persistent {
            self.mark_collection_owner(ignore)?;
            self.register_subnode_change()?;
        }
        Ok(())
    }

    /// Removes this node from its parent and deletes it along with the
    /// embedded-store children and properties it owns.
    ///
    /// # Errors
    ///
    /// Returns write-lock errors for any affected node.
    pub fn remove(&self) -> CoreResult<()> {
        let this = self.arc()?;
        self.check_write_lock()?;
        if let Some(parent) = self.parent()? {
            parent.remove_child(&this)?;
        }
        self.deep_remove()
    }

    pub(crate) fn deep_remove(&self) -> CoreResult<()> {
        let engine = self.engine()?;
        self.check_write_lock()?;

        for handle in self.reference_handles() {
            if let Some(node) = handle.resolve(&engine)? {
                if !node.mapping().is_relational()
                    && node.parent_handle().is_some_and(|p| p.refers_to(self))
                {
                    node.deep_remove()?;
                }
            }
        }

        if !self.mapping().is_relational() && !engine.ignores_subnode_change(self) {
            let owned: Vec<Handle> =
                self.with_children(|list| list.map(|l| l.handles()).unwrap_or_default());
            for handle in owned {
                if let Some(child) = handle.resolve(&engine)? {
                    if !child.mapping().is_relational()
                        && child.parent_handle().is_some_and(|p| p.refers_to(self))
                    {
                        child.deep_remove()?;
                    }
                }
            }
        }

        self.set_parent_handle(None);
        if let Some(key) = self.key() {
            engine.evict_key(&key);
        }
        self.mark_as(NodeState::Deleted)
    }

    /// Marks the node whose stored record holds this collection as
    /// modified. For group and virtual nodes that is the parent.
    fn mark_collection_owner(&self, ignore: bool) -> CoreResult<()> {
        if ignore {
            return Ok(());
        }
        match self.state() {
            NodeState::Clean | NodeState::Deleted => self.mark_as(NodeState::Modified),
            NodeState::Virtual => match self.parent()? {
                Some(owner) if owner.state() != NodeState::Transient => {
                    owner.check_write_lock()?;
                    owner.mark_collection_owner(false)
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Queues this node's collection for a change-counter bump at commit.
    /// Virtual and group nodes forward the change to their parent.
    pub(crate) fn register_subnode_change(&self) -> CoreResult<()> {
        if self.state() == NodeState::Transient {
            return Ok(());
        }
        let engine = self.engine()?;
        let Some(tx) = engine.current_transactor() else {
            return Ok(());
        };
        tx.visit_parent(&self.arc()?);
        if self.state() == NodeState::Virtual {
            if let Some(parent) = self.parent()? {
                parent.register_subnode_change()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CoreError;
    use crate::mapping::{Mapping, MappingRegistry, Relation};
    use crate::state::NodeState;
    use crate::Engine;
    use std::sync::Arc;

    fn engine() -> Engine {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::embedded("root")
                    .children(Relation::children("page").accessname("slug"))
                    .build(),
            )
            .unwrap();
        registry
            .register(
                Mapping::embedded("page")
                    .children(Relation::children("page"))
                    .build(),
            )
            .unwrap();
        Engine::builder().mappings(registry).build().unwrap()
    }

    fn page(engine: &Engine, slug: &str) -> Arc<crate::Node> {
        let page = engine.create_node("page").unwrap();
        page.set_string("slug", slug).unwrap();
        page
    }

    #[test]
    fn adding_to_persistent_parent_persists_child() {
        let engine = engine();
        let child = engine
            .transaction(|_| {
                let child = page(&engine, "about");
                engine.root()?.add_child(&child)?;
                assert_eq!(child.state(), NodeState::New);
                Ok(child)
            })
            .unwrap();
        assert_eq!(child.state(), NodeState::Clean);
        let root = engine.root().unwrap();
        assert_eq!(root.child_count().unwrap(), 1);
        let found = root.child("about").unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &child));
        assert!(Arc::ptr_eq(&child.parent().unwrap().unwrap(), &root));
    }

    #[test]
    fn transient_subtree_persists_with_its_root() {
        let engine = engine();
        engine
            .transaction(|_| {
                let outer = page(&engine, "outer");
                let inner = page(&engine, "inner");
                outer.add_child(&inner)?;
                assert_eq!(inner.state(), NodeState::Transient);
                engine.root()?.add_child(&outer)?;
                assert_eq!(inner.state(), NodeState::New);
                Ok(())
            })
            .unwrap();
        engine.clear_cache();
        let outer = engine.root().unwrap().child("outer").unwrap().unwrap();
        assert_eq!(outer.child_count().unwrap(), 1);
        let inner = outer.child_at(0).unwrap().unwrap();
        assert_eq!(inner.get_string("slug").as_deref(), Some("inner"));
    }

    #[test]
    fn duplicate_accessname_is_rejected() {
        let engine = engine();
        let result = engine.transaction(|_| {
            let root = engine.root()?;
            root.add_child(&page(&engine, "same"))?;
            root.add_child(&page(&engine, "same"))
        });
        assert!(matches!(result, Err(CoreError::DuplicateName { .. })));
        assert_eq!(engine.root().unwrap().child_count().unwrap(), 0);
    }

    #[test]
    fn node_cannot_contain_itself() {
        let engine = engine();
        let node = page(&engine, "loop");
        assert!(matches!(
            node.add_child(&node),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn insert_at_index_and_move() {
        let engine = engine();
        engine
            .transaction(|_| {
                let root = engine.root()?;
                let a = page(&engine, "a");
                let b = page(&engine, "b");
                let c = page(&engine, "c");
                root.add_child(&a)?;
                root.add_child(&b)?;
                root.insert_child(0, &c)?;
                assert_eq!(root.index_of(&c)?, Some(0));
                root.add_child(&c)?;
                assert_eq!(root.index_of(&c)?, Some(2));
                assert_eq!(root.child_count()?, 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn remove_deletes_record_and_detaches() {
        let engine = engine();
        let child = engine
            .transaction(|_| {
                let child = page(&engine, "gone");
                engine.root()?.add_child(&child)?;
                Ok(child)
            })
            .unwrap();
        let key = child.key().unwrap();
        engine.transaction(|_| child.remove()).unwrap();

        assert_eq!(child.state(), NodeState::Invalid);
        let root = engine.root().unwrap();
        assert_eq!(root.child_count().unwrap(), 0);
        assert!(root.child("gone").unwrap().is_none());
        assert!(engine.get_node_by_key(&key).unwrap().is_none());
    }

    #[test]
    fn remove_child_keeps_the_node() {
        let engine = engine();
        let child = engine
            .transaction(|_| {
                let child = page(&engine, "kept");
                engine.root()?.add_child(&child)?;
                Ok(child)
            })
            .unwrap();
        engine
            .transaction(|_| engine.root()?.remove_child(&child))
            .unwrap();
        assert_eq!(child.state(), NodeState::Clean);
        assert!(!engine.root().unwrap().contains(&child).unwrap());
    }
}
