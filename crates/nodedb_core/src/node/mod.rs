//! Nodes, the unit of persistence.
//!
//! A [`Node`] carries identity, a lifecycle state, typed properties and an
//! ordered child collection. Nodes are always handled through `Arc<Node>`;
//! the engine's cache holds the canonical instance for each key.
//!
//! Each node has two locks: a status mutex (state and write-lock owner) and
//! a data lock (everything else). They are never held at the same time, and
//! neither is held while calling into the engine or another node.

mod persist;
mod props;
mod tree;

pub(crate) use persist::NodeSnapshot;

use crate::backend::NodeSeed;
use crate::cache::Stamp;
use crate::children::{ChildList, LoadStamp};
use crate::engine::{Engine, Shared};
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::key::Key;
use crate::mapping::{Mapping, MappingKind};
use crate::state::NodeState;
use crate::transaction::Transactor;
use crate::types::{now_millis, TransactionId};
use crate::value::{Property, Value};
use nodedb_storage::Condition;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct LockHolder {
    id: TransactionId,
    transactor: Weak<Transactor>,
}

struct Status {
    state: NodeState,
    lock: Option<LockHolder>,
}

pub(crate) struct NodeData {
    pub(crate) key: Option<Key>,
    pub(crate) id: Option<String>,
    pub(crate) name: String,
    pub(crate) prototype: String,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) handle: Handle,
    /// A row or record exists in the backing store.
    pub(crate) persisted: bool,
    pub(crate) created: i64,
    pub(crate) last_modified: i64,
    pub(crate) parent: Option<Handle>,
    pub(crate) properties: BTreeMap<String, Property>,
    pub(crate) children: Option<ChildList>,
    /// Committed child-collection changes.
    pub(crate) counter: u64,
    pub(crate) subnode_filter: Option<Vec<Condition>>,
    pub(crate) groups: BTreeMap<String, Arc<Node>>,
    /// Scratch node; rebuilt once every holder has dropped it.
    pub(crate) cache_node: Weak<Node>,
    /// Transient nodes reachable only through this node.
    pub(crate) pinned: Vec<Arc<Node>>,
}

/// A persistent object.
pub struct Node {
    this: Weak<Node>,
    engine: Weak<Shared>,
    serial: u64,
    status: Mutex<Status>,
    data: RwLock<NodeData>,
}

impl Node {
    fn build(
        engine: Weak<Shared>,
        state: NodeState,
        key: Option<Key>,
        init: impl FnOnce(Handle) -> NodeData,
    ) -> Arc<Node> {
        Arc::new_cyclic(|this| {
            let handle = Handle::bound(key, this.clone());
            Node {
                this: this.clone(),
                engine,
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                status: Mutex::new(Status { state, lock: None }),
                data: RwLock::new(init(handle)),
            }
        })
    }

    fn blank(
        mapping: Arc<Mapping>,
        prototype: String,
        key: Option<Key>,
        id: Option<String>,
        name: String,
        handle: Handle,
    ) -> NodeData {
        let now = now_millis();
        NodeData {
            key,
            id,
            name,
            prototype,
            mapping,
            handle,
            persisted: false,
            created: now,
            last_modified: now,
            parent: None,
            properties: BTreeMap::new(),
            children: None,
            counter: 0,
            subnode_filter: None,
            groups: BTreeMap::new(),
            cache_node: Weak::new(),
            pinned: Vec::new(),
        }
    }

    /// A node with no key, invisible to the shared cache.
    pub(crate) fn transient(
        engine: Weak<Shared>,
        mapping: Arc<Mapping>,
        prototype: String,
    ) -> Arc<Node> {
        Self::build(engine, NodeState::Transient, None, |handle| {
            Self::blank(mapping, prototype, None, None, String::new(), handle)
        })
    }

    /// A node for a row or record that does not exist yet but whose key is
    /// fixed, such as the root.
    pub(crate) fn keyed(
        engine: Weak<Shared>,
        mapping: Arc<Mapping>,
        key: Key,
        prototype: String,
    ) -> Arc<Node> {
        let id = key.id();
        Self::build(engine, NodeState::Clean, Some(key.clone()), |handle| {
            Self::blank(mapping, prototype, Some(key), Some(id.clone()), id, handle)
        })
    }

    /// A node rebuilt from stored data.
    pub(crate) fn from_seed(
        engine: Weak<Shared>,
        mapping: Arc<Mapping>,
        key: Key,
        seed: NodeSeed,
    ) -> Arc<Node> {
        let group_mapping = mapping.group_mapping().cloned();
        let records = seed.children;
        let node = Self::build(engine.clone(), NodeState::Clean, Some(key.clone()), |handle| {
            let mut data = Self::blank(
                mapping,
                seed.prototype,
                Some(key.clone()),
                Some(seed.id),
                seed.name,
                handle,
            );
            data.persisted = true;
            data.created = seed.created;
            data.last_modified = seed.last_modified;
            data.parent = seed.parent.map(Handle::for_key);
            data.properties = seed.properties;
            data
        });

        if let Some(records) = records {
            let mut handles = Vec::with_capacity(records.len());
            let mut groups: BTreeMap<String, Arc<Node>> = BTreeMap::new();
            for record in records {
                let child = Handle::for_key(record.key);
                match (record.group, &group_mapping) {
                    (Some(value), Some(gm)) => {
                        let group = groups.entry(value.clone()).or_insert_with(|| {
                            let group = Node::new_group(
                                engine.clone(),
                                Arc::clone(gm),
                                Some(Key::synthetic(key.clone(), value.clone())),
                                &value,
                                node.handle(),
                            );
                            handles.push(group.handle());
                            group
                        });
                        group.with_children_mut(|list| list.insert(usize::MAX, child));
                    }
                    _ => handles.push(child),
                }
            }
            let mut data = node.data.write();
            data.children = Some(ChildList::flat(handles, LoadStamp::default()));
            data.groups = groups;
        }
        node
    }

    /// A group node: one distinct value of a group-by property.
    pub(crate) fn new_group(
        engine: Weak<Shared>,
        mapping: Arc<Mapping>,
        key: Option<Key>,
        value: &str,
        parent: Handle,
    ) -> Arc<Node> {
        let prototype = mapping
            .subnode_relation()
            .and_then(|rel| rel.get_prototype())
            .unwrap_or(mapping.name())
            .to_string();
        let state = if key.is_some() {
            NodeState::Virtual
        } else {
            NodeState::Transient
        };
        Self::build(engine, state, key.clone(), |handle| {
            let mut data = Self::blank(
                mapping,
                prototype,
                key,
                Some(value.to_string()),
                value.to_string(),
                handle,
            );
            data.parent = Some(parent);
            data.properties.insert(
                "groupname".to_string(),
                Property::loaded("groupname", Value::from(value)),
            );
            data
        })
    }

    /// A virtual collection node below `parent`.
    pub(crate) fn collection_view(
        engine: Weak<Shared>,
        mapping: Arc<Mapping>,
        key: Key,
        name: &str,
        prototype: String,
        parent: Handle,
    ) -> Arc<Node> {
        Self::build(engine, NodeState::Virtual, Some(key.clone()), |handle| {
            let mut data = Self::blank(
                mapping,
                prototype,
                Some(key),
                Some(name.to_string()),
                name.to_string(),
                handle,
            );
            data.parent = Some(parent);
            data
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(key: Key) -> Arc<Node> {
        let mapping = Arc::new(Mapping::embedded("test").build());
        Self::keyed(Weak::new(), mapping, key, "test".to_string())
    }

    pub(crate) fn arc(&self) -> CoreResult<Arc<Node>> {
        self.this
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation("node is being dropped"))
    }

    pub(crate) fn engine(&self) -> CoreResult<Engine> {
        self.engine
            .upgrade()
            .map(Engine::from_shared)
            .ok_or(CoreError::EngineClosed)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns the key, or `None` while the node is transient.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        self.data.read().key.clone()
    }

    /// Returns the id.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.data.read().id.clone()
    }

    /// Returns the display name: the explicit name, or else the id.
    #[must_use]
    pub fn name(&self) -> String {
        let data = self.data.read();
        if data.name.is_empty() {
            data.id.clone().unwrap_or_default()
        } else {
            data.name.clone()
        }
    }

    /// Sets the display name of a node that has no name column.
    pub fn set_name(&self, name: &str) {
        self.data.write().name = name.to_string();
    }

    /// Returns the prototype name.
    #[must_use]
    pub fn prototype(&self) -> String {
        self.data.read().prototype.clone()
    }

    /// Returns the mapping.
    #[must_use]
    pub fn mapping(&self) -> Arc<Mapping> {
        Arc::clone(&self.data.read().mapping)
    }

    /// Returns a handle to this node.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.data.read().handle.clone()
    }

    /// Returns the creation time in milliseconds.
    #[must_use]
    pub fn created(&self) -> i64 {
        self.data.read().created
    }

    /// Returns the last modification time in milliseconds.
    #[must_use]
    pub fn last_modified(&self) -> i64 {
        self.data.read().last_modified
    }

    /// Returns the child collection's change counter. It advances by one for
    /// every committed transaction that changed the collection.
    #[must_use]
    pub fn last_subnode_change(&self) -> u64 {
        self.data.read().counter
    }

    /// Returns the transaction holding this node's write lock.
    #[must_use]
    pub fn lock_holder(&self) -> Option<TransactionId> {
        self.status.lock().lock.as_ref().map(|h| h.id)
    }

    pub(crate) fn label(&self) -> String {
        let data = self.data.read();
        match &data.key {
            Some(key) => key.to_string(),
            None => format!("transient {}", data.prototype),
        }
    }

    pub(crate) fn is_persisted(&self) -> bool {
        self.data.read().persisted
    }

    pub(crate) fn mark_persisted(&self, persisted: bool) {
        self.data.write().persisted = persisted;
    }

    pub(crate) fn stamp(&self) -> Stamp {
        Stamp {
            node: self.serial,
            counter: self.data.read().counter,
        }
    }

    pub(crate) fn bump_subnode_counter(&self) {
        self.data.write().counter += 1;
    }

    /// Resets `created` to `last_modified`, for nodes adopted under a
    /// second key.
    pub(crate) fn reset_created(&self) {
        let mut data = self.data.write();
        data.created = data.last_modified;
    }

    pub(crate) fn parent_handle(&self) -> Option<Handle> {
        self.data.read().parent.clone()
    }

    pub(crate) fn set_parent_handle(&self, parent: Option<Handle>) {
        self.data.write().parent = parent;
    }

    pub(crate) fn set_parent_if_none(&self, parent: Handle) {
        let mut data = self.data.write();
        if data.parent.is_none() {
            data.parent = Some(parent);
        }
    }

    pub(crate) fn subnode_filter(&self) -> Option<Vec<Condition>> {
        self.data.read().subnode_filter.clone()
    }

    pub(crate) fn with_children<R>(&self, f: impl FnOnce(Option<&ChildList>) -> R) -> R {
        f(self.data.read().children.as_ref())
    }

    /// Runs `f` on the child list, creating an empty local list first if
    /// there is none.
    pub(crate) fn with_children_mut<R>(&self, f: impl FnOnce(&mut ChildList) -> R) -> R {
        let mut data = self.data.write();
        let counter = data.counter;
        let list = data.children.get_or_insert_with(|| {
            ChildList::flat(
                Vec::new(),
                LoadStamp {
                    clock: 0,
                    counter,
                },
            )
        });
        f(list)
    }

    pub(crate) fn install_children(&self, list: ChildList) {
        self.data.write().children = Some(list);
    }

    pub(crate) fn mark_children_stale(&self) {
        if let Some(list) = self.data.write().children.as_mut() {
            list.mark_stale();
        }
    }

    pub(crate) fn pinned_group(&self, name: &str) -> Option<Arc<Node>> {
        self.data.read().groups.get(name).cloned()
    }

    pub(crate) fn pin_group(&self, name: &str, group: &Arc<Node>) {
        self.data
            .write()
            .groups
            .insert(name.to_string(), Arc::clone(group));
    }

    pub(crate) fn unpin_group(&self, name: &str) -> Option<Arc<Node>> {
        self.data.write().groups.remove(name)
    }

    pub(crate) fn groups(&self) -> Vec<(String, Arc<Node>)> {
        self.data
            .read()
            .groups
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub(crate) fn pin(&self, node: &Arc<Node>) {
        let mut data = self.data.write();
        if !data.pinned.iter().any(|n| Arc::ptr_eq(n, node)) {
            data.pinned.push(Arc::clone(node));
        }
    }

    pub(crate) fn unpin(&self, node: &Arc<Node>) {
        self.data.write().pinned.retain(|n| !Arc::ptr_eq(n, node));
    }

    /// Sets an explicit filter for the relational child collection,
    /// replacing the conditions derived from the relation. `None` restores
    /// them.
    pub fn set_subnode_filter(&self, filter: Option<Vec<Condition>>) {
        let mut data = self.data.write();
        data.subnode_filter = filter;
        if let Some(list) = data.children.as_mut() {
            list.mark_stale();
        }
    }

    /// Returns the scratch node for transient per-node data. It is held
    /// weakly, never persisted, and recreated empty after it was dropped.
    #[must_use]
    pub fn cache_node(&self) -> Arc<Node> {
        let mut data = self.data.write();
        if let Some(node) = data.cache_node.upgrade() {
            return node;
        }
        let node = Node::transient(
            self.engine.clone(),
            Arc::clone(&data.mapping),
            data.prototype.clone(),
        );
        data.cache_node = Arc::downgrade(&node);
        node
    }

    /// Drops the scratch node.
    pub fn clear_cache_node(&self) {
        self.data.write().cache_node = Weak::new();
    }

    /// Returns true for nodes of group or virtual collection mappings.
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.mapping().kind() != MappingKind::Normal
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.label();
        let prototype = self.prototype();
        let state = self.state();
        f.debug_struct("Node")
            .field("key", &label)
            .field("prototype", &prototype)
            .field("state", &state)
            .finish()
    }
}
