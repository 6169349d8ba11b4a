//! Lazily resolving node references.

use crate::engine::Engine;
use crate::error::CoreResult;
use crate::key::Key;
use crate::node::Node;
use crate::state::NodeState;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, Weak};

enum Target {
    /// The node has no key yet. Only a weak link is kept; whoever attached
    /// the node pins it.
    Transient(Weak<Node>),
    /// The node is addressed by key; the weak link is only a shortcut.
    Persistent { key: Key, node: Weak<Node> },
}

/// A serializable reference to a node.
///
/// A handle never owns the node it points to. Resolution goes through the
/// engine and its caches, so a handle that outlives an eviction, or that was
/// deserialized in another process, stays valid for as long as its key does.
///
/// Clones share state: when a transient node receives its key, every handle
/// obtained from it switches to the key at once.
#[derive(Clone)]
pub struct Handle {
    target: Arc<RwLock<Target>>,
}

impl Handle {
    /// Creates a handle for a key without a resolved node.
    #[must_use]
    pub fn for_key(key: Key) -> Self {
        Self {
            target: Arc::new(RwLock::new(Target::Persistent {
                key,
                node: Weak::new(),
            })),
        }
    }

    pub(crate) fn bound(key: Option<Key>, node: Weak<Node>) -> Self {
        let target = match key {
            Some(key) => Target::Persistent { key, node },
            None => Target::Transient(node),
        };
        Self {
            target: Arc::new(RwLock::new(target)),
        }
    }

    /// Returns the key, or `None` while the node is transient.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        match &*self.target.read() {
            Target::Persistent { key, .. } => Some(key.clone()),
            Target::Transient(_) => None,
        }
    }

    /// Returns true once the handle is addressed by key.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(&*self.target.read(), Target::Persistent { .. })
    }

    pub(crate) fn become_persistent(&self, key: Key) {
        let mut target = self.target.write();
        let node = match &*target {
            Target::Transient(node) => node.clone(),
            Target::Persistent { node, .. } => node.clone(),
        };
        *target = Target::Persistent { key, node };
    }

    /// Returns the node if it is still in memory and valid, without any
    /// lookup.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<Node>> {
        let node = match &*self.target.read() {
            Target::Transient(node) => node.upgrade(),
            Target::Persistent { node, .. } => node.upgrade(),
        }?;
        (node.state() != NodeState::Invalid).then_some(node)
    }

    /// Resolves the handle to its node.
    ///
    /// Returns `Ok(None)` only if the engine confirms the node does not
    /// exist, or if a transient node has been dropped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the node has to be fetched and the fetch
    /// fails.
    pub fn resolve(&self, engine: &Engine) -> CoreResult<Option<Arc<Node>>> {
        if let Some(node) = self.cached() {
            return Ok(Some(node));
        }
        let Some(key) = self.key() else {
            return Ok(None);
        };
        let node = engine.get_node_by_key(&key)?;
        if let Some(node) = &node {
            if let Target::Persistent { node: weak, .. } = &mut *self.target.write() {
                *weak = Arc::downgrade(node);
            }
        }
        Ok(node)
    }

    /// Returns true if this handle refers to `node`.
    #[must_use]
    pub fn refers_to(&self, node: &Node) -> bool {
        let (key, ptr) = self.parts();
        if std::ptr::eq(ptr, node as *const Node) {
            return true;
        }
        key.is_some() && node.key() == key
    }

    fn parts(&self) -> (Option<Key>, *const Node) {
        match &*self.target.read() {
            Target::Transient(weak) => (None, weak.as_ptr()),
            Target::Persistent { key, node } => (Some(key.clone()), node.as_ptr()),
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.target, &other.target) {
            return true;
        }
        let (ka, pa) = self.parts();
        let (kb, pb) = other.parts();
        match (ka, kb) {
            (Some(ka), Some(kb)) => ka == kb,
            (None, None) => std::ptr::eq(pa, pb) && !pa.is_null(),
            _ => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.target.read() {
            Target::Persistent { key, .. } => write!(f, "Handle({key})"),
            Target::Transient(_) => f.write_str("Handle(transient)"),
        }
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.key() {
            Some(key) => key.serialize(serializer),
            None => Err(serde::ser::Error::custom(
                "cannot serialize a handle to a transient node",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Key::deserialize(deserializer).map(Handle::for_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_handles_compare_by_key() {
        let a = Handle::for_key(Key::embedded("7"));
        let b = Handle::for_key(Key::embedded("7"));
        assert_eq!(a, b);
        assert_ne!(a, Handle::for_key(Key::embedded("8")));
    }

    #[test]
    fn clones_follow_persistence() {
        let handle = Handle::bound(None, Weak::new());
        let clone = handle.clone();
        assert!(!clone.is_persistent());

        handle.become_persistent(Key::embedded("3"));
        assert!(clone.is_persistent());
        assert_eq!(clone.key(), Some(Key::embedded("3")));
    }

    #[test]
    fn serializes_as_key() {
        let handle = Handle::for_key(Key::relational("story", "9"));
        let mut bytes = Vec::new();
        ciborium::into_writer(&handle, &mut bytes).unwrap();
        let back: Handle = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn transient_handles_do_not_serialize() {
        let handle = Handle::bound(None, Weak::new());
        let mut bytes = Vec::new();
        assert!(ciborium::into_writer(&handle, &mut bytes).is_err());
    }
}
