//! Shared node cache.
//!
//! One process-wide LRU map from [`Key`] to node, split into independently
//! locked shards. Besides nodes, a shard can hold a negative entry recording
//! that a lookup found nothing; the entry carries the stamp of the
//! collection it was derived from so later collection changes make it stale
//! without an eviction sweep.
//!
//! Lock order: a shard lock may be held while a node's status is read.
//! Nothing holding a node lock may touch the cache.

use crate::key::Key;
use crate::node::Node;
use crate::state::NodeState;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Freshness stamp of a negative entry: which node's collection it came
/// from and that collection's change counter at caching time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    pub(crate) node: u64,
    pub(crate) counter: u64,
}

/// A cache occupant.
#[derive(Clone)]
pub(crate) enum CacheEntry {
    /// A canonical node.
    Node(Arc<Node>),
    /// A confirmed-absent lookup.
    Missing(Option<Stamp>),
}

impl CacheEntry {
    /// Returns the node if the entry holds a valid one.
    pub(crate) fn live_node(&self) -> Option<&Arc<Node>> {
        match self {
            CacheEntry::Node(node) if node.state() != NodeState::Invalid => Some(node),
            _ => None,
        }
    }
}

pub(crate) struct NodeCache {
    shards: Vec<Mutex<LruCache<Key, CacheEntry>>>,
}

impl NodeCache {
    pub(crate) fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = NonZeroUsize::new(capacity.div_ceil(shards).max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, key: &Key) -> &Mutex<LruCache<Key, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    pub(crate) fn get(&self, key: &Key) -> Option<CacheEntry> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Stores an entry and returns the previous occupant.
    pub(crate) fn put(&self, key: Key, entry: CacheEntry) -> Option<CacheEntry> {
        self.shard(&key).lock().put(key, entry)
    }

    /// Registers `node` under `key` unless a valid node already holds the
    /// key, in which case that node is kept and returned.
    ///
    /// Check and insert happen under one shard lock, so concurrent builders
    /// of the same key always converge on one instance.
    pub(crate) fn adopt(&self, key: Key, node: Arc<Node>) -> Arc<Node> {
        let mut shard = self.shard(&key).lock();
        if let Some(existing) = shard.get(&key).and_then(CacheEntry::live_node) {
            return Arc::clone(existing);
        }
        shard.put(key, CacheEntry::Node(Arc::clone(&node)));
        node
    }

    pub(crate) fn remove(&self, key: &Key) -> Option<CacheEntry> {
        self.shard(key).lock().pop(key)
    }

    /// Removes `key` only if it maps to `node`.
    pub(crate) fn remove_if(&self, key: &Key, node: &Arc<Node>) -> bool {
        let mut shard = self.shard(key).lock();
        let matches = matches!(shard.peek(key), Some(CacheEntry::Node(n)) if Arc::ptr_eq(n, node));
        if matches {
            shard.pop(key);
        }
        matches
    }

    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn put_returns_prior_occupant() {
        let cache = NodeCache::new(16, 2);
        let key = Key::embedded("1");
        let a = Node::for_test(key.clone());
        assert!(cache.put(key.clone(), CacheEntry::Node(a)).is_none());
        let prior = cache.put(key.clone(), CacheEntry::Missing(None));
        assert!(matches!(prior, Some(CacheEntry::Node(_))));
        assert!(matches!(cache.get(&key), Some(CacheEntry::Missing(None))));
    }

    #[test]
    fn adopt_keeps_the_first_valid_node() {
        let cache = NodeCache::new(16, 4);
        let key = Key::embedded("7");
        let first = Node::for_test(key.clone());
        let second = Node::for_test(key.clone());

        let kept = cache.adopt(key.clone(), Arc::clone(&first));
        assert!(Arc::ptr_eq(&kept, &first));
        let kept = cache.adopt(key.clone(), Arc::clone(&second));
        assert!(Arc::ptr_eq(&kept, &first));

        first.invalidate_local();
        let kept = cache.adopt(key, Arc::clone(&second));
        assert!(Arc::ptr_eq(&kept, &second));
    }

    #[test]
    fn concurrent_adopt_converges() {
        let cache = NodeCache::new(64, 8);
        let key = Key::relational("story", "1");
        let winners: Vec<Arc<Node>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = &cache;
                    let key = key.clone();
                    s.spawn(move || cache.adopt(key.clone(), Node::for_test(key)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(winners.iter().all(|n| Arc::ptr_eq(n, &winners[0])));
    }

    #[test]
    fn lru_capacity_is_respected() {
        let cache = NodeCache::new(4, 1);
        for i in 0..10 {
            cache.put(Key::embedded(i.to_string()), CacheEntry::Missing(None));
        }
        assert_eq!(cache.len(), 4);
        assert!(cache.get(&Key::embedded("0")).is_none());
        assert!(cache.get(&Key::embedded("9")).is_some());
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn remove_if_only_removes_matching_node() {
        let cache = NodeCache::new(8, 1);
        let key = Key::embedded("3");
        let a = Node::for_test(key.clone());
        let b = Node::for_test(key.clone());
        cache.put(key.clone(), CacheEntry::Node(Arc::clone(&a)));
        assert!(!cache.remove_if(&key, &b));
        assert!(cache.remove_if(&key, &a));
        assert!(cache.remove(&key).is_none());
    }
}
