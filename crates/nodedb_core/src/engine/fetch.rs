//! Node lookup.
//!
//! Lookup order is always: the current transaction's clean set, the shared
//! cache, then the backend. A freshly built node is offered to the cache
//! with [`NodeCache::adopt`](crate::cache::NodeCache::adopt), so concurrent
//! fetches of one key end up holding the same instance.

use super::Engine;
use crate::backend::query::{self, collection_conditions};
use crate::backend::{NodeBackend, NodeSeed, RelationalBackend};
use crate::cache::CacheEntry;
use crate::error::CoreResult;
use crate::hooks::Hook;
use crate::key::Key;
use crate::mapping::{LocalField, Mapping, Relation};
use crate::node::Node;
use crate::state::NodeState;
use crate::value::Value;
use std::sync::Arc;

impl Engine {
    /// Returns the node stored under `key`.
    ///
    /// Synthetic keys are resolved through their parent's relation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the fetch fails.
    pub fn get_node_by_key(&self, key: &Key) -> CoreResult<Option<Arc<Node>>> {
        self.ensure_open()?;
        let tx = self.current_transactor();
        if let Some(node) = tx.as_ref().and_then(|tx| tx.clean_node(key)) {
            if node.state() != NodeState::Invalid {
                self.0.stats.record_hit();
                return Ok(Some(node));
            }
        }
        if let Some(node) = self.0.cache.get(key).as_ref().and_then(CacheEntry::live_node) {
            self.0.stats.record_hit();
            tracing::trace!(key = %key, "cache hit");
            if let Some(tx) = &tx {
                tx.visit_clean(key.clone(), node);
            }
            return Ok(Some(Arc::clone(node)));
        }

        if let Key::Synthetic { parent, name } = key {
            let Some(home) = self.get_node_by_key(parent)? else {
                return Ok(None);
            };
            let mapping = home.mapping();
            let Some(rel) = mapping.relation_for_name(name) else {
                return Ok(None);
            };
            return self.get_node_by_relation(&home, name, rel);
        }

        self.0.stats.record_miss();
        tracing::trace!(key = %key, "cache miss");
        let Some((mapping, seed)) = self.fetch_seed(key)? else {
            return Ok(None);
        };
        let node = Node::from_seed(self.weak(), mapping, key.clone(), seed);
        Ok(Some(self.register_fetched(None, node)))
    }

    /// Returns the node reached from `home` through `rel` under `name`:
    /// a named child, a group, a virtual collection or a complex
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a query or fetch fails.
    pub fn get_node_by_relation(
        &self,
        home: &Arc<Node>,
        name: &str,
        rel: &Relation,
    ) -> CoreResult<Option<Arc<Node>>> {
        self.ensure_open()?;
        let Some(home_key) = home.key() else {
            return self.local_lookup(home, name, rel);
        };
        let key = if rel.is_complex_reference() {
            match self.complex_key(home, rel)? {
                Some(key) => key,
                None => return Ok(None),
            }
        } else if rel.create_on_demand() || rel.get_accessname().is_some() {
            Key::synthetic(home_key, name)
        } else {
            return Ok(None);
        };

        let tx = self.current_transactor();
        if let Some(node) = tx.as_ref().and_then(|tx| tx.clean_node(&key)) {
            if node.state() != NodeState::Invalid {
                self.0.stats.record_hit();
                return Ok(Some(node));
            }
        }
        match self.0.cache.get(&key) {
            Some(CacheEntry::Node(node)) if node.state() != NodeState::Invalid => {
                if self.still_related(home, name, rel, &node)? {
                    self.0.stats.record_hit();
                    if let Some(tx) = &tx {
                        tx.visit_clean(key, &node);
                    }
                    return Ok(Some(node));
                }
                tracing::trace!(key = %key, "stale relation hit");
            }
            Some(CacheEntry::Missing(Some(stamp)))
                if !rel.is_complex_reference() && stamp == home.stamp() =>
            {
                self.0.stats.record_negative_hit();
                return Ok(None);
            }
            _ => {}
        }

        self.0.stats.record_miss();
        match self.fetch_related(home, name, rel, &key)? {
            Some(node) => {
                let canonical = self.register_fetched(Some(key), Arc::clone(&node));
                if !Arc::ptr_eq(&canonical, &node) {
                    // Constraint checks compare against the creation time.
                    canonical.reset_created();
                }
                Ok(Some(canonical))
            }
            None => {
                if !rel.is_complex_reference() && self.0.context.is_active() {
                    self.0
                        .cache
                        .put(key, CacheEntry::Missing(Some(home.stamp())));
                }
                Ok(None)
            }
        }
    }

    /// Registers a freshly built node under its own key and, if given, a
    /// lookup key. Returns the canonical instance.
    ///
    /// Without an active request context nothing is cached and no hook
    /// runs; a live cached instance still wins over the new one.
    pub(crate) fn register_fetched(&self, lookup: Option<Key>, node: Arc<Node>) -> Arc<Node> {
        let Some(primary) = node.key() else {
            return node;
        };
        if !self.0.context.is_active() {
            return match self.0.cache.get(&primary).as_ref().and_then(CacheEntry::live_node) {
                Some(cached) => Arc::clone(cached),
                None => node,
            };
        }
        let canonical = self.0.cache.adopt(primary.clone(), Arc::clone(&node));
        let fresh = Arc::ptr_eq(&canonical, &node);
        if let Some(lookup) = lookup.filter(|k| *k != primary) {
            self.0
                .cache
                .put(lookup, CacheEntry::Node(Arc::clone(&canonical)));
        }
        if fresh {
            self.run_hook(&canonical, Hook::OnInit);
        }
        if let Some(tx) = self.current_transactor() {
            tx.visit_clean(primary, &canonical);
        }
        canonical
    }

    fn fetch_seed(
        &self,
        key: &Key,
    ) -> CoreResult<Option<(Arc<Mapping>, NodeSeed)>> {
        let registry = &self.0.registry;
        let started = std::time::Instant::now();
        let seed = match key.storage() {
            None => self.0.embedded.fetch(registry, key)?,
            Some(table) => {
                let Some(mapping) = registry.by_storage(table) else {
                    tracing::warn!(key = %key, "no mapping for table");
                    return Ok(None);
                };
                self.relational_for(&mapping)?.fetch(registry, key)?
            }
        };
        self.0.stats.record_fetch();
        tracing::debug!(
            key = %key,
            found = seed.is_some(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "node fetched"
        );
        Ok(seed)
    }

    /// Validates a cached relation hit against the current collection.
    fn still_related(
        &self,
        home: &Arc<Node>,
        name: &str,
        rel: &Relation,
        node: &Arc<Node>,
    ) -> CoreResult<bool> {
        if rel.groupby().is_some() {
            if home
                .pinned_group(name)
                .is_some_and(|group| Arc::ptr_eq(&group, node))
            {
                return Ok(true);
            }
            self.ensure_children(home)?;
            let handle = node.handle();
            return Ok(home.with_children(|list| list.is_some_and(|l| l.position(&handle).is_some())));
        }
        if let Some(access) = rel.get_accessname() {
            if node.state() != NodeState::Virtual
                && node.get_string(access).as_deref() != Some(name)
            {
                return Ok(false);
            }
            return self.check_constraints(home, node, rel);
        }
        Ok(true)
    }

    /// Returns true if `node` still satisfies `rel`'s constraints relative
    /// to `home`.
    pub(crate) fn check_constraints(
        &self,
        home: &Arc<Node>,
        node: &Arc<Node>,
        rel: &Relation,
    ) -> CoreResult<bool> {
        let Some(other) = self.0.registry.other_mapping(rel)? else {
            return Ok(true);
        };
        if !other.is_relational() {
            return Ok(true);
        }
        let anchor = query::anchor(home)?;
        for constraint in rel.constraints() {
            let Some(property) = other.property_for_column(&constraint.foreign_column) else {
                continue;
            };
            let expected = match &constraint.local {
                LocalField::Id => anchor.id(),
                LocalField::Property(p) => anchor.get_string(p),
            };
            let actual = match node.get(property) {
                Some(Value::Reference(handle)) => handle.key().map(|k| k.id()),
                Some(value) => value.as_string(),
                None => None,
            };
            if expected != actual {
                return Ok(false);
            }
        }
        if let Some(group) = rel.group_property() {
            if node.get_string(group) != Some(home.name()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Builds the composite key of a complex reference from `home`'s
    /// values. Returns `None` if one of them is missing.
    fn complex_key(&self, home: &Arc<Node>, rel: &Relation) -> CoreResult<Option<Key>> {
        let Some(other) = self.0.registry.other_mapping(rel)? else {
            return Ok(None);
        };
        let Some(table) = other.table() else {
            return Ok(None);
        };
        let mut parts = Vec::with_capacity(rel.constraints().len());
        for constraint in rel.constraints() {
            let value = match &constraint.local {
                LocalField::Id => home.id(),
                LocalField::Property(p) => home.get_string(p),
            };
            let Some(value) = value else {
                return Ok(None);
            };
            parts.push((constraint.foreign_column.clone(), value));
        }
        Ok(Some(Key::composite(table.table.clone(), parts)))
    }

    /// Builds or loads the node behind an uncached relation lookup.
    fn fetch_related(
        &self,
        home: &Arc<Node>,
        name: &str,
        rel: &Relation,
        key: &Key,
    ) -> CoreResult<Option<Arc<Node>>> {
        let mapping = home.mapping();
        if rel.is_virtual() {
            if let Some(view) = mapping.virtual_mapping(rel.name()).cloned() {
                return self.virtual_node(home, name, rel, view, key);
            }
        }
        if rel.groupby().is_some() {
            return self.group_node(home, name, true);
        }
        let Some(other) = self.0.registry.other_mapping(rel)? else {
            return Ok(None);
        };

        if rel.is_complex_reference() {
            let Some((mapping, seed)) = self.fetch_seed(key)? else {
                return Ok(None);
            };
            let primary = mapping.key_for(&seed.id);
            return Ok(Some(Node::from_seed(self.weak(), mapping, primary, seed)));
        }

        if other.is_relational() {
            let Some(table) = other.table() else {
                return Ok(None);
            };
            let Some(conditions) = collection_conditions(home, rel, &other)? else {
                return Ok(None);
            };
            let rows = self
                .relational_for(&other)?
                .select(query::lookup(table, &other, rel, conditions, name))?;
            if rows.len() > 1 {
                tracing::warn!(
                    home = %home.label(),
                    name,
                    rows = rows.len(),
                    "relation lookup matched several rows, using the first"
                );
            }
            let Some(row) = rows.first() else {
                return Ok(None);
            };
            let Some((mapping, seed)) = RelationalBackend::seed_from_row(&self.0.registry, &other, row)?
            else {
                return Ok(None);
            };
            let primary = mapping.key_for(&seed.id);
            let node = Node::from_seed(self.weak(), mapping, primary, seed);
            node.set_parent_if_none(home.handle());
            return Ok(Some(node));
        }

        self.ensure_children(home)?;
        match rel.get_accessname() {
            Some(access) => {
                let handles = home.with_children(|list| list.map(|l| l.handles()).unwrap_or_default());
                for handle in handles {
                    if let Some(child) = handle.resolve(self)? {
                        if child.get_string(access).as_deref() == Some(name) {
                            return Ok(Some(child));
                        }
                    }
                }
                Ok(None)
            }
            None => {
                let child_key = other.key_for(name);
                let contained =
                    home.with_children(|list| list.is_some_and(|l| l.contains_key(&child_key)));
                if contained {
                    self.get_node_by_key(&child_key)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Resolves a collection property to its node: a stored node when the
    /// members live in the embedded store, else a view over the query.
    fn virtual_node(
        &self,
        home: &Arc<Node>,
        name: &str,
        rel: &Relation,
        view: Arc<Mapping>,
        key: &Key,
    ) -> CoreResult<Option<Arc<Node>>> {
        if self.needs_persistence(&view) {
            if let Some(Value::Reference(handle)) = home.get(name) {
                if let Some(node) = handle.resolve(self)? {
                    return Ok(Some(node));
                }
            }
            if self.current_transactor().is_some() {
                let prototype = rel.get_prototype().unwrap_or(view.name()).to_string();
                let node = Node::transient(self.weak(), view, prototype);
                node.set_name(name);
                node.set_parent_handle(Some(home.handle()));
                home.set_node(name, &node)?;
                tracing::debug!(home = %home.label(), name, "collection node created");
                return Ok(Some(node));
            }
        }
        let prototype = rel.get_prototype().unwrap_or(view.name()).to_string();
        Ok(Some(Node::collection_view(
            self.weak(),
            view,
            key.clone(),
            name,
            prototype,
            home.handle(),
        )))
    }

    /// Lookup below a transient home, which has no key to build a cache key
    /// from. Only its local members are searched.
    fn local_lookup(
        &self,
        home: &Arc<Node>,
        name: &str,
        rel: &Relation,
    ) -> CoreResult<Option<Arc<Node>>> {
        if rel.groupby().is_some() {
            return Ok(home.pinned_group(name));
        }
        let Some(access) = rel.get_accessname() else {
            return Ok(None);
        };
        let handles = home.with_children(|list| list.map(|l| l.handles()).unwrap_or_default());
        for handle in handles {
            if let Some(child) = handle.resolve(self)? {
                if child.get_string(access).as_deref() == Some(name) {
                    return Ok(Some(child));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::mapping::{MappingRegistry, TableSpec};
    use crate::hooks::RequestContext;
    use nodedb_storage::{MemoryDatabase, Row};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A request context that can be switched off.
    #[derive(Default)]
    struct Switch(AtomicBool);

    impl RequestContext for Switch {
        fn is_active(&self) -> bool {
            !self.0.load(Ordering::SeqCst)
        }

        fn invoke(
            &self,
            _node: &Arc<Node>,
            _hook: Hook,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn engine(db: &Arc<MemoryDatabase>) -> Engine {
        engine_with(db, Arc::new(Switch::default()))
    }

    fn engine_with(db: &Arc<MemoryDatabase>, context: Arc<dyn RequestContext>) -> Engine {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::relational("story", TableSpec::new("main", "story", "id").name_column("slug"))
                    .property(Relation::primitive("slug", "slug"))
                    .property(Relation::primitive("title", "title"))
                    .build(),
            )
            .unwrap();
        registry
            .register(
                Mapping::embedded("root")
                    .children(Relation::children("story").accessname("slug"))
                    .build(),
            )
            .unwrap();
        Engine::builder()
            .mappings(registry)
            .connection("main", db.clone())
            .request_context(context)
            .build()
            .unwrap()
    }

    fn database() -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table("story", Some("id"));
        db.seed("story", Row::new().with("id", 1_i64).with("slug", "intro").with("title", "Hello"))
            .unwrap();
        db
    }

    #[test]
    fn key_fetch_returns_same_instance() {
        let db = database();
        let engine = engine(&db);
        let key = Key::relational("story", "1");
        let a = engine.get_node_by_key(&key).unwrap().unwrap();
        let b = engine.get_node_by_key(&key).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.get_string("title").as_deref(), Some("Hello"));
        assert_eq!(engine.stats().fetches, 1);
    }

    #[test]
    fn accessname_lookup_converges_with_primary_key() {
        let db = database();
        let engine = engine(&db);
        let root = engine.root().unwrap();
        let by_name = root.child("intro").unwrap().unwrap();
        let by_key = engine
            .get_node_by_key(&Key::relational("story", "1"))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&by_name, &by_key));
    }

    #[test]
    fn name_lookup_adopting_a_cached_node_resets_created() {
        let db = database();
        let engine = engine(&db);
        let root = engine.root().unwrap();
        let story = engine
            .get_node_by_key(&Key::relational("story", "1"))
            .unwrap()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        engine
            .transaction(|_| story.set_string("title", "Changed"))
            .unwrap();
        assert!(story.created() < story.last_modified());

        let by_name = root.child("intro").unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_name, &story));
        assert_eq!(story.created(), story.last_modified());
    }

    #[test]
    fn inactive_context_still_returns_the_cached_instance() {
        let db = database();
        let switch = Arc::new(Switch::default());
        let engine = engine_with(&db, switch.clone());
        let root = engine.root().unwrap();
        let story = engine
            .get_node_by_key(&Key::relational("story", "1"))
            .unwrap()
            .unwrap();

        switch.0.store(true, Ordering::SeqCst);
        let by_name = root.child("intro").unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_name, &story));
        assert!(root.child("other").unwrap().is_none());
    }

    #[test]
    fn miss_is_cached_until_collection_changes() {
        let db = database();
        let engine = engine(&db);
        let root = engine.root().unwrap();
        assert!(root.child("nope").unwrap().is_none());
        db.clear_log();
        assert!(root.child("nope").unwrap().is_none());
        assert!(db.statements().is_empty());
        assert_eq!(engine.stats().negative_hits, 1);

        root.bump_subnode_counter();
        assert!(root.child("nope").unwrap().is_none());
        assert_eq!(db.statements().len(), 1);
    }

    #[test]
    fn missing_key_is_none() {
        let db = database();
        let engine = engine(&db);
        assert!(engine
            .get_node_by_key(&Key::relational("story", "99"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn closed_engine_rejects_fetch() {
        let db = database();
        let engine = engine(&db);
        engine.shutdown().unwrap();
        assert!(matches!(
            engine.get_node_by_key(&Key::relational("story", "1")),
            Err(CoreError::EngineClosed)
        ));
    }
}
