//! Child collections.
//!
//! Collections backed by the embedded store are part of the owner's record
//! and are never reloaded. Collections backed by a relational table are
//! query results: they are loaded on first use and reloaded once the
//! owner's change counter or the member mapping's data-change clock moves
//! past the stamp taken at load time.

use super::Engine;
use crate::backend::query::{self, collection_conditions};
use crate::backend::RelationalBackend;
use crate::cache::CacheEntry;
use crate::children::{ChildList, LoadStamp};
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::key::Key;
use crate::mapping::{LocalField, Mapping, Relation};
use crate::node::Node;
use crate::state::NodeState;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

impl Engine {
    /// Loads `home`'s collection if it is query-backed and missing or
    /// stale.
    pub(crate) fn ensure_children(&self, home: &Arc<Node>) -> CoreResult<()> {
        if home.state() == NodeState::Transient || !self.ignores_subnode_change(home) {
            return Ok(());
        }
        let mapping = home.mapping();
        let Some(rel) = mapping.subnode_relation() else {
            return Ok(());
        };
        let Some(other) = self.0.registry.other_mapping(rel)? else {
            return Ok(());
        };
        let counter = home.last_subnode_change();
        let data_change = other.last_data_change();
        let reload = home.with_children(|list| {
            list.map_or(true, |l| l.needs_reload(counter, data_change))
        });
        if reload {
            self.load_children(home, rel, &other)?;
        }
        Ok(())
    }

    fn load_children(&self, home: &Arc<Node>, rel: &Relation, other: &Arc<Mapping>) -> CoreResult<()> {
        let stamp = LoadStamp {
            clock: self.clock(),
            counter: home.last_subnode_change(),
        };
        let started = std::time::Instant::now();
        let Some(table) = other.table() else {
            return Ok(());
        };
        let Some(conditions) = collection_conditions(home, rel, other)? else {
            home.install_children(ChildList::flat(Vec::new(), stamp));
            return Ok(());
        };
        let backend = self.relational_for(other)?;

        let list = if let Some(groupby) = rel.groupby() {
            let home_key = home
                .key()
                .ok_or_else(|| CoreError::invalid_operation("grouped collection without key"))?;
            let column = other.column_for_property(groupby).unwrap_or(groupby);
            let rows = backend.select(query::group_values(table, column, rel, conditions))?;
            let handles = rows
                .iter()
                .map(|row| {
                    let value = row.text(column).unwrap_or_default();
                    Handle::for_key(Key::synthetic(home_key.clone(), value))
                })
                .collect();
            ChildList::flat(handles, stamp)
        } else if rel.is_lazy() {
            let total = backend.count(query::count(table, conditions))?;
            let total = rel.get_max_size().map_or(total, |max| total.min(max));
            ChildList::segmented(total, stamp)
        } else if rel.is_aggressive() {
            let rows = backend.select(query::child_rows(table, rel, conditions))?;
            let mut handles = Vec::with_capacity(rows.len());
            for row in &rows {
                let Some((mapping, seed)) = RelationalBackend::seed_from_row(&self.0.registry, other, row)?
                else {
                    continue;
                };
                let key = mapping.key_for(&seed.id);
                let node = self.register_fetched(None, Node::from_seed(self.weak(), mapping, key, seed));
                node.set_parent_if_none(home.handle());
                handles.push(node.handle());
            }
            ChildList::flat(handles, stamp)
        } else {
            let rows = backend.select(query::child_ids(table, rel, conditions))?;
            let handles = rows
                .iter()
                .filter_map(|row| row.text(&table.id_column))
                .map(|id| Handle::for_key(other.key_for(&id)))
                .collect();
            ChildList::flat(handles, stamp)
        };

        tracing::debug!(
            home = %home.label(),
            members = list.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "collection loaded"
        );
        home.install_children(list);
        Ok(())
    }

    /// Loads the windows of a segmented collection that overlap
    /// `start..start + length` and are not loaded yet.
    pub(crate) fn load_windows(&self, home: &Arc<Node>, start: usize, length: usize) -> CoreResult<()> {
        let window = self.0.config.segment_size.max(1);
        let starts = home.with_children(|list| {
            list.map(|l| l.missing_windows(start, length, window))
                .unwrap_or_default()
        });
        if starts.is_empty() {
            return Ok(());
        }
        let mapping = home.mapping();
        let Some(rel) = mapping.subnode_relation() else {
            return Ok(());
        };
        let Some(other) = self.0.registry.other_mapping(rel)? else {
            return Ok(());
        };
        let Some(table) = other.table() else {
            return Ok(());
        };
        let Some(conditions) = collection_conditions(home, rel, &other)? else {
            return Ok(());
        };
        let backend = self.relational_for(&other)?;
        for at in starts {
            let select = query::child_ids(table, rel, conditions.clone())
                .offset(at)
                .limit(window);
            let handles: Vec<Handle> = backend
                .select(select)?
                .iter()
                .filter_map(|row| row.text(&table.id_column))
                .map(|id| Handle::for_key(other.key_for(&id)))
                .collect();
            tracing::trace!(home = %home.label(), at, loaded = handles.len(), "window loaded");
            home.with_children_mut(|list| list.fill(at, handles));
        }
        Ok(())
    }

    /// Loads every window and turns the collection into a plain list, as
    /// needed before local edits.
    pub(crate) fn materialize_children(&self, home: &Arc<Node>) -> CoreResult<()> {
        self.ensure_children(home)?;
        let (segmented, total) = home.with_children(|list| {
            list.map_or((false, 0), |l| (!l.is_fully_loaded(), l.len()))
        });
        if segmented {
            self.load_windows(home, 0, total)?;
        }
        home.with_children_mut(|list| list.flatten());
        Ok(())
    }

    /// Resolves a member handle and records `home` as the member's parent
    /// if it has none.
    pub(crate) fn resolve_child(&self, home: &Arc<Node>, handle: &Handle) -> CoreResult<Option<Arc<Node>>> {
        let node = handle.resolve(self)?;
        if let Some(node) = &node {
            node.set_parent_if_none(home.handle());
        }
        Ok(node)
    }

    /// Fetches the uncached relational members among `handles` with one
    /// `IN` query per table and window. Failures are logged; the members
    /// are then fetched one by one on access.
    pub(crate) fn prefetch_handles(&self, home: &Arc<Node>, handles: &[Handle]) {
        let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for handle in handles {
            if handle.cached().is_some() {
                continue;
            }
            let Some(Key::Primary {
                storage: Some(table),
                id,
            }) = handle.key()
            else {
                continue;
            };
            let key = Key::relational(table.clone(), id.clone());
            if self.0.cache.get(&key).as_ref().and_then(|e| e.live_node()).is_some() {
                continue;
            }
            wanted.entry(table).or_default().push(id);
        }
        for (table, ids) in wanted {
            if let Err(err) = self.prefetch_table(home, &table, &ids) {
                tracing::warn!(home = %home.label(), table = %table, error = %err, "prefetch failed");
            }
        }
    }

    fn prefetch_table(&self, home: &Arc<Node>, table: &str, ids: &[String]) -> CoreResult<()> {
        let Some(mapping) = self.0.registry.by_storage(table) else {
            return Ok(());
        };
        let Some(spec) = mapping.table() else {
            return Ok(());
        };
        let backend = self.relational_for(&mapping)?;
        let access = home
            .mapping()
            .subnode_relation()
            .and_then(|rel| rel.get_accessname().map(str::to_string));
        for chunk in ids.chunks(self.0.config.segment_size.max(1)) {
            let rows = backend.select(query::by_ids(spec, chunk))?;
            self.0.stats.record_prefetch();
            for row in &rows {
                let Some((m, seed)) = RelationalBackend::seed_from_row(&self.0.registry, &mapping, row)?
                else {
                    continue;
                };
                let key = m.key_for(&seed.id);
                let node = self.register_fetched(None, Node::from_seed(self.weak(), m, key, seed));
                node.set_parent_if_none(home.handle());
                if let (Some(access), Some(home_key)) = (&access, home.key()) {
                    if let Some(name) = node.get_string(access) {
                        if self.0.context.is_active() {
                            self.0.cache.put(
                                Key::synthetic(home_key, name),
                                CacheEntry::Node(Arc::clone(&node)),
                            );
                        }
                    }
                }
            }
            tracing::debug!(table, requested = chunk.len(), found = rows.len(), "prefetched");
        }
        Ok(())
    }

    /// Returns the group node of `home` for `value`. With `create` set, a
    /// missing group is made and added to `home`'s collection.
    pub(crate) fn group_node(
        &self,
        home: &Arc<Node>,
        value: &str,
        create: bool,
    ) -> CoreResult<Option<Arc<Node>>> {
        let mapping = home.mapping();
        let Some(group_mapping) = mapping.group_mapping().cloned() else {
            return Ok(None);
        };
        if let Some(group) = home.pinned_group(value) {
            return Ok(Some(group));
        }
        let key = home.key().map(|k| Key::synthetic(k, value));
        let query_backed = self.ignores_subnode_change(home) && home.state() != NodeState::Transient;

        if query_backed {
            self.ensure_children(home)?;
        }
        let listed = key.as_ref().is_some_and(|key| {
            home.with_children(|list| list.is_some_and(|l| l.contains_key(key)))
        });
        if let Some(key) = &key {
            if listed {
                if let Some(group) = self.0.cache.get(key).as_ref().and_then(|e| e.live_node()) {
                    return Ok(Some(Arc::clone(group)));
                }
            }
        }
        if !listed && !create {
            return Ok(None);
        }

        let group = Node::new_group(self.weak(), group_mapping, key.clone(), value, home.handle());
        if !query_backed {
            home.pin_group(value, &group);
        }
        if !listed {
            if query_backed {
                self.materialize_children(home)?;
            }
            let handle = group.handle();
            home.with_children_mut(|list| {
                if list.position(&handle).is_none() {
                    list.insert(usize::MAX, handle);
                }
            });
            tracing::debug!(home = %home.label(), group = value, "group created");
        }
        let group = match key {
            Some(key) if self.0.context.is_active() => self.0.cache.adopt(key, group),
            _ => group,
        };
        Ok(Some(group))
    }

    /// Writes the values `rel` constrains onto a new member of `home`'s
    /// collection, so the member matches the collection's query.
    pub(crate) fn set_constraints(&self, home: &Arc<Node>, child: &Arc<Node>, rel: &Relation) -> CoreResult<()> {
        let Some(other) = self.0.registry.other_mapping(rel)? else {
            return Ok(());
        };
        let anchor = query::anchor(home)?;
        for constraint in rel.constraints() {
            let Some(property) = other.property_for_column(&constraint.foreign_column) else {
                continue;
            };
            let value = match &constraint.local {
                LocalField::Id => {
                    let is_reference = other
                        .property_relation(property)
                        .is_some_and(Relation::is_reference);
                    match anchor.id() {
                        Some(_) if is_reference => Some(Value::Reference(anchor.handle())),
                        Some(id) => Some(Value::String(id)),
                        None => None,
                    }
                }
                LocalField::Property(local) => anchor.get(local),
            };
            let Some(value) = value else { continue };
            if child.get(property).as_ref() != Some(&value) {
                child.set_value(property, value)?;
            }
        }
        if let Some(group) = rel.group_property() {
            let value = Value::from(home.name());
            if child.get(group).as_ref() != Some(&value) {
                child.set_value(group, value)?;
            }
        }
        Ok(())
    }

    /// Counts the members of the collection `rel` defines on `home`
    /// without loading it.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the count query fails.
    pub fn count_children(&self, home: &Arc<Node>, rel: &Relation) -> CoreResult<usize> {
        self.ensure_open()?;
        let other = self.0.registry.other_mapping(rel)?;
        match other.as_ref().and_then(|o| o.table().map(|t| (o, t))) {
            Some((other, table)) if home.state() != NodeState::Transient => {
                let Some(conditions) = collection_conditions(home, rel, other)? else {
                    return Ok(0);
                };
                let total = self
                    .relational_for(other)?
                    .count(query::count(table, conditions))?;
                Ok(rel.get_max_size().map_or(total, |max| total.min(max)))
            }
            _ => {
                self.ensure_children(home)?;
                Ok(home.with_children(|list| list.map_or(0, |l| l.len())))
            }
        }
    }

    /// Returns the access names of `home`'s members, or their ids if the
    /// collection has no access name.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a query or fetch fails.
    pub fn child_names(&self, home: &Arc<Node>, rel: &Relation) -> CoreResult<Vec<String>> {
        self.ensure_open()?;
        let other = self.0.registry.other_mapping(rel)?;
        if let (Some(other), Some(access)) = (&other, rel.get_accessname()) {
            if let Some(table) = other.table().filter(|_| home.state() != NodeState::Transient) {
                let Some(conditions) = collection_conditions(home, rel, other)? else {
                    return Ok(Vec::new());
                };
                let column = other.column_for_property(access).unwrap_or(access);
                let select = query::child_rows(table, rel, conditions)
                    .project(nodedb_storage::Projection::Column(column.to_string()));
                let rows = self.relational_for(other)?.select(select)?;
                return Ok(rows.iter().filter_map(|row| row.text(column)).collect());
            }
        }

        self.materialize_children(home)?;
        let handles = home.with_children(|list| list.map(|l| l.handles()).unwrap_or_default());
        let mut names = Vec::with_capacity(handles.len());
        for handle in handles {
            match rel.get_accessname() {
                Some(access) => {
                    if let Some(name) = handle.resolve(self)?.and_then(|n| n.get_string(access)) {
                        names.push(name);
                    }
                }
                None => names.extend(handle.key().map(|k| k.id())),
            }
        }
        Ok(names)
    }

    /// Fetches the uncached members among `handles` in batches.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EngineClosed`] after shutdown. Query failures
    /// are logged, not returned.
    pub fn prefetch(&self, home: &Arc<Node>, handles: &[Handle]) -> CoreResult<()> {
        self.ensure_open()?;
        self.prefetch_handles(home, handles);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingRegistry, TableSpec};
    use crate::EngineConfig;
    use nodedb_storage::{MemoryDatabase, Row};

    fn engine(db: &Arc<MemoryDatabase>, children: Relation) -> Engine {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::relational("story", TableSpec::new("main", "story", "id"))
                    .property(Relation::primitive("title", "title"))
                    .property(Relation::primitive("day", "day"))
                    .build(),
            )
            .unwrap();
        registry
            .register(Mapping::embedded("root").children(children).build())
            .unwrap();
        Engine::builder()
            .config(EngineConfig::new().segment_size(2))
            .mappings(registry)
            .connection("main", db.clone())
            .build()
            .unwrap()
    }

    fn database(rows: i64) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table("story", Some("id"));
        for id in 1..=rows {
            let day = if id % 2 == 0 { "mon" } else { "tue" };
            db.seed(
                "story",
                Row::new()
                    .with("id", id)
                    .with("title", format!("story {id}"))
                    .with("day", day),
            )
            .unwrap();
        }
        db
    }

    #[test]
    fn plain_collection_loads_ids() {
        let db = database(3);
        let engine = engine(&db, Relation::children("story"));
        let root = engine.root().unwrap();
        assert_eq!(root.child_count().unwrap(), 3);
        let first = root.child_at(0).unwrap().unwrap();
        assert_eq!(first.get_string("title").as_deref(), Some("story 1"));
    }

    #[test]
    fn segmented_collection_loads_windows() {
        let db = database(5);
        let engine = engine(&db, Relation::children("story").lazy());
        let root = engine.root().unwrap();
        assert_eq!(root.child_count().unwrap(), 5);
        db.clear_log();
        let fourth = root.child_at(3).unwrap().unwrap();
        assert_eq!(fourth.id().as_deref(), Some("4"));
        let selects = db.statements();
        assert!(selects.iter().any(|s| s.to_string().contains("OFFSET 2")));
    }

    #[test]
    fn aggressive_collection_caches_members() {
        let db = database(2);
        let engine = engine(&db, Relation::children("story").aggressive());
        let root = engine.root().unwrap();
        assert_eq!(root.child_count().unwrap(), 2);
        db.clear_log();
        root.child_at(1).unwrap().unwrap();
        assert!(db.statements().is_empty());
    }

    #[test]
    fn grouped_collection_lists_distinct_values() {
        let db = database(4);
        let engine = engine(&db, Relation::children("story").group_by("day"));
        let root = engine.root().unwrap();
        assert_eq!(root.child_count().unwrap(), 2);
        let monday = root.group("mon", false).unwrap().unwrap();
        assert_eq!(monday.get_string("groupname").as_deref(), Some("mon"));
        assert_eq!(monday.child_count().unwrap(), 2);
        assert!(root.group("wed", false).unwrap().is_none());
    }

    #[test]
    fn prefetch_batches_uncached_members() {
        let db = database(3);
        let engine = engine(&db, Relation::children("story"));
        let root = engine.root().unwrap();
        root.prefetch_children(0, 3).unwrap();
        // two windows of two
        assert_eq!(engine.stats().prefetch_batches, 2);
        db.clear_log();
        for i in 0..3 {
            root.child_at(i).unwrap().unwrap();
        }
        assert!(db.statements().is_empty());
    }

    #[test]
    fn count_children_uses_count_query() {
        let db = database(4);
        let engine = engine(&db, Relation::children("story").max_size(3));
        let root = engine.root().unwrap();
        let rel = root.mapping().subnode_relation().cloned().unwrap();
        assert_eq!(engine.count_children(&root, &rel).unwrap(), 3);
    }
}
