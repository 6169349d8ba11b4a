//! Embedded record store backend.

use super::{query_backed, NodeBackend, NodeSeed};
use crate::codec::{self, ChildRecord, NodeRecord, StoredValue};
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::mapping::{IdStrategy, Mapping, MappingRegistry};
use crate::node::{Node, NodeSnapshot};
use crate::value::Property;
use nodedb_storage::EmbeddedStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stores each node as one CBOR record keyed by its id.
pub(crate) struct EmbeddedBackend {
    store: Arc<dyn EmbeddedStore>,
    /// Mappings whose children come from a query. Their stored child list
    /// is left empty.
    query_backed: Vec<String>,
}

impl EmbeddedBackend {
    pub(crate) fn new(store: Arc<dyn EmbeddedStore>, registry: &MappingRegistry) -> Self {
        let query_backed = registry
            .names()
            .into_iter()
            .filter(|name| {
                registry
                    .get(name)
                    .is_some_and(|m| query_backed(registry, &m))
            })
            .collect();
        Self {
            store,
            query_backed,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn EmbeddedStore> {
        &self.store
    }

    fn is_query_backed(&self, mapping: &Mapping) -> bool {
        self.query_backed.iter().any(|name| name == mapping.name())
    }

    fn record(&self, snapshot: &NodeSnapshot) -> NodeRecord {
        let properties = snapshot
            .properties
            .iter()
            .filter_map(|p| StoredValue::from_value(p.value()).map(|v| (p.name().to_string(), v)))
            .collect();

        let mut children = Vec::new();
        if !self.is_query_backed(&snapshot.mapping) {
            for handle in &snapshot.children {
                let Some(key) = handle.key() else { continue };
                let group = snapshot.groups.iter().find(|(_, g)| g.handle() == *handle);
                match group {
                    Some((value, group)) => {
                        let members =
                            group.with_children(|list| list.map(|l| l.handles()).unwrap_or_default());
                        children.extend(members.into_iter().filter_map(|member| {
                            Some(ChildRecord {
                                key: member.key()?,
                                group: Some(value.clone()),
                            })
                        }));
                    }
                    None => children.push(ChildRecord { key, group: None }),
                }
            }
        }

        NodeRecord {
            name: snapshot.name.clone(),
            prototype: snapshot.prototype.clone(),
            created: snapshot.created,
            last_modified: snapshot.last_modified,
            parent: snapshot.parent.clone(),
            properties,
            children,
        }
    }

    fn write(&self, snapshot: &NodeSnapshot, insert: bool) -> CoreResult<()> {
        let bytes = codec::encode(&self.record(snapshot))?;
        if insert {
            self.store.insert(&snapshot.id, &bytes)?;
        } else {
            self.store.update(&snapshot.id, &bytes)?;
        }
        Ok(())
    }
}

impl NodeBackend for EmbeddedBackend {
    fn fetch(
        &self,
        registry: &MappingRegistry,
        key: &Key,
    ) -> CoreResult<Option<(Arc<Mapping>, NodeSeed)>> {
        let Key::Primary { storage: None, id } = key else {
            return Ok(None);
        };
        let Some(bytes) = self.store.get(id)? else {
            return Ok(None);
        };
        let record = codec::decode(&bytes)?;
        let mapping = registry.require(&record.prototype)?;

        let properties: BTreeMap<String, Property> = record
            .properties
            .into_iter()
            .map(|(name, value)| {
                let prop = Property::loaded(name.clone(), value.into_value());
                (name, prop)
            })
            .collect();
        let children = (!self.is_query_backed(&mapping)).then_some(record.children);

        Ok(Some((
            mapping,
            NodeSeed {
                id: id.clone(),
                name: record.name,
                prototype: record.prototype,
                created: record.created,
                last_modified: record.last_modified,
                parent: record.parent,
                properties,
                children,
            },
        )))
    }

    fn insert(&self, snapshot: &NodeSnapshot) -> CoreResult<()> {
        self.write(snapshot, true)
    }

    fn update(&self, node: &Node) -> CoreResult<bool> {
        let snapshot = node.snapshot()?;
        let mapping = &snapshot.mapping;
        let public_change = node.dirty_properties().iter().any(|p| {
            mapping
                .property_relation(p.name())
                .map_or(true, |rel| !rel.is_private())
        });
        self.write(&snapshot, false)?;
        node.clear_dirty();
        Ok(public_change)
    }

    fn delete(&self, snapshot: &NodeSnapshot) -> CoreResult<()> {
        self.store.delete(&snapshot.id)?;
        Ok(())
    }

    fn next_id(&self, mapping: &Mapping) -> CoreResult<String> {
        match mapping.id_strategy() {
            IdStrategy::EmbeddedSequence => Ok(self.store.next_id()?),
            other => Err(CoreError::invalid_operation(format!(
                "{other:?} ids are not available for embedded mapping {}",
                mapping.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodedb_storage::MemoryStore;

    fn registry() -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry.register(Mapping::embedded("page").build()).unwrap();
        registry
    }

    #[test]
    fn fetch_decodes_record_and_mapping() {
        let store = Arc::new(MemoryStore::new());
        let record = NodeRecord {
            name: "home".into(),
            prototype: "page".into(),
            created: 1,
            last_modified: 2,
            parent: None,
            properties: BTreeMap::from([("title".to_string(), StoredValue::String("Hi".into()))]),
            children: vec![ChildRecord {
                key: Key::embedded("9"),
                group: None,
            }],
        };
        store.insert("4", &codec::encode(&record).unwrap()).unwrap();

        let registry = registry();
        let backend = EmbeddedBackend::new(store, &registry);
        let (mapping, seed) = backend.fetch(&registry, &Key::embedded("4")).unwrap().unwrap();
        assert_eq!(mapping.name(), "page");
        assert_eq!(seed.name, "home");
        assert_eq!(seed.properties["title"].value().as_string().as_deref(), Some("Hi"));
        assert_eq!(seed.children.unwrap().len(), 1);
    }

    #[test]
    fn missing_and_foreign_keys_are_none() {
        let registry = registry();
        let backend = EmbeddedBackend::new(Arc::new(MemoryStore::new()), &registry);
        assert!(backend.fetch(&registry, &Key::embedded("1")).unwrap().is_none());
        assert!(backend
            .fetch(&registry, &Key::relational("story", "1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_prototype_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let record = NodeRecord {
            name: "x".into(),
            prototype: "ghost".into(),
            created: 0,
            last_modified: 0,
            parent: None,
            properties: BTreeMap::new(),
            children: Vec::new(),
        };
        store.insert("1", &codec::encode(&record).unwrap()).unwrap();
        let registry = registry();
        let backend = EmbeddedBackend::new(store, &registry);
        assert!(matches!(
            backend.fetch(&registry, &Key::embedded("1")),
            Err(CoreError::MappingNotFound { .. })
        ));
    }
}
