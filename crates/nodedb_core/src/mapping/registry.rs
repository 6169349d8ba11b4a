//! Mapping registry.

use super::{Mapping, Relation, Storage};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;

/// All mappings known to an engine, by name and by table.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    by_name: HashMap<String, Arc<Mapping>>,
    by_table: HashMap<String, Arc<Mapping>>,
}

impl MappingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping and the group and virtual mappings derived from
    /// it.
    ///
    /// When several mappings share a table, keys of that table resolve to
    /// the first one registered.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if a mapping of the same name
    /// is already registered.
    pub fn register(&mut self, mapping: Mapping) -> CoreResult<Arc<Mapping>> {
        let mapping = Arc::new(mapping);
        let names: Vec<&str> = std::iter::once(mapping.name())
            .chain(mapping.derived_mappings().map(|m| m.name()))
            .collect();
        if let Some(dup) = names.iter().find(|n| self.by_name.contains_key(**n)) {
            return Err(CoreError::invalid_operation(format!(
                "mapping {dup} is already registered"
            )));
        }

        if let Storage::Relational(spec) = mapping.storage() {
            self.by_table
                .entry(spec.table.to_ascii_lowercase())
                .or_insert_with(|| Arc::clone(&mapping));
        }
        for derived in mapping.derived_mappings() {
            self.by_name
                .insert(derived.name().to_string(), Arc::clone(derived));
        }
        self.by_name
            .insert(mapping.name().to_string(), Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Returns a mapping by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Mapping>> {
        self.by_name.get(name).cloned()
    }

    /// Returns a mapping by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MappingNotFound`] for unknown names.
    pub fn require(&self, name: &str) -> CoreResult<Arc<Mapping>> {
        self.get(name)
            .ok_or_else(|| CoreError::mapping_not_found(name))
    }

    /// Returns the mapping owning a table.
    #[must_use]
    pub fn by_storage(&self, table: &str) -> Option<Arc<Mapping>> {
        self.by_table.get(&table.to_ascii_lowercase()).cloned()
    }

    /// Returns the mapping a relation points to.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MappingNotFound`] if the relation names an
    /// unregistered type.
    pub fn other_mapping(&self, relation: &Relation) -> CoreResult<Option<Arc<Mapping>>> {
        relation.other_type().map(|name| self.require(name)).transpose()
    }

    /// Returns true if a mapping of that name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Returns the number of mappings, derived ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Returns the registered mapping names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Checks that every relation points to a registered mapping.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MappingNotFound`] naming the first missing type.
    pub fn validate(&self) -> CoreResult<()> {
        for mapping in self.by_name.values() {
            let relations = mapping
                .properties()
                .iter()
                .chain(mapping.subnode_relation());
            for rel in relations {
                self.other_mapping(rel)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TableSpec;

    #[test]
    fn registers_derived_mappings() {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::embedded("site")
                    .property(Relation::collection("archive", "story"))
                    .children(Relation::children("story").group_by("topic"))
                    .build(),
            )
            .unwrap();
        assert!(registry.contains("site"));
        assert!(registry.contains("site#groups"));
        assert!(registry.contains("site.archive"));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn rejects_duplicates() {
        let mut registry = MappingRegistry::new();
        registry.register(Mapping::embedded("site").build()).unwrap();
        let err = registry.register(Mapping::embedded("site").build()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn finds_by_table_case_insensitively() {
        let mut registry = MappingRegistry::new();
        registry
            .register(Mapping::relational("story", TableSpec::new("main", "Story", "id")).build())
            .unwrap();
        assert_eq!(registry.by_storage("STORY").unwrap().name(), "story");
        assert!(registry.by_storage("comment").is_none());
    }

    #[test]
    fn validate_reports_missing_types() {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::embedded("site")
                    .children(Relation::children("story"))
                    .build(),
            )
            .unwrap();
        let err = registry.validate().unwrap_err();
        assert!(matches!(err, CoreError::MappingNotFound { name } if name == "story"));
    }
}
