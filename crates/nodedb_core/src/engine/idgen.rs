//! Id generation.

use super::Engine;
use crate::error::CoreResult;
use crate::mapping::Mapping;
use uuid::Uuid;

/// Produces ids for new nodes, replacing the backend's own strategy.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh id for a node of `mapping`.
    ///
    /// # Errors
    ///
    /// Returns an error if no id can be produced.
    fn generate(&self, mapping: &Mapping) -> CoreResult<String>;
}

/// Random version 4 UUIDs in simple form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self, _mapping: &Mapping) -> CoreResult<String> {
        Ok(Uuid::new_v4().simple().to_string())
    }
}

impl Engine {
    pub(crate) fn generate_id(&self, mapping: &Mapping) -> CoreResult<String> {
        match &self.0.id_generator {
            Some(generator) => generator.generate(mapping),
            None => self.backend_for(mapping)?.next_id(mapping),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{IdStrategy, MappingRegistry, TableSpec};
    use nodedb_storage::MemoryDatabase;
    use std::sync::Arc;

    #[test]
    fn uuid_ids_are_unique() {
        let mapping = Mapping::embedded("page").build();
        let a = UuidIdGenerator.generate(&mapping).unwrap();
        let b = UuidIdGenerator.generate(&mapping).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn max_ids_continue_after_existing_rows() {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table("story", Some("id"));
        db.seed("story", nodedb_storage::Row::new().with("id", 41_i64))
            .unwrap();
        let mut registry = MappingRegistry::new();
        registry
            .register(
                Mapping::relational(
                    "story",
                    TableSpec::new("main", "story", "id").id_strategy(IdStrategy::Max),
                )
                .build(),
            )
            .unwrap();
        let engine = Engine::builder()
            .mappings(registry)
            .connection("main", db)
            .build()
            .unwrap();
        let mapping = engine.registry().require("story").unwrap();
        assert_eq!(engine.generate_id(&mapping).unwrap(), "42");
        assert_eq!(engine.generate_id(&mapping).unwrap(), "43");
    }

    #[test]
    fn embedded_ids_come_from_the_store() {
        let engine = Engine::builder().build().unwrap();
        let mapping = engine.registry().require("root").unwrap();
        let first = engine.generate_id(&mapping).unwrap();
        let second = engine.generate_id(&mapping).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn custom_generator_wins() {
        struct Fixed;
        impl IdGenerator for Fixed {
            fn generate(&self, _mapping: &Mapping) -> CoreResult<String> {
                Ok("fixed".to_string())
            }
        }
        let engine = Engine::builder().id_generator(Arc::new(Fixed)).build().unwrap();
        let mapping = engine.registry().require("root").unwrap();
        assert_eq!(engine.generate_id(&mapping).unwrap(), "fixed");
    }
}
