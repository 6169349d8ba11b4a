//! Type mappings.
//!
//! A [`Mapping`] tells the engine where nodes of one prototype live, which
//! columns their properties use and how their children are found. Mappings
//! are static: they are built once, registered in a [`MappingRegistry`] and
//! shared read-only by every transaction. The only mutable parts are the
//! data-change clock and the id cell used for `MAX`-based id generation.
//!
//! # Example
//!
//! ```rust
//! use nodedb_core::mapping::{LocalField, Mapping, MappingRegistry, Relation, TableSpec};
//!
//! let mut registry = MappingRegistry::new();
//! registry
//!     .register(
//!         Mapping::embedded("site")
//!             .children(Relation::children("story").constraint(LocalField::Id, "site_id"))
//!             .build(),
//!     )
//!     .unwrap();
//! registry
//!     .register(
//!         Mapping::relational("story", TableSpec::new("main", "story", "id"))
//!             .property(Relation::primitive("title", "title"))
//!             .property(Relation::primitive("site_id", "site_id"))
//!             .build(),
//!     )
//!     .unwrap();
//! assert!(registry.validate().is_ok());
//! ```

mod registry;
mod relation;

pub use registry::MappingRegistry;
pub use relation::{ColumnType, Constraint, LocalField, Relation, RelationKind};

use crate::key::Key;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Role of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// A regular prototype.
    Normal,
    /// The derived mapping of group nodes.
    Group,
    /// The derived mapping of a collection property.
    Virtual,
}

/// How new ids are produced for a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdStrategy {
    /// The embedded store's sequence.
    EmbeddedSequence,
    /// `MAX(id) + 1` over the table, serialized per mapping.
    Max,
    /// A native database sequence.
    Sequence(String),
}

/// Table binding of a relational mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Name of the connection the table lives in.
    pub source: String,
    /// Table name.
    pub table: String,
    /// Primary key column.
    pub id_column: String,
    /// Column holding the node's display name.
    pub name_column: Option<String>,
    /// Column holding the node's prototype.
    pub prototype_column: Option<String>,
    /// Explicit id strategy. `MAX` when unset.
    pub id_strategy: Option<IdStrategy>,
}

impl TableSpec {
    /// Creates a table binding.
    #[must_use]
    pub fn new(source: &str, table: &str, id_column: &str) -> Self {
        Self {
            source: source.to_string(),
            table: table.to_string(),
            id_column: id_column.to_string(),
            name_column: None,
            prototype_column: None,
            id_strategy: None,
        }
    }

    /// Sets the name column.
    #[must_use]
    pub fn name_column(mut self, column: &str) -> Self {
        self.name_column = Some(column.to_string());
        self
    }

    /// Sets the prototype column.
    #[must_use]
    pub fn prototype_column(mut self, column: &str) -> Self {
        self.prototype_column = Some(column.to_string());
        self
    }

    /// Sets the id strategy.
    #[must_use]
    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = Some(strategy);
        self
    }
}

/// Where nodes of a mapping are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// The embedded record store.
    Embedded,
    /// A relational table.
    Relational(TableSpec),
    /// Nothing backs the nodes; they are derived from their parent. Nodes of
    /// a derived mapping that must still be kept go to the embedded store.
    Derived,
}

/// Static description of one prototype.
#[derive(Debug)]
pub struct Mapping {
    name: String,
    kind: MappingKind,
    storage: Storage,
    properties: Vec<Relation>,
    subnodes: Option<Relation>,
    parent_property: Option<String>,
    group_mapping: Option<Arc<Mapping>>,
    virtual_mappings: BTreeMap<String, Arc<Mapping>>,
    last_data_change: AtomicU64,
    last_id: Mutex<i64>,
}

/// Builder for [`Mapping`].
#[derive(Debug)]
pub struct MappingBuilder {
    name: String,
    storage: Storage,
    properties: Vec<Relation>,
    subnodes: Option<Relation>,
    parent_property: Option<String>,
}

impl MappingBuilder {
    /// Adds a property relation. Relations keep their insertion order, which
    /// is also the column order of inserts.
    #[must_use]
    pub fn property(mut self, relation: Relation) -> Self {
        self.properties.push(relation);
        self
    }

    /// Sets the child collection relation.
    #[must_use]
    pub fn children(mut self, relation: Relation) -> Self {
        self.subnodes = Some(relation);
        self
    }

    /// Resolves the parent of nodes through the given reference property.
    #[must_use]
    pub fn parent_property(mut self, property: &str) -> Self {
        self.parent_property = Some(property.to_string());
        self
    }

    /// Builds the mapping together with its derived group and virtual
    /// mappings.
    #[must_use]
    pub fn build(self) -> Mapping {
        let group_mapping = self
            .subnodes
            .as_ref()
            .and_then(Relation::group_member_relation)
            .map(|members| {
                Arc::new(Mapping::derived(
                    format!("{}#groups", self.name),
                    MappingKind::Group,
                    Some(members),
                ))
            });

        let virtual_mappings = self
            .properties
            .iter()
            .filter(|rel| rel.is_virtual())
            .map(|rel| {
                let mapping = Mapping::derived(
                    format!("{}.{}", self.name, rel.name()),
                    MappingKind::Virtual,
                    Some(rel.as_child_relation()),
                );
                (rel.name().to_string(), Arc::new(mapping))
            })
            .collect();

        Mapping {
            name: self.name,
            kind: MappingKind::Normal,
            storage: self.storage,
            properties: self.properties,
            subnodes: self.subnodes,
            parent_property: self.parent_property,
            group_mapping,
            virtual_mappings,
            last_data_change: AtomicU64::new(0),
            last_id: Mutex::new(0),
        }
    }
}

impl Mapping {
    /// Starts a mapping stored in the embedded store.
    #[must_use]
    pub fn embedded(name: &str) -> MappingBuilder {
        Self::builder(name, Storage::Embedded)
    }

    /// Starts a mapping stored in a relational table.
    #[must_use]
    pub fn relational(name: &str, table: TableSpec) -> MappingBuilder {
        Self::builder(name, Storage::Relational(table))
    }

    fn builder(name: &str, storage: Storage) -> MappingBuilder {
        MappingBuilder {
            name: name.to_string(),
            storage,
            properties: Vec::new(),
            subnodes: None,
            parent_property: None,
        }
    }

    fn derived(name: String, kind: MappingKind, subnodes: Option<Relation>) -> Self {
        Self {
            name,
            kind,
            storage: Storage::Derived,
            properties: Vec::new(),
            subnodes,
            parent_property: None,
            group_mapping: None,
            virtual_mappings: BTreeMap::new(),
            last_data_change: AtomicU64::new(0),
            last_id: Mutex::new(0),
        }
    }

    /// Returns the mapping name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the mapping kind.
    #[must_use]
    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    /// Returns the storage.
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns the table binding of a relational mapping.
    #[must_use]
    pub fn table(&self) -> Option<&TableSpec> {
        match &self.storage {
            Storage::Relational(spec) => Some(spec),
            _ => None,
        }
    }

    /// Returns true if nodes live in a relational table.
    #[must_use]
    pub fn is_relational(&self) -> bool {
        self.table().is_some()
    }

    /// Returns the table name, which also scopes primary keys.
    #[must_use]
    pub fn storage_name(&self) -> Option<&str> {
        self.table().map(|t| t.table.as_str())
    }

    /// Builds the primary key of a node of this mapping.
    #[must_use]
    pub fn key_for(&self, id: &str) -> Key {
        match self.storage_name() {
            Some(table) => Key::relational(table, id),
            None => Key::embedded(id),
        }
    }

    /// Returns the id strategy, applying the per-storage default.
    #[must_use]
    pub fn id_strategy(&self) -> IdStrategy {
        match &self.storage {
            Storage::Relational(spec) => spec.id_strategy.clone().unwrap_or(IdStrategy::Max),
            _ => IdStrategy::EmbeddedSequence,
        }
    }

    /// Returns the property relations in declaration order.
    #[must_use]
    pub fn properties(&self) -> &[Relation] {
        &self.properties
    }

    /// Returns the relation of a property.
    #[must_use]
    pub fn property_relation(&self, name: &str) -> Option<&Relation> {
        self.properties.iter().find(|rel| rel.name() == name)
    }

    /// Returns the child collection relation.
    #[must_use]
    pub fn subnode_relation(&self) -> Option<&Relation> {
        self.subnodes.as_ref()
    }

    /// Returns the relation used to look up `name` below a node: an
    /// explicit property relation, or else the child collection.
    #[must_use]
    pub fn relation_for_name(&self, name: &str) -> Option<&Relation> {
        self.property_relation(name)
            .filter(|rel| rel.is_virtual() || rel.is_complex_reference() || rel.is_collection())
            .or(self.subnodes.as_ref())
    }

    /// Returns the column of a property.
    #[must_use]
    pub fn column_for_property(&self, property: &str) -> Option<&str> {
        if let Some(table) = self.table() {
            if let Some(column) = table.name_column.as_deref().filter(|c| *c == property) {
                return Some(column);
            }
        }
        self.property_relation(property).and_then(Relation::column)
    }

    /// Returns the property stored in a column.
    #[must_use]
    pub fn property_for_column(&self, column: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|rel| {
                rel.column()
                    .is_some_and(|c| c.eq_ignore_ascii_case(column))
            })
            .map(Relation::name)
    }

    /// Returns true if `column` is this mapping's primary key column.
    #[must_use]
    pub fn is_id_column(&self, column: &str) -> bool {
        self.table()
            .is_some_and(|t| t.id_column.eq_ignore_ascii_case(column))
    }

    /// Returns the reference property through which parents are resolved.
    #[must_use]
    pub fn parent_property(&self) -> Option<&str> {
        self.parent_property.as_deref()
    }

    /// Returns the derived mapping of group nodes.
    #[must_use]
    pub fn group_mapping(&self) -> Option<&Arc<Mapping>> {
        self.group_mapping.as_ref()
    }

    /// Returns the derived mapping of a collection property.
    #[must_use]
    pub fn virtual_mapping(&self, property: &str) -> Option<&Arc<Mapping>> {
        self.virtual_mappings.get(property)
    }

    pub(crate) fn derived_mappings(&self) -> impl Iterator<Item = &Arc<Mapping>> {
        self.group_mapping
            .iter()
            .chain(self.virtual_mappings.values())
    }

    /// Returns the engine clock value of the last committed change to
    /// nodes of this mapping.
    #[must_use]
    pub fn last_data_change(&self) -> u64 {
        self.last_data_change.load(Ordering::Acquire)
    }

    /// Advances the data-change clock. Never moves it backwards.
    pub(crate) fn touch(&self, clock: u64) {
        self.last_data_change.fetch_max(clock, Ordering::AcqRel);
    }

    /// Issues the next `MAX`-based id. `current_max` runs under the
    /// mapping's id lock, so concurrent callers never see the same maximum.
    pub(crate) fn next_max_id<E>(
        &self,
        current_max: impl FnOnce() -> Result<i64, E>,
    ) -> Result<i64, E> {
        let mut last = self.last_id.lock();
        let max = current_max()?;
        *last = (*last + 1).max(max + 1);
        Ok(*last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story() -> Mapping {
        Mapping::relational(
            "story",
            TableSpec::new("main", "story", "id").name_column("title"),
        )
        .property(Relation::primitive("title", "title"))
        .property(Relation::reference("author", "author_id", "user"))
        .property(Relation::collection("comments", "comment"))
        .children(Relation::children("comment").group_by("day"))
        .build()
    }

    #[test]
    fn derives_group_and_virtual_mappings() {
        let mapping = story();
        let group = mapping.group_mapping().unwrap();
        assert_eq!(group.kind(), MappingKind::Group);
        assert_eq!(group.subnode_relation().unwrap().group_property(), Some("day"));

        let comments = mapping.virtual_mapping("comments").unwrap();
        assert_eq!(comments.name(), "story.comments");
        assert!(!comments.subnode_relation().unwrap().is_virtual());
        assert_eq!(mapping.derived_mappings().count(), 2);
    }

    #[test]
    fn column_lookup_both_ways() {
        let mapping = story();
        assert_eq!(mapping.column_for_property("author"), Some("author_id"));
        assert_eq!(mapping.property_for_column("AUTHOR_ID"), Some("author"));
        assert!(mapping.is_id_column("ID"));
        assert_eq!(mapping.key_for("4"), Key::relational("story", "4"));
    }

    #[test]
    fn name_column_maps_without_a_property_relation() {
        let mapping =
            Mapping::relational("tag", TableSpec::new("main", "tag", "id").name_column("label"))
                .build();
        let column = {
            let property = String::from("label");
            mapping.column_for_property(&property).map(str::to_string)
        };
        assert_eq!(column.as_deref(), Some("label"));
        assert_eq!(mapping.column_for_property("color"), None);
    }

    #[test]
    fn default_id_strategies() {
        assert_eq!(story().id_strategy(), IdStrategy::Max);
        assert_eq!(
            Mapping::embedded("site").build().id_strategy(),
            IdStrategy::EmbeddedSequence
        );
    }

    #[test]
    fn max_ids_never_repeat() {
        let mapping = story();
        let a = mapping.next_max_id(|| Ok::<_, ()>(10)).unwrap();
        let b = mapping.next_max_id(|| Ok::<_, ()>(10)).unwrap();
        assert_eq!((a, b), (11, 12));
        let c = mapping.next_max_id(|| Ok::<_, ()>(40)).unwrap();
        assert_eq!(c, 41);
    }

    #[test]
    fn data_change_clock_is_monotonic() {
        let mapping = story();
        mapping.touch(5);
        mapping.touch(3);
        assert_eq!(mapping.last_data_change(), 5);
    }
}
