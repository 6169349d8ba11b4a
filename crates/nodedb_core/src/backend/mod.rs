//! Store backends.
//!
//! Each mapping is served by exactly one [`NodeBackend`], chosen once when
//! the engine is built: the embedded record store for embedded and derived
//! mappings, or the relational connection named by the mapping's table.

mod embedded;
pub(crate) mod query;
mod relational;

pub(crate) use embedded::EmbeddedBackend;
pub(crate) use relational::RelationalBackend;

use crate::codec::ChildRecord;
use crate::error::CoreResult;
use crate::key::Key;
use crate::mapping::{Mapping, MappingRegistry};
use crate::node::{Node, NodeSnapshot};
use crate::value::Property;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything needed to build a clean node from stored data.
#[derive(Debug)]
pub(crate) struct NodeSeed {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) prototype: String,
    pub(crate) created: i64,
    pub(crate) last_modified: i64,
    pub(crate) parent: Option<Key>,
    pub(crate) properties: BTreeMap<String, Property>,
    /// The stored child list. `None` for nodes whose children come from a
    /// query.
    pub(crate) children: Option<Vec<ChildRecord>>,
}

/// Store operations for nodes of one mapping.
pub(crate) trait NodeBackend: Send + Sync {
    /// Loads the node stored under a primary key. Returns the mapping the
    /// stored data belongs to, which may be a more specific one than the
    /// key suggests.
    fn fetch(
        &self,
        registry: &MappingRegistry,
        key: &Key,
    ) -> CoreResult<Option<(Arc<Mapping>, NodeSeed)>>;

    /// Writes a new node.
    fn insert(&self, snapshot: &NodeSnapshot) -> CoreResult<()>;

    /// Writes the changes of a modified node. Returns true if a non-private
    /// column changed.
    fn update(&self, node: &Node) -> CoreResult<bool>;

    /// Removes a node.
    fn delete(&self, snapshot: &NodeSnapshot) -> CoreResult<()>;

    /// Produces a fresh id following the mapping's id strategy.
    fn next_id(&self, mapping: &Mapping) -> CoreResult<String>;
}

/// Returns true if the children of `mapping` come from a relational query
/// rather than from the stored child list.
pub(crate) fn query_backed(registry: &MappingRegistry, mapping: &Mapping) -> bool {
    mapping
        .subnode_relation()
        .and_then(|rel| registry.other_mapping(rel).ok().flatten())
        .is_some_and(|other| other.is_relational())
}
