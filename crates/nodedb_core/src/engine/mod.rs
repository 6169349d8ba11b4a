//! Engine facade.
//!
//! The [`Engine`] owns the mapping registry, the shared node cache, one
//! backend per mapping and the thread-bound transactions. It is a cheap
//! cloneable handle; nodes keep a weak reference to it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nodedb_core::{Engine, EngineConfig, Mapping, MappingRegistry};
//! use nodedb_storage::MemoryStore;
//! use std::sync::Arc;
//!
//! let mut registry = MappingRegistry::new();
//! registry.register(Mapping::embedded("page").build())?;
//!
//! let engine = Engine::builder()
//!     .mappings(registry)
//!     .embedded(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! engine.transaction(|_| {
//!     let page = engine.create_node("page")?;
//!     page.set_string("title", "Welcome")?;
//!     engine.root()?.add_child(&page)
//! })?;
//! ```

mod collections;
mod fetch;
mod idgen;
mod write;

pub use idgen::{IdGenerator, UuidIdGenerator};

use crate::backend::{query_backed, EmbeddedBackend, NodeBackend, RelationalBackend};
use crate::cache::{CacheEntry, NodeCache};
use crate::change_feed::{ChangeSet, NodeChangeListener};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::hooks::{NoopContext, RequestContext};
use crate::key::Key;
use crate::mapping::{Mapping, MappingKind, MappingRegistry, Storage};
use crate::node::Node;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::transaction::{self, Transaction, Transactor};
use crate::types::{SequenceNumber, TransactionId};
use nodedb_storage::{EmbeddedStore, MemoryStore, RelationalConnection, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// State shared by every clone of an [`Engine`].
pub(crate) struct Shared {
    config: EngineConfig,
    registry: MappingRegistry,
    cache: NodeCache,
    embedded: Arc<EmbeddedBackend>,
    /// Relational backends by source name.
    sources: HashMap<String, Arc<RelationalBackend>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    context: Arc<dyn RequestContext>,
    listeners: RwLock<Vec<Arc<dyn NodeChangeListener>>>,
    stats: EngineStats,
    /// Logical clock advanced by every commit that changed data.
    clock: AtomicU64,
    next_txn: AtomicU64,
    commit_seq: AtomicU64,
    closed: AtomicBool,
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct Engine(Arc<Shared>);

/// Builds an [`Engine`].
#[must_use]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: MappingRegistry,
    embedded: Option<Arc<dyn EmbeddedStore>>,
    connections: Vec<(String, Arc<dyn RelationalConnection>)>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    context: Arc<dyn RequestContext>,
    listeners: Vec<Arc<dyn NodeChangeListener>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: MappingRegistry::new(),
            embedded: None,
            connections: Vec::new(),
            id_generator: None,
            context: Arc::new(NoopContext),
            listeners: Vec::new(),
        }
    }
}

impl EngineBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the mapping registry.
    pub fn mappings(mut self, registry: MappingRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the embedded record store. Defaults to an in-memory store.
    pub fn embedded(mut self, store: Arc<dyn EmbeddedStore>) -> Self {
        self.embedded = Some(store);
        self
    }

    /// Registers the connection for a relational source.
    pub fn connection(mut self, source: &str, connection: Arc<dyn RelationalConnection>) -> Self {
        self.connections.push((source.to_string(), connection));
        self
    }

    /// Replaces backend id generation for every mapping.
    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    /// Sets the request context that decides caching and runs hooks.
    pub fn request_context(mut self, context: Arc<dyn RequestContext>) -> Self {
        self.context = context;
        self
    }

    /// Adds a commit listener.
    pub fn listener(mut self, listener: Arc<dyn NodeChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validates the mappings and starts the engine.
    ///
    /// The root mapping is registered as a plain embedded mapping if the
    /// registry does not define it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MappingNotFound`] if a relation names an
    /// unknown type, or [`CoreError::InvalidOperation`] if a relational
    /// mapping's source has no connection.
    pub fn build(self) -> CoreResult<Engine> {
        let mut registry = self.registry;
        if !registry.contains(&self.config.root_prototype) {
            registry.register(Mapping::embedded(&self.config.root_prototype).build())?;
        }
        registry.validate()?;

        let log_statements = self.config.log_statements;
        let sources: HashMap<String, Arc<RelationalBackend>> = self
            .connections
            .into_iter()
            .map(|(source, connection)| {
                let backend = RelationalBackend::new(&source, connection, log_statements);
                (source, Arc::new(backend))
            })
            .collect();
        for name in registry.names() {
            let mapping = registry.require(&name)?;
            if let Some(table) = mapping.table() {
                if !sources.contains_key(&table.source) {
                    return Err(CoreError::invalid_operation(format!(
                        "mapping {name} uses source {} which has no connection",
                        table.source
                    )));
                }
            }
        }

        let store = self
            .embedded
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn EmbeddedStore>);
        let embedded = Arc::new(EmbeddedBackend::new(store, &registry));

        tracing::info!(
            mappings = registry.len(),
            sources = sources.len(),
            cache_capacity = self.config.cache_capacity,
            cache_shards = self.config.cache_shards,
            "engine started"
        );

        Ok(Engine(Arc::new(Shared {
            cache: NodeCache::new(self.config.cache_capacity, self.config.cache_shards),
            config: self.config,
            registry,
            embedded,
            sources,
            id_generator: self.id_generator,
            context: self.context,
            listeners: RwLock::new(self.listeners),
            stats: EngineStats::new(),
            clock: AtomicU64::new(0),
            next_txn: AtomicU64::new(1),
            commit_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })))
    }
}

impl Engine {
    /// Starts building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self(shared)
    }

    pub(crate) fn weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.0)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.0.closed.load(Ordering::Acquire) {
            Err(CoreError::EngineClosed)
        } else {
            Ok(())
        }
    }

    /// Begins a transaction bound to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the thread already has an
    /// active transaction on this engine.
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        if let Some(existing) = self.current_transactor() {
            if existing.is_active() {
                return Err(CoreError::invalid_operation(format!(
                    "transaction {} is already active on this thread",
                    existing.id()
                )));
            }
            transaction::unbind(&existing);
        }
        let id = TransactionId::new(self.0.next_txn.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + self.0.config.transaction_timeout;
        let transactor = Arc::new(Transactor::new(id, self.weak(), deadline));
        transaction::bind(Arc::clone(&transactor));
        tracing::trace!(txn = %id, "transaction started");
        Ok(Transaction::new(transactor, self.clone()))
    }

    /// Runs `f` in a transaction, committing if it succeeds and aborting
    /// if it fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or of the commit.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        let txn = self.begin()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Returns the root node, creating its record on first use.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the root cannot be read or written.
    pub fn root(&self) -> CoreResult<Arc<Node>> {
        self.ensure_open()?;
        let mapping = self.0.registry.require(&self.0.config.root_prototype)?;
        let key = mapping.key_for(&self.0.config.root_id);
        if let Some(root) = self.get_node_by_key(&key)? {
            return Ok(root);
        }
        let root = Node::keyed(
            self.weak(),
            Arc::clone(&mapping),
            key.clone(),
            mapping.name().to_string(),
        );
        if let Err(err) = self.backend_for(&mapping)?.insert(&root.snapshot()?) {
            // Another thread created the root first.
            if matches!(
                err,
                CoreError::Storage(StorageError::DuplicateId(_) | StorageError::Constraint(_))
            ) {
                if let Some(root) = self.get_node_by_key(&key)? {
                    return Ok(root);
                }
            }
            return Err(err);
        }
        root.mark_persisted(true);
        tracing::info!(root = %root.label(), "root node created");
        Ok(self.register_fetched(None, root))
    }

    /// Creates a transient node of `prototype`. It becomes persistent once
    /// attached to a persistent node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MappingNotFound`] for an unknown prototype.
    pub fn create_node(&self, prototype: &str) -> CoreResult<Arc<Node>> {
        self.ensure_open()?;
        let mapping = self.0.registry.require(prototype)?;
        Ok(Node::transient(self.weak(), mapping, prototype.to_string()))
    }

    /// Removes a node from the cache and marks it invalid. Holders of the
    /// old instance see [`crate::NodeState::Invalid`]; the next lookup
    /// refetches.
    pub fn evict_node(&self, node: &Arc<Node>) {
        if let Some(key) = node.key() {
            self.0.cache.remove_if(&key, node);
            if let Some(tx) = self.current_transactor() {
                tx.drop_clean(&key);
            }
        }
        node.invalidate_local();
    }

    /// Evicts whatever is cached under `key`, invalidating a node found
    /// there.
    pub fn evict_node_by_key(&self, key: &Key) {
        let entry = self.0.cache.remove(key);
        if let Some(CacheEntry::Node(node)) = entry {
            self.evict_node(&node);
        }
        if let Some(tx) = self.current_transactor() {
            tx.drop_clean(key);
        }
    }

    /// Removes one cache entry without invalidating the node behind it.
    pub fn evict_key(&self, key: &Key) {
        self.0.cache.remove(key);
        if let Some(tx) = self.current_transactor() {
            tx.drop_clean(key);
        }
    }

    /// Empties the shared cache.
    pub fn clear_cache(&self) {
        let entries = self.0.cache.len();
        self.0.cache.clear();
        tracing::info!(entries, "node cache cleared");
    }

    /// Registers a commit listener.
    pub fn add_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        self.0.listeners.write().push(listener);
    }

    /// Returns a snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.0.stats.snapshot()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    /// Returns the mapping registry.
    #[must_use]
    pub fn registry(&self) -> &MappingRegistry {
        &self.0.registry
    }

    /// Returns the number of cache entries, negative entries included.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.0.cache.len()
    }

    /// Returns true until [`Engine::shutdown`] is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.0.closed.load(Ordering::Acquire)
    }

    /// Flushes the embedded store and closes the engine. Later operations
    /// fail with [`CoreError::EngineClosed`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the flush fails.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.0.embedded.store().flush()?;
        self.0.cache.clear();
        tracing::info!(commits = self.0.stats.snapshot().commits, "engine shut down");
        Ok(())
    }

    pub(crate) fn current_transactor(&self) -> Option<Arc<Transactor>> {
        transaction::current(&self.0)
    }

    pub(crate) fn stats_ref(&self) -> &EngineStats {
        &self.0.stats
    }

    pub(crate) fn tick(&self) -> u64 {
        self.0.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn clock(&self) -> u64 {
        self.0.clock.load(Ordering::Acquire)
    }

    pub(crate) fn next_commit_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.0.commit_seq.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn notify_listeners(&self, changes: &ChangeSet) {
        let listeners = self.0.listeners.read().clone();
        for listener in listeners {
            listener.nodes_changed(changes);
        }
    }

    /// Caches a node under an additional key and records it in the current
    /// transaction.
    pub(crate) fn register_key(&self, key: Key, node: &Arc<Node>) {
        self.0.cache.put(key.clone(), CacheEntry::Node(Arc::clone(node)));
        if let Some(tx) = self.current_transactor() {
            tx.visit_clean(key, node);
        }
    }

    /// Returns true if nodes of a derived mapping are stored. Group nodes
    /// never are; a virtual collection is when its members live in the
    /// embedded store, so its member list needs a record.
    pub(crate) fn needs_persistence(&self, mapping: &Mapping) -> bool {
        match mapping.kind() {
            MappingKind::Group => false,
            MappingKind::Virtual => !query_backed(&self.0.registry, mapping),
            MappingKind::Normal => true,
        }
    }

    /// Returns true if changes to `node`'s child list are not written to
    /// `node`'s own record because the list is a query result.
    pub(crate) fn ignores_subnode_change(&self, node: &Node) -> bool {
        query_backed(&self.0.registry, &node.mapping())
    }

    fn backend_for(&self, mapping: &Mapping) -> CoreResult<Arc<dyn NodeBackend>> {
        match mapping.storage() {
            Storage::Relational(_) => Ok(self.relational_for(mapping)?),
            _ => Ok(Arc::clone(&self.0.embedded) as Arc<dyn NodeBackend>),
        }
    }

    fn relational_for(&self, mapping: &Mapping) -> CoreResult<Arc<RelationalBackend>> {
        let table = mapping.table().ok_or_else(|| {
            CoreError::invalid_operation(format!("mapping {} has no table", mapping.name()))
        })?;
        self.0.sources.get(&table.source).cloned().ok_or_else(|| {
            CoreError::invalid_operation(format!("no connection for source {}", table.source))
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mappings", &self.0.registry.len())
            .field("cache_size", &self.0.cache.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TableSpec;
    use crate::state::NodeState;

    fn engine() -> Engine {
        let mut registry = MappingRegistry::new();
        registry.register(Mapping::embedded("page").build()).unwrap();
        Engine::builder().mappings(registry).build().unwrap()
    }

    #[test]
    fn build_registers_root_mapping() {
        let engine = engine();
        assert!(engine.registry().contains("root"));
        let root = engine.root().unwrap();
        assert_eq!(root.state(), NodeState::Clean);
        assert!(Arc::ptr_eq(&root, &engine.root().unwrap()));
    }

    #[test]
    fn build_rejects_missing_connection() {
        let mut registry = MappingRegistry::new();
        registry
            .register(Mapping::relational("story", TableSpec::new("main", "story", "id")).build())
            .unwrap();
        let result = Engine::builder().mappings(registry).build();
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn second_begin_on_thread_fails() {
        let engine = engine();
        let txn = engine.begin().unwrap();
        assert!(matches!(engine.begin(), Err(CoreError::InvalidOperation { .. })));
        txn.abort();
        let again = engine.begin().unwrap();
        again.abort();
    }

    #[test]
    fn transaction_closure_aborts_on_error() {
        let engine = engine();
        let result: CoreResult<()> = engine.transaction(|_| Err(CoreError::NoTransaction));
        assert!(result.is_err());
        assert_eq!(engine.stats().aborts, 1);
        assert!(engine.begin().is_ok());
    }

    #[test]
    fn shutdown_closes() {
        let engine = engine();
        engine.shutdown().unwrap();
        assert!(!engine.is_open());
        assert!(matches!(engine.begin(), Err(CoreError::EngineClosed)));
    }

    #[test]
    fn tick_is_monotonic() {
        let engine = engine();
        let a = engine.tick();
        let b = engine.tick();
        assert!(b > a);
        assert_eq!(engine.clock(), b);
    }
}
