//! # nodedb Core
//!
//! Persistent object cache and transaction engine for nodedb.
//!
//! Application data is a tree of [`Node`]s. Each node belongs to a
//! [`Mapping`] that decides where it is stored: in the embedded record
//! store, in a relational table, or nowhere at all for group and virtual
//! collection nodes derived from their parent.
//!
//! This crate provides:
//! - A sharded LRU cache holding one canonical instance per [`Key`]
//! - Thread-bound [`Transaction`]s with fail-fast per-node write locks
//! - Lazy, segmented and grouped child collections over relational queries
//! - Commit notification through [`NodeChangeListener`]s
//!
//! ## Example
//!
//! ```rust,ignore
//! use nodedb_core::{Engine, Mapping, MappingRegistry, NodeState};
//!
//! let mut registry = MappingRegistry::new();
//! registry.register(Mapping::embedded("page").build())?;
//! let engine = Engine::builder().mappings(registry).build()?;
//!
//! let page = engine.transaction(|_| {
//!     let page = engine.create_node("page")?;
//!     page.set_string("title", "Hello")?;
//!     engine.root()?.add_child(&page)?;
//!     Ok(page)
//! })?;
//! assert_eq!(page.state(), NodeState::Clean);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cache;
mod change_feed;
mod children;
mod codec;
mod config;
mod engine;
mod error;
mod handle;
mod hooks;
mod key;
pub mod mapping;
mod node;
mod state;
mod stats;
mod transaction;
mod types;
mod value;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeSet, ChangeType, NodeChangeListener};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, IdGenerator, UuidIdGenerator};
pub use error::{CoreError, CoreResult};
pub use handle::Handle;
pub use hooks::{Hook, NoopContext, RequestContext};
pub use key::Key;
pub use mapping::{
    ColumnType, Constraint, IdStrategy, LocalField, Mapping, MappingKind, MappingRegistry,
    Relation, RelationKind, Storage, TableSpec,
};
pub use node::Node;
pub use state::NodeState;
pub use stats::{EngineStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionState};
pub use types::{now_millis, SequenceNumber, TransactionId};
pub use value::{Property, PropertyKind, Value};
