//! # nodedb Storage
//!
//! Backing stores for the nodedb object cache.
//!
//! Two kinds of store sit underneath the engine:
//!
//! - **Embedded stores** are opaque record stores keyed by a string id.
//!   They never interpret the payloads they hold.
//! - **Relational connections** execute structured [`Statement`]s against
//!   tables of [`Row`]s and report an [`Outcome`].
//!
//! ## Available Backends
//!
//! - [`MemoryStore`] - ephemeral embedded store for tests
//! - [`FileStore`] - append-only record log in a locked directory
//! - [`MemoryDatabase`] - in-memory relational tables with a statement log
//!
//! ## Example
//!
//! ```rust
//! use nodedb_storage::{EmbeddedStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let id = store.next_id().unwrap();
//! store.insert(&id, b"payload").unwrap();
//! assert_eq!(store.get(&id).unwrap().as_deref(), Some(&b"payload"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod embedded;
mod error;
mod file;
mod memory;
mod memory_sql;
mod sql;

pub use embedded::EmbeddedStore;
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use memory_sql::MemoryDatabase;
pub use sql::{
    Condition, Outcome, Projection, RelationalConnection, Row, Select, SortKey, SqlValue, Statement,
};
