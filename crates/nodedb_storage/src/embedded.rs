//! Embedded record store trait.

use crate::error::StorageResult;

/// An embedded key-value store for entity records.
///
/// Embedded stores are **opaque record stores**. The engine owns the record
/// encoding; a store only maps string ids to payload bytes and hands out
/// fresh ids.
///
/// # Invariants
///
/// - `get` returns exactly the bytes last written for an id
/// - `next_id` never returns the same id twice, including across restarts
///   of a durable store
/// - Implementations must be `Send + Sync`; the engine calls them from
///   any worker thread
pub trait EmbeddedStore: Send + Sync {
    /// Loads the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::DuplicateId`] if a record already
    /// exists under `id`, or an I/O error.
    fn insert(&self, id: &str, record: &[u8]) -> StorageResult<()>;

    /// Replaces an existing record, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn update(&self, id: &str, record: &[u8]) -> StorageResult<()>;

    /// Removes a record. Removing an absent id is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn delete(&self, id: &str) -> StorageResult<()>;

    /// Generates the next unused id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id sequence cannot be persisted.
    fn next_id(&self) -> StorageResult<String>;

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;

    /// Returns the number of live records.
    fn len(&self) -> usize;

    /// Returns true if the store holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
