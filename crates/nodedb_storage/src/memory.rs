//! In-memory embedded store for testing.

use crate::embedded::EmbeddedStore;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory embedded store.
///
/// This store keeps all records in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral engines that don't need persistence
///
/// # Example
///
/// ```rust
/// use nodedb_storage::{EmbeddedStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// store.insert("1", b"record").unwrap();
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Creates a new empty store. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a store whose id sequence starts at `first_id`.
    #[must_use]
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(first_id),
        }
    }

    /// Returns the ids of all stored records.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Removes every record.
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedStore for MemoryStore {
    fn get(&self, id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn insert(&self, id: &str, record: &[u8]) -> StorageResult<()> {
        let mut records = self.records.write();
        if records.contains_key(id) {
            return Err(StorageError::DuplicateId(id.to_string()));
        }
        records.insert(id.to_string(), record.to_vec());
        Ok(())
    }

    fn update(&self, id: &str, record: &[u8]) -> StorageResult<()> {
        self.records
            .write()
            .insert(id.to_string(), record.to_vec());
        Ok(())
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        self.records.write().remove(id);
        Ok(())
    }

    fn next_id(&self) -> StorageResult<String> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}
