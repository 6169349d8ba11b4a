//! Engine statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = engine.stats();
//! println!("hits: {} misses: {}", stats.cache_hits, stats.cache_misses);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters.
///
/// All counters are atomic and monotonically increasing; they can be read
/// while operations are in progress.
#[derive(Debug, Default)]
pub struct EngineStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    negative_hits: AtomicU64,
    fetches: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    prefetch_batches: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    conflicts: AtomicU64,
    hook_failures: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a shared cache hit.
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a shared cache miss.
    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a lookup answered by a negative cache entry.
    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a single-node fetch from a backing store.
    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an insert.
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an update.
    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delete.
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a batched prefetch query.
    pub fn record_prefetch(&self) {
        self.prefetch_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a committed transaction.
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an aborted transaction.
    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rejected write lock.
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a swallowed hook failure.
    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            prefetch_batches: self.prefetch_batches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Shared cache hits.
    pub cache_hits: u64,
    /// Shared cache misses.
    pub cache_misses: u64,
    /// Lookups answered by a negative entry.
    pub negative_hits: u64,
    /// Single-node store fetches.
    pub fetches: u64,
    /// Nodes inserted.
    pub inserts: u64,
    /// Nodes updated.
    pub updates: u64,
    /// Nodes deleted.
    pub deletes: u64,
    /// Batched prefetch queries.
    pub prefetch_batches: u64,
    /// Committed transactions.
    pub commits: u64,
    /// Aborted transactions.
    pub aborts: u64,
    /// Rejected write locks.
    pub conflicts: u64,
    /// Swallowed hook failures.
    pub hook_failures: u64,
}

impl StatsSnapshot {
    /// Returns the fraction of lookups served from the cache.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let stats = EngineStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_commit();
        stats.record_conflict();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.conflicts, 1);
        assert_eq!(snapshot.aborts, 0);
    }

    #[test]
    fn hit_ratio() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
        let snapshot = StatsSnapshot {
            cache_hits: 3,
            cache_misses: 1,
            ..StatsSnapshot::default()
        };
        assert!((snapshot.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
