//! Concurrency stress helpers.
//!
//! These drive one engine from many threads and report what happened, so
//! tests can assert on identity and locking behavior under contention.

use nodedb_core::{CoreError, CoreResult, Engine, Key, Node};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Operations that completed.
    pub successful_ops: usize,
    /// Operations that failed for good.
    pub failed_ops: usize,
    /// Attempts rejected with a lock conflict and retried.
    pub conflicts: usize,
    /// Total duration.
    pub duration: Duration,
    /// Completed operations per second.
    pub ops_per_second: f64,
}

impl StressResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, conflicts: usize, duration: Duration) -> Self {
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            successful as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            successful_ops: successful,
            failed_ops: failed,
            conflicts,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Fetches `key` from `threads` threads at once and returns every instance
/// they got back, in thread order.
///
/// # Errors
///
/// Returns the first fetch error.
pub fn concurrent_fetch(engine: &Engine, key: &Key, threads: usize) -> CoreResult<Vec<Option<Arc<Node>>>> {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| scope.spawn(|| engine.get_node_by_key(key)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result,
                Err(_) => Err(CoreError::invalid_operation("fetch thread panicked")),
            })
            .collect()
    })
}

/// Returns true if every fetched instance is the same object.
pub fn all_same_instance(nodes: &[Option<Arc<Node>>]) -> bool {
    let mut present = nodes.iter().flatten();
    match present.next() {
        Some(first) => present.all(|n| Arc::ptr_eq(first, n)) && nodes.iter().all(Option::is_some),
        None => true,
    }
}

/// Increments the integer property `property` of the node at `key`
/// `rounds` times from each of `threads` threads.
///
/// Each increment runs in its own transaction. Attempts rejected with a
/// retryable error back off briefly and run again. The lock is taken by
/// writing `touched` before the counter is read, so no increment is lost.
pub fn contended_increments(
    engine: &Engine,
    key: &Key,
    property: &str,
    threads: usize,
    rounds: usize,
) -> StressResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let (successful, failed, conflicts) = (&successful, &failed, &conflicts);
            scope.spawn(move || {
                for _ in 0..rounds {
                    loop {
                        match increment_once(engine, key, property, t) {
                            Ok(()) => {
                                successful.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(err) if err.is_retryable() => {
                                conflicts.fetch_add(1, Ordering::Relaxed);
                                thread::sleep(Duration::from_micros(200));
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "increment failed");
                                failed.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    StressResult::new(
        successful.into_inner(),
        failed.into_inner(),
        conflicts.into_inner(),
        start.elapsed(),
    )
}

fn increment_once(engine: &Engine, key: &Key, property: &str, thread: usize) -> CoreResult<()> {
    engine.transaction(|_| {
        let node = engine
            .get_node_by_key(key)?
            .ok_or_else(|| CoreError::invalid_operation(format!("{key} not found")))?;
        node.set_integer("touched", thread as i64)?;
        let current = node.get_integer(property).unwrap_or(0);
        node.set_integer(property, current + 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fetches_are_uniform() {
        assert!(all_same_instance(&[]));
        assert!(all_same_instance(&[None, None]));
    }

    #[test]
    fn throughput_counts_successes_only() {
        let result = StressResult::new(10, 5, 3, Duration::from_secs(2));
        assert!((result.ops_per_second - 5.0).abs() < f64::EPSILON);
    }
}
