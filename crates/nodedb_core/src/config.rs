//! Engine configuration.

use std::time::Duration;

/// Configuration for building an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of entries in the shared node cache.
    pub cache_capacity: usize,

    /// Number of independently locked cache shards.
    pub cache_shards: usize,

    /// How long a transaction may run before lock checks fail.
    pub transaction_timeout: Duration,

    /// Window size for segmented child collections.
    pub segment_size: usize,

    /// Whether to emit a debug event for every relational statement.
    pub log_statements: bool,

    /// Prototype name of the root node.
    pub root_prototype: String,

    /// Id of the root node.
    pub root_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_shards: 16,
            transaction_timeout: Duration::from_secs(30),
            segment_size: 1_000,
            log_statements: true,
            root_prototype: "root".to_string(),
            root_id: "0".to_string(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the number of cache shards.
    #[must_use]
    pub const fn cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    /// Sets the transaction timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the segment window size.
    #[must_use]
    pub const fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets whether relational statements are logged.
    #[must_use]
    pub const fn log_statements(mut self, value: bool) -> Self {
        self.log_statements = value;
        self
    }

    /// Sets the root node's prototype and id.
    #[must_use]
    pub fn root(mut self, prototype: impl Into<String>, id: impl Into<String>) -> Self {
        self.root_prototype = prototype.into();
        self.root_id = id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_capacity, 10_000);
        assert_eq!(config.cache_shards, 16);
        assert_eq!(config.transaction_timeout, Duration::from_secs(30));
        assert_eq!(config.root_id, "0");
        assert!(config.log_statements);
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .cache_capacity(64)
            .segment_size(10)
            .log_statements(false)
            .root("site", "1");

        assert_eq!(config.cache_capacity, 64);
        assert_eq!(config.segment_size, 10);
        assert!(!config.log_statements);
        assert_eq!(config.root_prototype, "site");
    }
}
