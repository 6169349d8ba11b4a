//! Error types for nodedb core.

use crate::state::NodeState;
use crate::types::TransactionId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in nodedb core operations.
///
/// A node that does not exist is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backing store failure (I/O or statement error).
    #[error("storage error: {0}")]
    Storage(#[from] nodedb_storage::StorageError),

    /// Record encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Another active transaction holds the node's write lock.
    #[error("node {node} is locked by {holder}")]
    ConcurrencyConflict {
        /// The contended node.
        node: String,
        /// The transaction holding the lock.
        holder: TransactionId,
    },

    /// The node was deleted or evicted by a committed transaction.
    #[error("node {node} has been invalidated, fetch it again")]
    Invalidated {
        /// The invalidated node.
        node: String,
    },

    /// The transaction's deadline has passed.
    #[error("{transaction} timed out")]
    Timeout {
        /// The expired transaction.
        transaction: TransactionId,
    },

    /// The operation requires a transaction bound to the calling thread.
    #[error("no transaction is active on this thread")]
    NoTransaction,

    /// The transaction has already been committed or aborted.
    #[error("{transaction} is no longer active")]
    TransactionInactive {
        /// The finished transaction.
        transaction: TransactionId,
    },

    /// A lifecycle state change that is never allowed.
    #[error("illegal node state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// The current state.
        from: NodeState,
        /// The rejected target state.
        to: NodeState,
    },

    /// A collection already contains a different node under this name.
    #[error("an object named {name:?} is already contained in {parent}")]
    DuplicateName {
        /// The contested access name.
        name: String,
        /// The collection owner.
        parent: String,
    },

    /// No mapping is registered under this name.
    #[error("mapping not found: {name}")]
    MappingNotFound {
        /// Name of the mapping.
        name: String,
    },

    /// The engine has been shut down.
    #[error("engine is closed")]
    EngineClosed,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalidated-node error.
    pub fn invalidated(node: impl Into<String>) -> Self {
        Self::Invalidated { node: node.into() }
    }

    /// Creates a duplicate access name error.
    pub fn duplicate_name(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self::DuplicateName {
            name: name.into(),
            parent: parent.into(),
        }
    }

    /// Creates a mapping not found error.
    pub fn mapping_not_found(name: impl Into<String>) -> Self {
        Self::MappingNotFound { name: name.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the operation after backing off.
    ///
    /// Only lock conflicts qualify. The engine never retries internally.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Returns true if the current transaction must be aborted.
    #[must_use]
    pub fn is_fatal_to_transaction(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Invalidated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = CoreError::ConcurrencyConflict {
            node: "story/1".into(),
            holder: TransactionId::new(3),
        };
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal_to_transaction());

        let timeout = CoreError::Timeout {
            transaction: TransactionId::new(3),
        };
        assert!(!timeout.is_retryable());
        assert!(timeout.is_fatal_to_transaction());
        assert!(CoreError::invalidated("x").is_fatal_to_transaction());
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = nodedb_storage::StorageError::Locked.into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(err.to_string().starts_with("storage error"));
    }
}
