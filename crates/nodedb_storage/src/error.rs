//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The record log is corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A record with this id already exists.
    #[error("duplicate record id: {0}")]
    DuplicateId(String),

    /// The referenced table does not exist.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The referenced sequence does not exist.
    #[error("unknown sequence: {0}")]
    UnknownSequence(String),

    /// A statement could not be executed.
    #[error("statement failed: {0}")]
    Statement(String),

    /// A row violates a table constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl StorageError {
    /// Creates a statement failure.
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement(message.into())
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
