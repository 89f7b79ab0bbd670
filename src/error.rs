//! Error types for the index engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur in the index engine
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup or delete of an entry that is not in the tree
    #[error("Key not found")]
    KeyNotFound,

    /// Unique-mode insert of a key that is already present
    #[error("Duplicate key: {0}")]
    DuplicateKey(i64),

    /// Iterator used after the transaction that created it ended
    #[error("Iterator invalidated: the owning transaction committed or rolled back")]
    IteratorInvalidatedByCommit,

    /// Iterator used after the tree was mutated under it
    #[error("Concurrent modification: the tree changed under an open iterator")]
    ConcurrentModification,

    /// Requested page id is unknown to both the buffer manager and the channel
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    /// Data corruption detected (bad page image, checksum mismatch)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Internal contract broken; a bug in the engine, not a user error
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Rejected tree or database configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Database file is corrupted or has an incompatible format
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),
}

impl IndexError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invariant-violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an invalid-configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid-database-file error
    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }
}
