//! Error types for PeerFeed

use thiserror::Error;

/// Main error type for PeerFeed operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Post was not found in the all-known view
    #[error("Post not found: {0}")]
    PostNotFound(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream open/read/write failure or peer unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed peer identifier, key material, or signature encoding
    #[error("Identity error: {0}")]
    Identity(String),

    /// Caller supplied input the operation cannot accept
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
