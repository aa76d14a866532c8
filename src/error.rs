//! Error types for stratakv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for stratakv operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Format / Integrity Errors
    // -------------------------------------------------------------------------
    #[error("File is not a valid stratakv file: {0}")]
    InvalidFormat(String),

    #[error("Database corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("No matching key/value pair found")]
    NotFound,

    #[error("Requested page {0} not found")]
    PageNotFound(u64),

    #[error("Key/value pair already exists")]
    KeyExists,

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Map size limit reached")]
    MapFull,

    #[error("Maximum number of open buckets reached")]
    BucketFull,

    #[error("Maximum number of readers reached")]
    ReadersFull,

    #[error("Transaction has too many dirty pages")]
    TransactionTooBig,

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Bad transaction: {0}")]
    BadTransaction(String),

    #[error("Bucket handle is invalid or was dropped")]
    BadBucket,

    #[error("Cursor used after its transaction state changed")]
    StaleCursor,

    #[error("Bad key/value size: {0}")]
    BadValueSize(String),

    #[error("Operation and bucket flags are incompatible")]
    IncompatibleFlags,

    #[error("Write attempted in a read-only transaction")]
    ReadOnly,

    #[error("Another write transaction is active")]
    Busy,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StrataError {
    /// Whether a write transaction that hit this error may have been left
    /// half-modified and must be aborted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::Io(_)
                | StrataError::Corrupted(_)
                | StrataError::PageNotFound(_)
                | StrataError::MapFull
                | StrataError::TransactionTooBig
                | StrataError::Serialization(_)
        )
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}
