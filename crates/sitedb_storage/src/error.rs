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

    /// Attempted to truncate past the end of storage.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncatePastEnd {
        /// The requested size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// A frame payload does not fit the length field.
    #[error("frame payload too large: {len} bytes")]
    FrameTooLarge {
        /// Payload length in bytes.
        len: usize,
    },

    /// The storage is corrupted beyond the recoverable tail.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
