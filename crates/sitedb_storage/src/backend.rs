//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level, append-only byte store.
///
/// Backends do not interpret what they hold; framing and replay live in
/// [`crate::AppendLog`].
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns every byte appended and not truncated
/// - `sync` makes all appended data durable
/// - `replace` swaps the whole content atomically (all old bytes or all new)
pub trait StorageBackend: Send + Sync {
    /// Reads the entire content.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Used to drop a torn tail found during replay.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` exceeds the current size or the I/O fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole content with `data`.
    ///
    /// Used by log compaction.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs; the old content is kept.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
