//! The content source boundary.
//!
//! A source is a versioned file store that the indexer tracks. Every write
//! to a source bumps its version and appends an entry to its history; the
//! indexer replays that history to keep the index current.

use async_trait::async_trait;
use sitedb_core::FilePatterns;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors reported by a source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The source did not answer in time.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// The file does not exist.
    #[error("file not found: {path}")]
    NotFound {
        /// Requested path.
        path: String,
    },

    /// The source refuses writes from this user.
    #[error("source is read-only")]
    ReadOnly,

    /// Any other failure.
    #[error("{message}")]
    Io {
        /// Description.
        message: String,
    },
}

impl SourceError {
    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

/// Source metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// Current version (number of changes so far).
    pub version: u64,
    /// Whether the local user may write to the source.
    pub is_owner: bool,
}

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// File written.
    Put,
    /// File removed.
    Del,
}

/// One change in a source's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Absolute path inside the source, starting with `/`.
    pub path: String,
    /// Version the change produced.
    pub version: u64,
    /// Put or delete.
    pub kind: ChangeKind,
}

/// A live change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotice {
    /// The local copy of `path` is stale and should be fetched.
    Invalidated {
        /// Affected path.
        path: String,
    },
    /// `path` changed and the index should catch up.
    Changed {
        /// Affected path.
        path: String,
    },
}

/// A stream of change notifications. Closing or dropping it unsubscribes.
pub struct ChangeStream {
    rx: UnboundedReceiver<ChangeNotice>,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("closed", &self.on_close.is_none())
            .finish()
    }
}

impl ChangeStream {
    /// Wraps a receiver; `on_close` runs once when the stream is closed.
    pub fn new(
        rx: UnboundedReceiver<ChangeNotice>,
        on_close: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Waits for the next notice. Returns `None` once closed.
    pub async fn recv(&mut self) -> Option<ChangeNotice> {
        self.rx.recv().await
    }

    /// Unsubscribes. Further calls are no-ops.
    pub fn close(&mut self) {
        self.rx.close();
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// A versioned file store the indexer can track.
///
/// Implementations must be cheap to share; the indexer keeps them in an
/// `Arc` and calls them from background tasks.
#[async_trait]
pub trait Source: Send + Sync {
    /// Root identifier, `scheme://host`. Record urls are `url() + path`.
    fn url(&self) -> &str;

    /// Current version and ownership.
    async fn get_info(&self) -> SourceResult<SourceInfo>;

    /// Changes with `start <= version < end`, in version order.
    async fn history(&self, start: u64, end: u64) -> SourceResult<Vec<HistoryEntry>>;

    /// Reads a file.
    async fn read_file(&self, path: &str) -> SourceResult<Vec<u8>>;

    /// Writes a file.
    async fn write_file(&self, path: &str, data: &[u8]) -> SourceResult<()>;

    /// Removes a file.
    async fn unlink(&self, path: &str) -> SourceResult<()>;

    /// Lists paths under `path`, relative to it.
    async fn readdir(&self, path: &str, recursive: bool) -> SourceResult<Vec<String>>;

    /// Subscribes to changes of files matching `patterns`.
    fn create_change_stream(&self, patterns: &FilePatterns) -> ChangeStream;
}
