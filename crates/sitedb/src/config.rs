//! Configuration for the database and its indexer.

use sitedb_core::StoreConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for source reconciliation.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Timeout for source metadata, history and document reads.
    pub read_timeout: Duration,
    /// Fixed wait between attempts while a newly added source is unreachable.
    pub retry_interval: Duration,
    /// Whether sources are watched for changes unless told otherwise.
    pub watch: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(30),
            watch: true,
        }
    }
}

impl IndexerConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the retry interval.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the default watch behaviour.
    #[must_use]
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

/// Where the database keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// Volatile, in memory.
    Memory,
    /// A directory on disk.
    Path(PathBuf),
}

/// Configuration for a [`SiteDb`](crate::SiteDb).
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Storage location.
    pub location: StorageLocation,
    /// Keyspace store settings.
    pub store: StoreConfig,
    /// Indexer settings.
    pub indexer: IndexerConfig,
}

impl DbConfig {
    /// An in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            location: StorageLocation::Memory,
            store: StoreConfig::default(),
            indexer: IndexerConfig::default(),
        }
    }

    /// A database stored in `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StorageLocation::Path(path.into()),
            ..Self::in_memory()
        }
    }

    /// Sets the store config.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the indexer config.
    #[must_use]
    pub fn with_indexer(mut self, indexer: IndexerConfig) -> Self {
        self.indexer = indexer;
        self
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DbConfig::default();
        assert_eq!(config.location, StorageLocation::Memory);
        assert_eq!(config.indexer.read_timeout, Duration::from_secs(30));
        assert_eq!(config.indexer.retry_interval, Duration::from_secs(30));
        assert!(config.indexer.watch);
    }

    #[test]
    fn builders() {
        let config = DbConfig::at("/tmp/db").with_indexer(
            IndexerConfig::new()
                .with_read_timeout(Duration::from_millis(5))
                .with_watch(false),
        );
        assert_eq!(config.location, StorageLocation::Path("/tmp/db".into()));
        assert_eq!(config.indexer.read_timeout, Duration::from_millis(5));
        assert!(!config.indexer.watch);
    }
}
