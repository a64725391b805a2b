//! Store configuration.

/// Configuration for the keyspace store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to fsync after every committed batch.
    ///
    /// Default: `true`
    pub sync_on_write: bool,

    /// Number of entries fetched per step of a lazy range scan.
    ///
    /// Smaller values hold the read lock for less time; larger values
    /// reduce per-step overhead. Default: 64
    pub scan_batch_size: usize,

    /// Log size in bytes after which the log is rewritten as a snapshot.
    ///
    /// `None` disables compaction. Default: 8 MiB
    pub compaction_threshold: Option<u64>,

    /// Create the database directory if it does not exist.
    ///
    /// Default: `true`
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            scan_batch_size: 64,
            compaction_threshold: Some(8 * 1024 * 1024),
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether each batch is synced to disk.
    #[must_use]
    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the lazy scan batch size (minimum 1).
    #[must_use]
    pub fn scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size.max(1);
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn compaction_threshold(mut self, bytes: Option<u64>) -> Self {
        self.compaction_threshold = bytes;
        self
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.sync_on_write);
        assert_eq!(config.scan_batch_size, 64);
        assert_eq!(config.compaction_threshold, Some(8 * 1024 * 1024));
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .sync_on_write(false)
            .scan_batch_size(0)
            .compaction_threshold(None);

        assert!(!config.sync_on_write);
        assert_eq!(config.scan_batch_size, 1);
        assert_eq!(config.compaction_threshold, None);
    }
}
