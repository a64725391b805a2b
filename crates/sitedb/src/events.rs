//! Database and table lifecycle events.

use sitedb_core::RecordEnvelope;

/// Signals emitted by a [`SiteDb`](crate::SiteDb).
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    /// A newly added source could not be reached; retrying in the background.
    SourceMissing {
        /// Source url.
        url: String,
    },
    /// A source that was missing has been reached and indexed.
    SourceFound {
        /// Source url.
        url: String,
    },
    /// A source failed in a way that is not retried.
    SourceError {
        /// Source url.
        url: String,
        /// Error description.
        message: String,
    },
    /// A reconciliation pass started.
    SourceIndexing {
        /// Source url.
        url: String,
        /// Watermark before the pass.
        from: u64,
        /// Live version being caught up to.
        to: u64,
    },
    /// One change of a pass was applied.
    SourceIndexProgress {
        /// Source url.
        url: String,
        /// Changes applied so far.
        tick: usize,
        /// Changes in the pass.
        total: usize,
    },
    /// A reconciliation pass finished, possibly with nothing to do.
    SourceIndexed {
        /// Source url.
        url: String,
        /// Watermark after the pass.
        version: u64,
    },
    /// A pass applied at least one change.
    IndexesUpdated {
        /// Source url.
        url: String,
        /// Watermark after the pass.
        version: u64,
    },
    /// Stored data was cleared because a schema changed.
    IndexesReset {
        /// Tables whose schema changed.
        tables: Vec<String>,
    },
}

impl DbEvent {
    /// The source url the event concerns, if any.
    #[must_use]
    pub fn source_url(&self) -> Option<&str> {
        match self {
            Self::SourceMissing { url }
            | Self::SourceFound { url }
            | Self::SourceError { url, .. }
            | Self::SourceIndexing { url, .. }
            | Self::SourceIndexProgress { url, .. }
            | Self::SourceIndexed { url, .. }
            | Self::IndexesUpdated { url, .. } => Some(url),
            Self::IndexesReset { .. } => None,
        }
    }
}

/// Signals emitted by a [`Table`](crate::Table).
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// A record was stored.
    RecordPut(RecordEnvelope),
    /// A record was removed.
    RecordDeleted(RecordEnvelope),
}

impl TableEvent {
    /// The affected record.
    #[must_use]
    pub fn envelope(&self) -> &RecordEnvelope {
        match self {
            Self::RecordPut(env) | Self::RecordDeleted(env) => env,
        }
    }
}
