//! Error types for the database facade.

use crate::source::SourceError;
use sitedb_codec::CodecError;
use sitedb_core::CoreError;
use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced by [`SiteDb`](crate::SiteDb), tables and queries.
#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed call arguments.
    #[error("parameter error: {message}")]
    Parameter {
        /// Description of the problem.
        message: String,
    },

    /// Illegal schema, or an operation in the wrong lifecycle state.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the problem.
        message: String,
    },

    /// A record was rejected by its table's validator.
    #[error("record {url} did not pass validation")]
    ValidationFailed {
        /// Url of the rejected record.
        url: String,
    },

    /// A source did not answer in time.
    #[error("source timed out during {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Write to a source that is unknown or not owned.
    #[error("write rejected: {message}")]
    WriteRejected {
        /// Why the write was refused.
        message: String,
    },

    /// Non-timeout source failure.
    #[error("source error: {message}")]
    Source {
        /// Description from the source.
        message: String,
    },

    /// A document is not valid JSON.
    #[error("failed to parse {url}: {message}")]
    Parse {
        /// Url of the document.
        url: String,
        /// Parser message.
        message: String,
    },

    /// The database is not open.
    #[error("database is closed")]
    Closed,

    /// Storage engine error.
    #[error(transparent)]
    Core(CoreError),

    /// Key codec error.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl DbError {
    /// Creates a parameter error.
    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter {
            message: message.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a write-rejected error.
    pub fn write_rejected(message: impl Into<String>) -> Self {
        Self::WriteRejected {
            message: message.into(),
        }
    }

    /// Returns true for source timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Source { .. })
    }
}

impl From<CoreError> for DbError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidArgument { message } => Self::Parameter { message },
            CoreError::UnknownIndex { table, index } => Self::Parameter {
                message: format!("unknown index '{index}' on table '{table}'"),
            },
            CoreError::Schema { message } => Self::Schema { message },
            CoreError::Codec(e) => Self::Codec(e),
            other => Self::Core(other),
        }
    }
}

impl From<SourceError> for DbError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Timeout { operation } => Self::Timeout { operation },
            SourceError::ReadOnly => Self::write_rejected("source is not writable"),
            other => Self::Source {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        let timeout = DbError::from(SourceError::Timeout {
            operation: "history".into(),
        });
        assert!(timeout.is_timeout());
        assert!(timeout.is_retryable());

        let io = DbError::from(SourceError::Io {
            message: "disk".into(),
        });
        assert!(!io.is_timeout());
        assert!(io.is_retryable());

        assert!(!DbError::parameter("bad").is_retryable());
        assert!(!DbError::Closed.is_timeout());
    }

    #[test]
    fn core_errors_map_to_taxonomy() {
        let err = DbError::from(CoreError::unknown_index("t", "nope"));
        assert!(matches!(err, DbError::Parameter { .. }));
        let err = DbError::from(CoreError::schema("bad"));
        assert!(matches!(err, DbError::Schema { .. }));
        let err = DbError::from(CoreError::DatabaseLocked);
        assert!(matches!(err, DbError::Core(CoreError::DatabaseLocked)));
    }

    #[test]
    fn read_only_is_write_rejected() {
        assert!(matches!(
            DbError::from(SourceError::ReadOnly),
            DbError::WriteRejected { .. }
        ));
    }
}
