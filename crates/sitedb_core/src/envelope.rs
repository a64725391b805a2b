//! The stored unit of an indexed document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// A document together with where it came from.
///
/// `url` is the primary key and always starts with `origin`. Helper-table
/// rows have an empty origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    /// Absolute URL of the document (primary key).
    pub url: String,
    /// Root identifier of the source the document belongs to.
    pub origin: String,
    /// Milliseconds since the Unix epoch when the row was written.
    pub indexed_at: u64,
    /// The document after preprocessing.
    pub record: Value,
}

impl RecordEnvelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(url: impl Into<String>, origin: impl Into<String>, record: Value) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
            indexed_at: now_millis(),
            record,
        }
    }

    /// Path of the document inside its source (`url` minus `origin`).
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.strip_prefix(&self.origin).unwrap_or(&self.url)
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Returns `scheme://host` of a URL, or `None` if it has no scheme.
#[must_use]
pub fn origin_of(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")?;
    let host_start = scheme_end + 3;
    let host_end = url[host_start..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |i| host_start + i);
    if host_end == host_start {
        return None;
    }
    Some(&url[..host_end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_strips_origin() {
        let env = RecordEnvelope::new("dweb://alice/posts/1.json", "dweb://alice", json!({}));
        assert_eq!(env.path(), "/posts/1.json");
        assert!(env.indexed_at > 0);
    }

    #[test]
    fn origin_parsing() {
        assert_eq!(origin_of("dweb://alice/a/b.json"), Some("dweb://alice"));
        assert_eq!(origin_of("dweb://alice"), Some("dweb://alice"));
        assert_eq!(origin_of("https://x.org?q=1"), Some("https://x.org"));
        assert_eq!(origin_of("no-scheme/path"), None);
        assert_eq!(origin_of("dweb:///path"), None);
    }
}
