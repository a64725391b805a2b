//! Source watermarks and schema checksums.

use crate::error::CoreResult;
use crate::kv::{KvOp, KvStore};
use serde::{Deserialize, Serialize};
use sitedb_codec::{decode_key, encode_text, from_cbor, to_cbor};
use std::sync::Arc;

const SOURCES_SPACE: &str = "meta/sources";
const SCHEMA_SPACE: &str = "meta/schema";

#[derive(Debug, Serialize, Deserialize)]
struct SyncState {
    url: String,
    version: u64,
}

/// Per-source watermarks: the highest history version fully applied.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    kv: Arc<KvStore>,
}

impl SyncStateStore {
    /// Creates the store over a shared keyspace store.
    #[must_use]
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Returns the watermark of a source, 0 when unseen.
    ///
    /// # Errors
    ///
    /// Fails if the stored state cannot be decoded.
    pub fn get(&self, url: &str) -> CoreResult<u64> {
        match self.kv.get(SOURCES_SPACE, &encode_text(url)) {
            Some(bytes) => Ok(from_cbor::<SyncState>(&bytes)?.version),
            None => Ok(0),
        }
    }

    /// Raises the watermark to `version`; lower values are ignored.
    ///
    /// Returns the watermark after the call.
    ///
    /// # Errors
    ///
    /// Fails if the state cannot be encoded or logged.
    pub fn advance(&self, url: &str, version: u64) -> CoreResult<u64> {
        let key = encode_text(url);
        let state = to_cbor(&SyncState {
            url: url.to_string(),
            version,
        })?;
        self.kv.transact(|view| {
            if let Some(bytes) = view.get(SOURCES_SPACE, &key) {
                let current = from_cbor::<SyncState>(bytes)?.version;
                if version <= current {
                    return Ok((Vec::new(), current));
                }
            }
            Ok((vec![KvOp::put(SOURCES_SPACE, key.clone(), state)], version))
        })
    }

    /// Overwrites the watermark unconditionally.
    ///
    /// # Errors
    ///
    /// Fails if the state cannot be encoded or logged.
    pub fn set(&self, url: &str, version: u64) -> CoreResult<()> {
        let state = to_cbor(&SyncState {
            url: url.to_string(),
            version,
        })?;
        self.kv
            .apply(vec![KvOp::put(SOURCES_SPACE, encode_text(url), state)])
    }

    /// Forgets a source.
    ///
    /// # Errors
    ///
    /// Fails if the batch cannot be logged.
    pub fn remove(&self, url: &str) -> CoreResult<()> {
        self.kv
            .apply(vec![KvOp::delete(SOURCES_SPACE, encode_text(url))])
    }

    /// Resets every known watermark to 0 in one batch.
    ///
    /// # Errors
    ///
    /// Fails if the batch cannot be logged.
    pub fn reset_all(&self) -> CoreResult<()> {
        let mut ops = Vec::new();
        for (url, _) in self.list()? {
            let state = to_cbor(&SyncState {
                url: url.clone(),
                version: 0,
            })?;
            ops.push(KvOp::put(SOURCES_SPACE, encode_text(&url), state));
        }
        self.kv.apply(ops)
    }

    /// Every known source with its watermark, ordered by url.
    ///
    /// # Errors
    ///
    /// Fails if a stored state cannot be decoded.
    pub fn list(&self) -> CoreResult<Vec<(String, u64)>> {
        self.kv.read(|view| {
            view.keys(SOURCES_SPACE)
                .filter_map(|key| view.get(SOURCES_SPACE, key))
                .map(|bytes| -> CoreResult<(String, u64)> {
                    let state: SyncState = from_cbor(bytes)?;
                    Ok((state.url, state.version))
                })
                .collect::<CoreResult<Vec<_>>>()
        })
    }
}

/// Stored schema checksums, keyed by table name.
#[derive(Debug, Clone)]
pub struct ChecksumStore {
    kv: Arc<KvStore>,
}

impl ChecksumStore {
    /// Creates the store over a shared keyspace store.
    #[must_use]
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Checksum recorded for `table` on a previous open.
    ///
    /// # Errors
    ///
    /// Fails if the stored value is not text.
    pub fn get(&self, table: &str) -> CoreResult<Option<String>> {
        self.kv
            .get(SCHEMA_SPACE, &encode_text(table))
            .map(|bytes| -> CoreResult<String> {
                let value = decode_key(&bytes)?;
                Ok(value.as_text().unwrap_or_default().to_string())
            })
            .transpose()
    }

    /// Records the checksums of several tables in one batch.
    ///
    /// # Errors
    ///
    /// Fails if the batch cannot be logged.
    pub fn set_all<'a>(&self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> CoreResult<()> {
        let ops = entries
            .into_iter()
            .map(|(table, sum)| KvOp::put(SCHEMA_SPACE, encode_text(table), encode_text(sum)))
            .collect();
        self.kv.apply(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn kv() -> Arc<KvStore> {
        Arc::new(KvStore::open_in_memory(StoreConfig::default()).unwrap())
    }

    #[test]
    fn unseen_source_is_zero() {
        let s = SyncStateStore::new(kv());
        assert_eq!(s.get("dweb://a").unwrap(), 0);
    }

    #[test]
    fn advance_never_regresses() {
        let s = SyncStateStore::new(kv());
        assert_eq!(s.advance("dweb://a", 3).unwrap(), 3);
        assert_eq!(s.advance("dweb://a", 2).unwrap(), 3);
        assert_eq!(s.get("dweb://a").unwrap(), 3);
        assert_eq!(s.advance("dweb://a", 7).unwrap(), 7);
    }

    #[test]
    fn reset_and_remove() {
        let s = SyncStateStore::new(kv());
        s.set("dweb://a", 5).unwrap();
        s.set("dweb://b", 9).unwrap();
        s.reset_all().unwrap();
        assert_eq!(
            s.list().unwrap(),
            vec![("dweb://a".to_string(), 0), ("dweb://b".to_string(), 0)]
        );
        s.remove("dweb://a").unwrap();
        assert_eq!(s.list().unwrap().len(), 1);
    }

    #[test]
    fn checksums_round_trip() {
        let c = ChecksumStore::new(kv());
        assert!(c.get("people").unwrap().is_none());
        c.set_all([("people", "abc"), ("posts", "def")]).unwrap();
        assert_eq!(c.get("people").unwrap().as_deref(), Some("abc"));
        assert_eq!(c.get("posts").unwrap().as_deref(), Some("def"));
    }
}
