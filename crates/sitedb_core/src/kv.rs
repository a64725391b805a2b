//! Named keyspaces over an append-only log.
//!
//! All keyspaces live in memory as ordered maps. Every mutation is a batch
//! of [`KvOp`]s that is framed, appended to the log and only then applied
//! to memory, all under one write lock. Readers never see part of a batch.
//! Opening a store replays the log; compaction rewrites it as a snapshot.

use crate::config::StoreConfig;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::range::{Direction, KeyRange};
use parking_lot::{Mutex, RwLock};
use sitedb_storage::{AppendLog, FileBackend, InMemoryBackend, StorageBackend};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use tracing::{debug, info};

const BATCH_VERSION: u8 = 1;

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Insert or overwrite a key.
    Put {
        /// Keyspace name.
        space: String,
        /// Raw key.
        key: Vec<u8>,
        /// Raw value.
        value: Vec<u8>,
    },
    /// Remove a key (no-op if absent).
    Delete {
        /// Keyspace name.
        space: String,
        /// Raw key.
        key: Vec<u8>,
    },
    /// Remove every key in a keyspace.
    Clear {
        /// Keyspace name.
        space: String,
    },
}

impl KvOp {
    /// Creates a put operation.
    pub fn put(space: impl Into<String>, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self::Put {
            space: space.into(),
            key,
            value,
        }
    }

    /// Creates a delete operation.
    pub fn delete(space: impl Into<String>, key: Vec<u8>) -> Self {
        Self::Delete {
            space: space.into(),
            key,
        }
    }

    /// Creates a clear operation.
    pub fn clear(space: impl Into<String>) -> Self {
        Self::Clear {
            space: space.into(),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Put { .. } => 1,
            Self::Delete { .. } => 2,
            Self::Clear { .. } => 3,
        }
    }
}

type Spaces = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Read access to every keyspace under one consistent snapshot.
pub struct KvView<'a> {
    spaces: &'a Spaces,
}

impl KvView<'_> {
    /// Returns the value stored at `key`.
    #[must_use]
    pub fn get(&self, space: &str, key: &[u8]) -> Option<&[u8]> {
        self.spaces
            .get(space)
            .and_then(|s| s.get(key))
            .map(Vec::as_slice)
    }

    /// Returns up to `limit` entries of `range` in the given direction.
    #[must_use]
    pub fn scan(
        &self,
        space: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(map) = self.spaces.get(space) else {
            return Vec::new();
        };
        if range.is_empty() {
            return Vec::new();
        }
        let bounds = (as_slice_bound(&range.lower), as_slice_bound(&range.upper));
        let iter = map.range::<[u8], _>(bounds);
        let clone = |(k, v): (&Vec<u8>, &Vec<u8>)| (k.clone(), v.clone());
        match direction {
            Direction::Forward => iter.take(limit).map(clone).collect(),
            Direction::Reverse => iter.rev().take(limit).map(clone).collect(),
        }
    }

    /// Number of keys in a keyspace.
    #[must_use]
    pub fn len(&self, space: &str) -> usize {
        self.spaces.get(space).map_or(0, BTreeMap::len)
    }

    /// Iterates every key of a keyspace in order.
    pub fn keys<'b>(&'b self, space: &str) -> impl Iterator<Item = &'b [u8]> + 'b {
        self.spaces
            .get(space)
            .into_iter()
            .flat_map(|m| m.keys().map(Vec::as_slice))
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The keyspace store.
///
/// # Thread Safety
///
/// Any number of readers run concurrently; batches are serialized by the
/// write lock, which is held across the log append so log order always
/// equals apply order.
pub struct KvStore {
    spaces: RwLock<Spaces>,
    log: Mutex<AppendLog>,
    config: StoreConfig,
    snapshot_bytes: Mutex<u64>,
    _dir: Option<DatabaseDir>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("spaces", &self.spaces.read().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KvStore {
    /// Opens a volatile store backed by memory.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other openers.
    pub fn open_in_memory(config: StoreConfig) -> CoreResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), config)
    }

    /// Opens a store in a directory, taking its exclusive lock.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked, missing (and not created), or the
    /// log cannot be read.
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.log_path())?;
        let mut store = Self::open_with_backend(Box::new(backend), config)?;
        store._dir = Some(dir);
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Opens a store on any backend, replaying its log.
    ///
    /// # Errors
    ///
    /// Fails if the log cannot be read or a batch cannot be decoded.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> CoreResult<Self> {
        let (log, payloads) = AppendLog::open(backend)?;
        let mut spaces = Spaces::new();
        for payload in &payloads {
            for op in decode_batch(payload)? {
                apply_op(&mut spaces, op);
            }
        }
        let snapshot_bytes = log.size()?;
        debug!(batches = payloads.len(), spaces = spaces.len(), "log replayed");
        Ok(Self {
            spaces: RwLock::new(spaces),
            log: Mutex::new(log),
            config,
            snapshot_bytes: Mutex::new(snapshot_bytes),
            _dir: None,
        })
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Runs `f` against a consistent read snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&KvView<'_>) -> T) -> T {
        let spaces = self.spaces.read();
        f(&KvView { spaces: &*spaces })
    }

    /// Returns a copy of the value stored at `key`.
    #[must_use]
    pub fn get(&self, space: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.read(|view| view.get(space, key).map(<[u8]>::to_vec))
    }

    /// Commits a batch atomically.
    ///
    /// # Errors
    ///
    /// Fails if the log append fails; memory is left untouched.
    pub fn apply(&self, batch: Vec<KvOp>) -> CoreResult<()> {
        self.transact(|_| Ok((batch, ())))
    }

    /// Builds and commits a batch under the write lock.
    ///
    /// `f` sees the current state and returns the batch to commit plus a
    /// result. No other batch can commit between the read and the write.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f` (nothing is written) or from the log.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&KvView<'_>) -> CoreResult<(Vec<KvOp>, T)>,
    ) -> CoreResult<T> {
        let mut spaces = self.spaces.write();
        let (batch, out) = f(&KvView { spaces: &*spaces })?;
        if batch.is_empty() {
            return Ok(out);
        }

        let payload = encode_batch(&batch)?;
        let mut log = self.log.lock();
        log.append(&payload, self.config.sync_on_write)?;
        for op in batch {
            apply_op(&mut spaces, op);
        }
        self.maybe_compact(&spaces, &mut log)?;
        Ok(out)
    }

    /// Rewrites the log as a snapshot of the current state.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot cannot be written; the old log stays valid.
    pub fn compact(&self) -> CoreResult<()> {
        let spaces = self.spaces.write();
        let mut log = self.log.lock();
        self.compact_locked(&spaces, &mut log)
    }

    fn maybe_compact(&self, spaces: &Spaces, log: &mut AppendLog) -> CoreResult<()> {
        let Some(threshold) = self.config.compaction_threshold else {
            return Ok(());
        };
        let size = log.size()?;
        // only compact once the log has at least doubled since the last snapshot
        if size > threshold && size > 2 * *self.snapshot_bytes.lock() {
            self.compact_locked(spaces, log)?;
        }
        Ok(())
    }

    fn compact_locked(&self, spaces: &Spaces, log: &mut AppendLog) -> CoreResult<()> {
        let before = log.size()?;
        let mut payloads = Vec::with_capacity(spaces.len());
        for (space, entries) in spaces {
            if entries.is_empty() {
                continue;
            }
            let ops: Vec<KvOp> = entries
                .iter()
                .map(|(k, v)| KvOp::put(space.clone(), k.clone(), v.clone()))
                .collect();
            payloads.push(encode_batch(&ops)?);
        }
        log.rewrite(&payloads)?;
        let after = log.size()?;
        *self.snapshot_bytes.lock() = after;
        info!(before, after, "log compacted");
        Ok(())
    }

    /// Number of keys in a keyspace.
    #[must_use]
    pub fn len(&self, space: &str) -> usize {
        self.read(|view| view.len(space))
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot report its size.
    pub fn log_size(&self) -> CoreResult<u64> {
        Ok(self.log.lock().size()?)
    }
}

fn apply_op(spaces: &mut Spaces, op: KvOp) {
    match op {
        KvOp::Put { space, key, value } => {
            spaces.entry(space).or_default().insert(key, value);
        }
        KvOp::Delete { space, key } => {
            if let Some(map) = spaces.get_mut(&space) {
                map.remove(&key);
            }
        }
        KvOp::Clear { space } => {
            spaces.remove(&space);
        }
    }
}

fn encode_batch(batch: &[KvOp]) -> CoreResult<Vec<u8>> {
    let count = u32::try_from(batch.len())
        .map_err(|_| CoreError::invalid_argument("batch has too many operations"))?;
    let mut buf = Vec::new();
    buf.push(BATCH_VERSION);
    buf.extend_from_slice(&count.to_le_bytes());
    for op in batch {
        buf.push(op.tag());
        match op {
            KvOp::Put { space, key, value } => {
                write_space(&mut buf, space)?;
                write_bytes(&mut buf, key)?;
                write_bytes(&mut buf, value)?;
            }
            KvOp::Delete { space, key } => {
                write_space(&mut buf, space)?;
                write_bytes(&mut buf, key)?;
            }
            KvOp::Clear { space } => write_space(&mut buf, space)?,
        }
    }
    Ok(buf)
}

fn write_space(buf: &mut Vec<u8>, space: &str) -> CoreResult<()> {
    let len = u16::try_from(space.len())
        .map_err(|_| CoreError::invalid_argument(format!("keyspace name too long: {space}")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(space.as_bytes());
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_argument("key or value exceeds 4 GiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct BatchReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> BatchReader<'a> {
    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let slice = self
            .payload
            .get(self.pos..self.pos + n)
            .ok_or_else(|| CoreError::log_corruption("unexpected end of batch"))?;
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_space(&mut self) -> CoreResult<String> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::log_corruption("keyspace name is not UTF-8"))
    }

    fn read_bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn decode_batch(payload: &[u8]) -> CoreResult<Vec<KvOp>> {
    let mut reader = BatchReader { payload, pos: 0 };

    let version = reader.read_u8()?;
    if version != BATCH_VERSION {
        return Err(CoreError::log_corruption(format!(
            "unsupported batch version {version}"
        )));
    }
    let count = reader.read_u32()? as usize;
    let mut ops = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let op = match reader.read_u8()? {
            1 => KvOp::Put {
                space: reader.read_space()?,
                key: reader.read_bytes()?,
                value: reader.read_bytes()?,
            },
            2 => KvOp::Delete {
                space: reader.read_space()?,
                key: reader.read_bytes()?,
            },
            3 => KvOp::Clear {
                space: reader.read_space()?,
            },
            other => {
                return Err(CoreError::log_corruption(format!(
                    "unknown operation tag {other}"
                )))
            }
        };
        ops.push(op);
    }
    if reader.pos != payload.len() {
        return Err(CoreError::log_corruption(format!(
            "trailing bytes in batch: expected {} bytes, got {}",
            reader.pos,
            payload.len()
        )));
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn batch_codec_roundtrip() {
        let batch = vec![
            KvOp::put("a", vec![1, 2], vec![3]),
            KvOp::delete("b", vec![]),
            KvOp::clear("c"),
        ];
        let payload = encode_batch(&batch).unwrap();
        assert_eq!(decode_batch(&payload).unwrap(), batch);
    }

    #[test]
    fn batch_decode_rejects_trailing_bytes() {
        let mut payload = encode_batch(&[KvOp::clear("x")]).unwrap();
        payload.push(0);
        assert!(matches!(
            decode_batch(&payload),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn apply_and_read() {
        let kv = KvStore::open_in_memory(StoreConfig::default()).unwrap();
        kv.apply(vec![
            KvOp::put("s", b"k1".to_vec(), b"v1".to_vec()),
            KvOp::put("s", b"k2".to_vec(), b"v2".to_vec()),
            KvOp::delete("s", b"k1".to_vec()),
        ])
        .unwrap();

        assert_eq!(kv.get("s", b"k1"), None);
        assert_eq!(kv.get("s", b"k2"), Some(b"v2".to_vec()));
        assert_eq!(kv.len("s"), 1);
        assert_eq!(kv.len("missing"), 0);
    }

    #[test]
    fn transact_error_writes_nothing() {
        let kv = KvStore::open_in_memory(StoreConfig::default()).unwrap();
        let result: CoreResult<()> = kv.transact(|_| Err(CoreError::invalid_argument("nope")));
        assert!(result.is_err());
        assert_eq!(kv.log_size().unwrap(), 0);
    }

    #[test]
    fn clear_drops_keyspace() {
        let kv = KvStore::open_in_memory(StoreConfig::default()).unwrap();
        kv.apply(vec![KvOp::put("s", vec![1], vec![])]).unwrap();
        kv.apply(vec![KvOp::clear("s"), KvOp::put("s", vec![2], vec![])])
            .unwrap();
        let keys: Vec<Vec<u8>> = kv.read(|v| v.keys("s").map(<[u8]>::to_vec).collect());
        assert_eq!(keys, vec![vec![2]]);
    }

    #[test]
    fn replay_restores_state() {
        let backend = InMemoryBackend::new();
        {
            let kv =
                KvStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default())
                    .unwrap();
            kv.apply(vec![KvOp::put("s", vec![1], vec![10])]).unwrap();
            kv.apply(vec![KvOp::put("s", vec![2], vec![20])]).unwrap();
            kv.apply(vec![KvOp::delete("s", vec![1])]).unwrap();
        }
        let kv = KvStore::open_with_backend(Box::new(backend), StoreConfig::default()).unwrap();
        assert_eq!(kv.get("s", &[1]), None);
        assert_eq!(kv.get("s", &[2]), Some(vec![20]));
    }

    #[test]
    fn compaction_keeps_live_data() {
        let backend = InMemoryBackend::new();
        let config = StoreConfig::new().compaction_threshold(Some(256));
        {
            let kv = KvStore::open_with_backend(Box::new(backend.clone()), config.clone()).unwrap();
            for i in 0..100u8 {
                kv.apply(vec![KvOp::put("s", vec![i % 4], vec![i])]).unwrap();
            }
            assert!(kv.log_size().unwrap() < 100 * 20);
        }
        let kv = KvStore::open_with_backend(Box::new(backend), config).unwrap();
        assert_eq!(kv.len("s"), 4);
        assert_eq!(kv.get("s", &[3]), Some(vec![99]));
    }

    #[test]
    fn explicit_compaction() {
        let backend = InMemoryBackend::new();
        let kv = KvStore::open_with_backend(
            Box::new(backend.clone()),
            StoreConfig::new().compaction_threshold(None),
        )
        .unwrap();
        for i in 0..10u8 {
            kv.apply(vec![KvOp::put("s", vec![0], vec![i])]).unwrap();
        }
        let before = kv.log_size().unwrap();
        kv.compact().unwrap();
        assert!(kv.log_size().unwrap() < before);
        assert_eq!(kv.get("s", &[0]), Some(vec![9]));
    }

    #[test]
    fn file_store_persists() {
        let dir = tempdir().unwrap();
        {
            let kv = KvStore::open(dir.path(), StoreConfig::default()).unwrap();
            kv.apply(vec![KvOp::put("s", b"k".to_vec(), b"v".to_vec())])
                .unwrap();
            assert!(matches!(
                KvStore::open(dir.path(), StoreConfig::default()),
                Err(CoreError::DatabaseLocked)
            ));
        }
        let kv = KvStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(kv.get("s", b"k"), Some(b"v".to_vec()));
    }
}
