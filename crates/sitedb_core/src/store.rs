//! Per-table primary store plus secondary indexes.

use crate::envelope::RecordEnvelope;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDef, URL_INDEX};
use crate::kv::{KvOp, KvStore, KvView};
use crate::range::{Direction, KeyRange, RangeScan};
use sitedb_codec::{decode_key, decode_key_prefix, encode_text, from_cbor, to_cbor, KeyValue};
use std::ops::Bound;
use std::sync::Arc;
use tracing::trace;

/// One result of a scan: the key it was found under and the record.
///
/// For primary scans the key is the url as text.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Decoded index key.
    pub key: KeyValue,
    /// Raw encoded index key (without the url suffix).
    pub raw_key: Vec<u8>,
    /// The record the entry points at.
    pub envelope: RecordEnvelope,
}

/// Primary store and secondary indexes of one table.
///
/// Records are keyed by url. Each index keyspace holds one entry per
/// derived key, stored as `encode(key) ++ encode(url)` with an empty value,
/// so ties between equal keys are ordered by url.
///
/// Every mutation is one batch in the underlying [`KvStore`]: a put removes
/// the entries derived from the previous value and inserts the new ones in
/// the same batch, so readers observe either the old record with all its
/// old entries or the new record with all its new entries.
#[derive(Debug)]
pub struct IndexedStore {
    table: String,
    kv: Arc<KvStore>,
    primary: String,
    indexes: Vec<(IndexDef, String)>,
}

impl IndexedStore {
    /// Creates the store for `table` with the given indexes.
    ///
    /// # Errors
    ///
    /// Returns a schema error for duplicate index names or use of the
    /// reserved `:url` name.
    pub fn new(kv: Arc<KvStore>, table: impl Into<String>, defs: Vec<IndexDef>) -> CoreResult<Self> {
        let table = table.into();
        let mut indexes: Vec<(IndexDef, String)> = Vec::with_capacity(defs.len());
        for def in defs {
            if def.name() == URL_INDEX {
                return Err(CoreError::schema(format!(
                    "'{URL_INDEX}' is reserved for the primary key"
                )));
            }
            if indexes.iter().any(|(d, _)| d.name() == def.name()) {
                return Err(CoreError::schema(format!(
                    "duplicate index '{}' on table '{table}'",
                    def.name()
                )));
            }
            let space = format!("idx/{table}/{}", def.name());
            indexes.push((def, space));
        }
        Ok(Self {
            primary: format!("rec/{table}"),
            table,
            kv,
            indexes,
        })
    }

    /// Table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Index definitions.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().map(|(d, _)| d)
    }

    /// Looks up an index definition.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` if no index has that name.
    pub fn index(&self, name: &str) -> CoreResult<&IndexDef> {
        self.indexes
            .iter()
            .find(|(d, _)| d.name() == name)
            .map(|(d, _)| d)
            .ok_or_else(|| CoreError::unknown_index(&self.table, name))
    }

    /// Returns true if `name` is the primary key or a defined index.
    #[must_use]
    pub fn has_index(&self, name: &str) -> bool {
        name == URL_INDEX || self.indexes.iter().any(|(d, _)| d.name() == name)
    }

    /// Inserts or replaces a record, returning the previous one.
    ///
    /// # Errors
    ///
    /// Fails if the record cannot be encoded or the batch cannot be logged.
    pub fn put(&self, envelope: &RecordEnvelope) -> CoreResult<Option<RecordEnvelope>> {
        let pk = encode_text(&envelope.url);
        let bytes = to_cbor(envelope)?;
        self.kv.transact(|view| {
            let previous = self.load(view, &pk)?;
            let mut ops = Vec::new();
            if let Some(prev) = &previous {
                self.remove_entries(prev, &pk, &mut ops);
            }
            for (def, space) in &self.indexes {
                for key in def.encoded_keys(envelope) {
                    ops.push(KvOp::put(space.clone(), entry_key(&key, &pk), Vec::new()));
                }
            }
            ops.push(KvOp::put(self.primary.clone(), pk.clone(), bytes));
            trace!(table = %self.table, url = %envelope.url, ops = ops.len(), "put");
            Ok((ops, previous))
        })
    }

    /// Returns the record stored at `url`.
    ///
    /// # Errors
    ///
    /// Fails if the stored bytes cannot be decoded.
    pub fn get(&self, url: &str) -> CoreResult<Option<RecordEnvelope>> {
        let pk = encode_text(url);
        self.kv.read(|view| self.load(view, &pk))
    }

    /// Removes the record at `url` and all its index entries.
    ///
    /// Returns the removed record, or `None` if nothing was stored.
    ///
    /// # Errors
    ///
    /// Fails if the stored record cannot be decoded or the batch cannot be
    /// logged.
    pub fn delete(&self, url: &str) -> CoreResult<Option<RecordEnvelope>> {
        let pk = encode_text(url);
        self.kv.transact(|view| {
            let previous = self.load(view, &pk)?;
            let mut ops = Vec::new();
            if let Some(prev) = &previous {
                self.remove_entries(prev, &pk, &mut ops);
                ops.push(KvOp::delete(self.primary.clone(), pk.clone()));
            }
            Ok((ops, previous))
        })
    }

    /// Removes every record and index entry of the table.
    ///
    /// # Errors
    ///
    /// Fails if the batch cannot be logged.
    pub fn clear(&self) -> CoreResult<()> {
        let mut ops = vec![KvOp::clear(self.primary.clone())];
        ops.extend(self.indexes.iter().map(|(_, space)| KvOp::clear(space.clone())));
        self.kv.apply(ops)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kv.len(&self.primary)
    }

    /// Returns true if the table holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries in an index.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` if no index has that name.
    pub fn index_len(&self, name: &str) -> CoreResult<usize> {
        if name == URL_INDEX {
            return Ok(self.len());
        }
        self.index(name)?;
        let space = self.space_of(name)?;
        Ok(self.kv.len(space))
    }

    /// Lazily scans an index (or the primary store for `None`/`:url`).
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` if no index has that name.
    pub fn scan(
        &self,
        index: Option<&str>,
        range: KeyRange,
        direction: Direction,
    ) -> CoreResult<RangeScan<CoreResult<IndexEntry>>> {
        let primary = self.primary.clone();
        match index {
            None | Some(URL_INDEX) => Ok(RangeScan::new(
                self.kv.clone(),
                primary,
                range,
                direction,
                |_, key, value| Some(decode_primary(key, value)),
            )),
            Some(name) => {
                let space = self.space_of(name)?.to_string();
                Ok(RangeScan::new(
                    self.kv.clone(),
                    space,
                    range,
                    direction,
                    move |view, key, _| resolve_entry(view, &primary, key).transpose(),
                ))
            }
        }
    }

    /// Lazily scans records by url bounds.
    ///
    /// # Errors
    ///
    /// Never fails for the primary store; kept fallible for symmetry.
    pub fn range_scan(
        &self,
        lower: Bound<&str>,
        upper: Bound<&str>,
        direction: Direction,
    ) -> CoreResult<impl Iterator<Item = CoreResult<RecordEnvelope>>> {
        let lower = lower.map(KeyValue::from);
        let upper = upper.map(KeyValue::from);
        let range = KeyRange::from_values(lower.as_ref(), upper.as_ref())?;
        Ok(self
            .scan(None, range, direction)?
            .map(|r| r.map(|entry| entry.envelope)))
    }

    /// Lazily scans an index by value bounds.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` or a codec error for unencodable bounds.
    pub fn index_range(
        &self,
        index: &str,
        lower: Bound<&KeyValue>,
        upper: Bound<&KeyValue>,
        direction: Direction,
    ) -> CoreResult<RangeScan<CoreResult<IndexEntry>>> {
        let range = KeyRange::from_values(lower, upper)?;
        self.scan(Some(index), range, direction)
    }

    /// Returns the first record whose index key equals `key`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex`, or a decoding error.
    pub fn index_get(&self, index: &str, key: &KeyValue) -> CoreResult<Option<RecordEnvelope>> {
        let mut scan = self.scan(Some(index), KeyRange::point(key)?, Direction::Forward)?;
        scan.next().transpose().map(|e| e.map(|entry| entry.envelope))
    }

    fn space_of(&self, name: &str) -> CoreResult<&str> {
        self.indexes
            .iter()
            .find(|(d, _)| d.name() == name)
            .map(|(_, s)| s.as_str())
            .ok_or_else(|| CoreError::unknown_index(&self.table, name))
    }

    fn load(&self, view: &KvView<'_>, pk: &[u8]) -> CoreResult<Option<RecordEnvelope>> {
        view.get(&self.primary, pk)
            .map(|bytes| from_cbor(bytes).map_err(CoreError::from))
            .transpose()
    }

    fn remove_entries(&self, previous: &RecordEnvelope, pk: &[u8], ops: &mut Vec<KvOp>) {
        for (def, space) in &self.indexes {
            for key in def.encoded_keys(previous) {
                ops.push(KvOp::delete(space.clone(), entry_key(&key, pk)));
            }
        }
    }
}

fn entry_key(index_key: &[u8], pk: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(index_key.len() + pk.len());
    key.extend_from_slice(index_key);
    key.extend_from_slice(pk);
    key
}

fn decode_primary(key: &[u8], value: &[u8]) -> CoreResult<IndexEntry> {
    let envelope: RecordEnvelope = from_cbor(value)?;
    Ok(IndexEntry {
        key: decode_key(key)?,
        raw_key: key.to_vec(),
        envelope,
    })
}

fn resolve_entry(view: &KvView<'_>, primary: &str, entry: &[u8]) -> CoreResult<Option<IndexEntry>> {
    let (key, used) = decode_key_prefix(entry)?;
    let pk = &entry[used..];
    // entry without a live record: skip it
    let Some(bytes) = view.get(primary, pk) else {
        return Ok(None);
    };
    let envelope: RecordEnvelope = from_cbor(bytes)?;
    Ok(Some(IndexEntry {
        key,
        raw_key: entry[..used].to_vec(),
        envelope,
    }))
}
