//! Fluent queries over a table.
//!
//! A [`Query`] is plain builder state; nothing touches the store until a
//! terminal operation runs. Reads walk the selected index lazily through a
//! [`PlanCursor`], so `first`, `limit` and `until` stop the scan early.
//!
//! ```ignore
//! let recent = db
//!     .table("broadcasts")?
//!     .where_("createdAt")?
//!     .above(1_000)?
//!     .filter(|r| r.record["type"] == "comment")
//!     .limit(10)
//!     .to_array()?;
//! ```

use crate::error::{DbError, DbResult};
use crate::indexer::Indexer;
use crate::source::{Source, SourceError};
use crate::table::{write_json, TableState};
use crate::where_clause::WhereClause;
use serde_json::{Map, Value};
use sitedb_codec::KeyValue;
use sitedb_core::{Direction, IndexEntry, PlanCursor, RecordEnvelope, ScanPlan, WhereOp};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

type Predicate = Arc<dyn Fn(&RecordEnvelope) -> bool + Send + Sync>;

/// A change applied to each record by [`Query::update`].
#[derive(Clone)]
pub enum Patch {
    /// Sets each key of the map on the record, keeping the others.
    Merge(Map<String, Value>),
    /// Replaces the record.
    Replace(Value),
    /// Mutates the record in place; assigning to it replaces it.
    Apply(Arc<dyn Fn(&mut Value) + Send + Sync>),
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(map) => f.debug_tuple("Merge").field(map).finish(),
            Self::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Self::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

impl Patch {
    /// A patch running `f` on each record.
    pub fn apply(f: impl Fn(&mut Value) + Send + Sync + 'static) -> Self {
        Self::Apply(Arc::new(f))
    }

    /// Applies the patch to one record.
    pub fn apply_to(&self, record: &mut Value) {
        match self {
            Self::Merge(map) => {
                if !record.is_object() {
                    *record = Value::Object(Map::new());
                }
                if let Value::Object(fields) = record {
                    for (k, v) in map {
                        fields.insert(k.clone(), v.clone());
                    }
                }
            }
            Self::Replace(value) => *record = value.clone(),
            Self::Apply(f) => f(record),
        }
    }

    /// The record an upsert creates when nothing matched.
    pub(crate) fn into_record(self) -> Value {
        match self {
            Self::Merge(map) => Value::Object(map),
            Self::Replace(value) => value,
            Self::Apply(f) => {
                let mut record = Value::Object(Map::new());
                f(&mut record);
                record
            }
        }
    }
}

impl From<Map<String, Value>> for Patch {
    fn from(map: Map<String, Value>) -> Self {
        Self::Merge(map)
    }
}

impl From<Value> for Patch {
    /// Objects merge; any other value replaces the record.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Merge(map),
            other => Self::Replace(other),
        }
    }
}

/// A query over one table.
///
/// Builder methods consume and return the query; `clone()` forks it.
#[derive(Clone)]
pub struct Query {
    table: Arc<TableState>,
    indexer: Arc<Indexer>,
    index: Option<String>,
    op: Option<WhereOp>,
    filters: Vec<Predicate>,
    until: Option<(Predicate, bool)>,
    offset: usize,
    limit: Option<usize>,
    reverse: bool,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table.name)
            .field("index", &self.index)
            .field("op", &self.op)
            .field("filters", &self.filters.len())
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("reverse", &self.reverse)
            .finish_non_exhaustive()
    }
}

impl Query {
    pub(crate) fn new(table: Arc<TableState>, indexer: Arc<Indexer>) -> Self {
        Self {
            table,
            indexer,
            index: None,
            op: None,
            filters: Vec::new(),
            until: None,
            offset: 0,
            limit: None,
            reverse: false,
        }
    }

    /// Selected index, if any.
    #[must_use]
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Bound operator, if any.
    #[must_use]
    pub fn op(&self) -> Option<&WhereOp> {
        self.op.as_ref()
    }

    fn select_index(&mut self, index: &str) -> DbResult<()> {
        if let Some(current) = &self.index {
            return Err(DbError::parameter(format!(
                "index '{current}' is already selected; where() and order_by() cannot be combined"
            )));
        }
        if !self.table.store.has_index(index) {
            return Err(DbError::parameter(format!(
                "unknown index '{index}' on table '{}'",
                self.table.name
            )));
        }
        self.index = Some(index.to_string());
        Ok(())
    }

    /// Bounds the query on `index`. The results are ordered by it.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for an unknown index or if one is already
    /// selected.
    pub fn where_(mut self, index: &str) -> DbResult<WhereClause> {
        self.select_index(index)?;
        Ok(WhereClause::new(self))
    }

    /// Orders the results by `index`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for an unknown index or if one is already
    /// selected.
    pub fn order_by(mut self, index: &str) -> DbResult<Self> {
        self.select_index(index)?;
        Ok(self)
    }

    pub(crate) fn bind(mut self, op: WhereOp) -> DbResult<Self> {
        // surface unencodable values now rather than at iteration
        ScanPlan::compile(&op, Direction::Forward)?;
        self.op = Some(op);
        Ok(self)
    }

    /// Keeps only records for which `f` returns true.
    #[must_use]
    pub fn filter(mut self, f: impl Fn(&RecordEnvelope) -> bool + Send + Sync + 'static) -> Self {
        self.filters.push(Arc::new(f));
        self
    }

    /// Reverses the iteration order.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    /// Skips the first `n` matches.
    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    /// Yields at most `n` matches.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Stops before the first match for which `f` returns true.
    #[must_use]
    pub fn until(mut self, f: impl Fn(&RecordEnvelope) -> bool + Send + Sync + 'static) -> Self {
        self.until = Some((Arc::new(f), false));
        self
    }

    /// Stops after yielding the first match for which `f` returns true.
    #[must_use]
    pub fn until_including(
        mut self,
        f: impl Fn(&RecordEnvelope) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.until = Some((Arc::new(f), true));
        self
    }

    fn direction(&self) -> Direction {
        if self.reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    /// Lazily iterates matching entries.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the bound cannot be encoded.
    pub fn iter(&self) -> DbResult<QueryIter> {
        self.indexer.ensure_open()?;
        let direction = self.direction();
        let plan = match &self.op {
            Some(op) => ScanPlan::compile(op, direction)?,
            None => ScanPlan::full(),
        };
        Ok(QueryIter {
            cursor: PlanCursor::new(self.table.store.clone(), self.index.clone(), plan, direction),
            filters: self.filters.clone(),
            until: self.until.clone(),
            to_skip: self.offset,
            remaining: self.limit,
            done: false,
        })
    }

    /// Calls `f` for every match.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or a record is unreadable.
    pub fn each(&self, mut f: impl FnMut(RecordEnvelope)) -> DbResult<()> {
        for entry in self.iter()? {
            f(entry?.envelope);
        }
        Ok(())
    }

    /// Every match.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn to_array(&self) -> DbResult<Vec<RecordEnvelope>> {
        self.iter()?
            .map(|entry| entry.map(|e| e.envelope))
            .collect()
    }

    /// Calls `f` with the key of every match: the index key when an index
    /// is selected, the url otherwise.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn each_key(&self, mut f: impl FnMut(KeyValue)) -> DbResult<()> {
        for entry in self.iter()? {
            f(entry?.key);
        }
        Ok(())
    }

    /// Keys of every match, see [`each_key`](Self::each_key).
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn keys(&self) -> DbResult<Vec<KeyValue>> {
        self.iter()?.map(|entry| entry.map(|e| e.key)).collect()
    }

    /// Distinct keys in first-seen order.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn unique_keys(&self) -> DbResult<Vec<KeyValue>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for entry in self.iter()? {
            let entry = entry?;
            if seen.insert(entry.raw_key) {
                keys.push(entry.key);
            }
        }
        Ok(keys)
    }

    /// Urls of every match.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn urls(&self) -> DbResult<Vec<String>> {
        self.iter()?
            .map(|entry| entry.map(|e| e.envelope.url))
            .collect()
    }

    /// The first match.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn first(&self) -> DbResult<Option<RecordEnvelope>> {
        self.iter()?
            .next()
            .transpose()
            .map(|e| e.map(|e| e.envelope))
    }

    /// The first match in the opposite order.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn last(&self) -> DbResult<Option<RecordEnvelope>> {
        self.clone().reverse().first()
    }

    /// Number of matches.
    ///
    /// # Errors
    ///
    /// As [`each`](Self::each).
    pub fn count(&self) -> DbResult<usize> {
        let mut n = 0;
        for entry in self.iter()? {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    /// Patches every match. Returns the number of updates enacted.
    ///
    /// Helper-table rows are rewritten in place. Other records are written
    /// back to their source and re-indexed from it; records whose source is
    /// unknown or read-only are skipped and not counted.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` if a patched record is rejected. Records before it
    /// stay updated, and sources already written to are re-indexed before
    /// the error is returned.
    pub async fn update(&self, patch: impl Into<Patch>) -> DbResult<usize> {
        let patch = patch.into();
        let matches = self.to_array()?;
        let mut touched: Vec<Arc<dyn Source>> = Vec::new();
        let mut enacted = 0;
        let mut failure = None;

        for envelope in matches {
            match self.update_one(envelope, &patch, &mut touched).await {
                Ok(true) => enacted += 1,
                Ok(false) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.reindex(touched, failure).await?;
        Ok(enacted)
    }

    async fn update_one(
        &self,
        envelope: RecordEnvelope,
        patch: &Patch,
        touched: &mut Vec<Arc<dyn Source>>,
    ) -> DbResult<bool> {
        let source = if self.table.schema.is_helper() {
            None
        } else if let Some(source) = self.indexer.writable_source(&envelope.origin) {
            Some(source)
        } else {
            debug!(url = %envelope.url, "update not enacted: source unknown or read-only");
            return Ok(false);
        };

        let hooks = self.table.schema.hooks();
        let mut record = envelope.record.clone();
        patch.apply_to(&mut record);
        if !hooks.validate(&record) {
            return Err(DbError::ValidationFailed { url: envelope.url });
        }
        let record = hooks.serialize(hooks.preprocess(record));

        match source {
            None => self.table.store_envelope(RecordEnvelope::new(
                envelope.url,
                envelope.origin,
                record,
            ))?,
            Some(source) => {
                write_json(source.as_ref(), envelope.path(), &record).await?;
                remember(touched, source);
            }
        }
        Ok(true)
    }

    /// Deletes every match. Returns the number of deletions enacted.
    ///
    /// Helper-table rows are removed directly. Other records are unlinked
    /// from their source and the index follows; records whose source is
    /// unknown or read-only are skipped and not counted.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or a source write fails. Sources
    /// already written to are re-indexed before the error is returned.
    pub async fn delete(&self) -> DbResult<usize> {
        let matches = self.to_array()?;
        let helper = self.table.schema.is_helper();
        let mut touched: Vec<Arc<dyn Source>> = Vec::new();
        let mut enacted = 0;
        let mut failure: Option<DbError> = None;

        for envelope in matches {
            if helper {
                if let Err(e) = self.table.remove(&envelope.url) {
                    failure = Some(e.into());
                    break;
                }
                enacted += 1;
                continue;
            }
            let Some(source) = self.indexer.writable_source(&envelope.origin) else {
                debug!(url = %envelope.url, "delete not enacted: source unknown or read-only");
                continue;
            };
            match source.unlink(envelope.path()).await {
                Ok(()) | Err(SourceError::NotFound { .. }) => {}
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
            remember(&mut touched, source);
            enacted += 1;
        }

        self.reindex(touched, failure).await?;
        Ok(enacted)
    }

    /// Reconciles every source written to, then surfaces the first error.
    async fn reindex(&self, touched: Vec<Arc<dyn Source>>, failure: Option<DbError>) -> DbResult<()> {
        let mut first = failure;
        for source in touched {
            if let Err(e) = self.indexer.reconcile(&source).await {
                warn!(source = %source.url(), error = %e, "re-index after write failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

fn remember(touched: &mut Vec<Arc<dyn Source>>, source: Arc<dyn Source>) {
    if !touched.iter().any(|s| s.url() == source.url()) {
        touched.push(source);
    }
}

/// Lazy iterator returned by [`Query::iter`].
pub struct QueryIter {
    cursor: PlanCursor,
    filters: Vec<Predicate>,
    until: Option<(Predicate, bool)>,
    to_skip: usize,
    remaining: Option<usize>,
    done: bool,
}

impl fmt::Debug for QueryIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIter")
            .field("to_skip", &self.to_skip)
            .field("remaining", &self.remaining)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Iterator for QueryIter {
    type Item = DbResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == Some(0) {
            return None;
        }
        loop {
            let entry = match self.cursor.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if !self.filters.iter().all(|f| f(&entry.envelope)) {
                continue;
            }
            let stop = match &self.until {
                Some((f, inclusive)) if f(&entry.envelope) => {
                    self.done = true;
                    if !*inclusive {
                        return None;
                    }
                    true
                }
                _ => false,
            };
            if self.to_skip > 0 {
                self.to_skip -= 1;
                if stop {
                    return None;
                }
                continue;
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            return Some(Ok(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_sets_keys() {
        let mut record = json!({"a": 1, "b": 2});
        Patch::from(json!({"b": 3, "c": null})).apply_to(&mut record);
        assert_eq!(record, json!({"a": 1, "b": 3, "c": null}));
    }

    #[test]
    fn closure_patch_can_replace() {
        let mut record = json!({"a": 1});
        Patch::apply(|r| *r = json!({"z": true})).apply_to(&mut record);
        assert_eq!(record, json!({"z": true}));

        let mut record = json!({"n": 1});
        Patch::apply(|r| r["n"] = json!(2)).apply_to(&mut record);
        assert_eq!(record, json!({"n": 2}));
    }

    #[test]
    fn patch_as_new_record() {
        assert_eq!(Patch::from(json!({"a": 1})).into_record(), json!({"a": 1}));
        assert_eq!(
            Patch::apply(|r| r["made"] = json!(true)).into_record(),
            json!({"made": true})
        );
        assert_eq!(Patch::from(json!([1])).into_record(), json!([1]));
    }
}
