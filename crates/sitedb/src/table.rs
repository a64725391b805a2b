//! Tables of an open database.

use crate::error::{DbError, DbResult};
use crate::events::TableEvent;
use crate::indexer::{record_lock, source_lock, Indexer};
use crate::query::{Patch, Query};
use crate::source::Source;
use crate::where_clause::WhereClause;
use serde_json::Value;
use sitedb_codec::KeyValue;
use sitedb_core::{
    origin_of, CoreResult, FilePatterns, IndexedStore, KvStore, ListenerId, Listeners,
    RecordEnvelope, TableSchema,
};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, warn};

/// Store, patterns and listeners of one table.
pub(crate) struct TableState {
    pub(crate) name: String,
    pub(crate) schema: TableSchema,
    pub(crate) store: Arc<IndexedStore>,
    pub(crate) patterns: FilePatterns,
    pub(crate) events: Listeners<TableEvent>,
}

impl TableState {
    pub(crate) fn new(kv: Arc<KvStore>, name: &str, schema: TableSchema) -> DbResult<Self> {
        let store = IndexedStore::new(kv, name, schema.compile_indexes()?)?;
        Ok(Self {
            name: name.to_string(),
            patterns: schema.compile_patterns()?,
            schema,
            store: Arc::new(store),
            events: Listeners::new(),
        })
    }

    /// Validates, preprocesses and stores a document read from a source.
    ///
    /// A document that fails validation is removed instead. Returns true if
    /// it was stored.
    pub(crate) fn ingest(&self, url: &str, origin: &str, record: Value) -> CoreResult<bool> {
        let hooks = self.schema.hooks();
        if !hooks.validate(&record) {
            warn!(table = %self.name, %url, "record failed validation, unindexing");
            self.remove(url)?;
            return Ok(false);
        }
        let envelope = RecordEnvelope::new(url, origin, hooks.preprocess(record));
        self.store_envelope(envelope)?;
        Ok(true)
    }

    pub(crate) fn store_envelope(&self, envelope: RecordEnvelope) -> CoreResult<()> {
        self.store.put(&envelope)?;
        debug!(table = %self.name, url = %envelope.url, "record put");
        self.events.emit(&TableEvent::RecordPut(envelope));
        Ok(())
    }

    /// Deletes a record, emitting `RecordDeleted` if it existed.
    pub(crate) fn remove(&self, url: &str) -> CoreResult<Option<RecordEnvelope>> {
        let removed = self.store.delete(url)?;
        if let Some(envelope) = &removed {
            debug!(table = %self.name, %url, "record deleted");
            self.events.emit(&TableEvent::RecordDeleted(envelope.clone()));
        }
        Ok(removed)
    }
}

/// Result of [`Table::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Existing records were updated.
    Updated(usize),
    /// Nothing matched, so the record was created at this url.
    Inserted(String),
}

/// Handle to one table of an open [`SiteDb`](crate::SiteDb).
///
/// Handles are cheap to clone. They belong to one open session: once the
/// database is closed every operation returns [`DbError::Closed`].
#[derive(Clone)]
pub struct Table {
    state: Arc<TableState>,
    indexer: Arc<Indexer>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.state.name)
            .field("helper", &self.state.schema.is_helper())
            .finish_non_exhaustive()
    }
}

impl Table {
    pub(crate) fn new(state: Arc<TableState>, indexer: Arc<Indexer>) -> Self {
        Self { state, indexer }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The schema the table was defined with.
    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.state.schema
    }

    /// Returns true for helper tables.
    #[must_use]
    pub fn is_helper(&self) -> bool {
        self.state.schema.is_helper()
    }

    // queries

    /// Starts a query over every record, in url order.
    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.state.clone(), self.indexer.clone())
    }

    /// Starts a query bounded on `index`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` if the index does not exist.
    pub fn where_(&self, index: &str) -> DbResult<WhereClause> {
        self.query().where_(index)
    }

    /// Starts a query ordered by `index`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` if the index does not exist.
    pub fn order_by(&self, index: &str) -> DbResult<Query> {
        self.query().order_by(index)
    }

    /// Starts a query with a record predicate.
    #[must_use]
    pub fn filter(&self, f: impl Fn(&RecordEnvelope) -> bool + Send + Sync + 'static) -> Query {
        self.query().filter(f)
    }

    /// Starts a query yielding at most `n` records.
    #[must_use]
    pub fn limit(&self, n: usize) -> Query {
        self.query().limit(n)
    }

    /// Starts a query skipping the first `n` records.
    #[must_use]
    pub fn offset(&self, n: usize) -> Query {
        self.query().offset(n)
    }

    /// Starts a query in descending url order.
    #[must_use]
    pub fn reverse(&self) -> Query {
        self.query().reverse()
    }

    /// Calls `f` for every record.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or a stored record is unreadable.
    pub fn each(&self, f: impl FnMut(RecordEnvelope)) -> DbResult<()> {
        self.query().each(f)
    }

    /// Every record, in url order.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or a stored record is unreadable.
    pub fn to_array(&self) -> DbResult<Vec<RecordEnvelope>> {
        self.query().to_array()
    }

    /// Number of records.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed.
    pub fn count(&self) -> DbResult<usize> {
        self.indexer.ensure_open()?;
        Ok(self.state.store.len())
    }

    /// The record stored at `url`.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the record is unreadable.
    pub fn get(&self, url: &str) -> DbResult<Option<RecordEnvelope>> {
        self.indexer.ensure_open()?;
        Ok(self.state.store.get(url)?)
    }

    /// The first record whose `index` key equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for an unknown index or an unencodable value.
    pub fn get_by(&self, index: &str, value: impl Into<KeyValue>) -> DbResult<Option<RecordEnvelope>> {
        self.where_(index)?.equals(value)?.first()
    }

    // writes

    /// Writes a record and returns its url.
    ///
    /// The record is validated, preprocessed and serialized first. Helper
    /// tables store it directly. Otherwise it is written as JSON to its
    /// source, which must be registered and writable, and the source is
    /// reconciled so the index reflects the write before this returns.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` if the validator rejects the record,
    /// `Parameter` for a url outside the table's file patterns and
    /// `WriteRejected` for an unknown or read-only source.
    pub async fn put(&self, url: &str, record: Value) -> DbResult<String> {
        self.indexer.ensure_open()?;
        if self.is_helper() {
            return self.put_helper(url, record);
        }
        let (origin, _) = split_url(url)?;
        let _guard = self.indexer.locks().acquire(source_lock(origin)).await;
        self.put_to_source(url, record).await
    }

    fn put_helper(&self, url: &str, record: Value) -> DbResult<String> {
        let record = self.prepare(url, record)?;
        self.state
            .store_envelope(RecordEnvelope::new(url, "", record))?;
        Ok(url.to_string())
    }

    async fn put_to_source(&self, url: &str, record: Value) -> DbResult<String> {
        let (origin, path) = split_url(url)?;
        if !self.state.patterns.matches(path) {
            return Err(DbError::parameter(format!(
                "{path} does not match the file patterns of table '{}'",
                self.state.name
            )));
        }
        let source = self.indexer.require_writable(origin)?;
        let record = self.prepare(url, record)?;
        write_json(source.as_ref(), path, &record).await?;
        self.indexer.reconcile(&source).await?;
        Ok(url.to_string())
    }

    /// Runs validate, preprocess and serialize for a direct write.
    fn prepare(&self, url: &str, record: Value) -> DbResult<Value> {
        let hooks = self.state.schema.hooks();
        if !hooks.validate(&record) {
            return Err(DbError::ValidationFailed {
                url: url.to_string(),
            });
        }
        Ok(hooks.serialize(hooks.preprocess(record)))
    }

    /// Deletes the record at `url`. Returns the number of deletions enacted.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or a source write fails.
    pub async fn delete(&self, url: &str) -> DbResult<usize> {
        self.where_(sitedb_core::URL_INDEX)?.equals(url)?.delete().await
    }

    /// Patches the record at `url`. Returns the number of records changed.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` if the patched record is rejected.
    pub async fn update(&self, url: &str, patch: impl Into<Patch>) -> DbResult<usize> {
        self.indexer.ensure_open()?;
        let lock = origin_of(url).unwrap_or(url);
        let _guard = self.indexer.locks().acquire(source_lock(lock)).await;
        self.where_(sitedb_core::URL_INDEX)?
            .equals(url)?
            .update(patch)
            .await
    }

    /// Updates the record at `url`, or creates it when nothing was updated.
    ///
    /// A closure patch is applied to an empty object to build the new record.
    ///
    /// # Errors
    ///
    /// As [`update`](Self::update) and [`put`](Self::put).
    pub async fn upsert(&self, url: &str, patch: impl Into<Patch>) -> DbResult<UpsertOutcome> {
        self.indexer.ensure_open()?;
        let patch = patch.into();
        let _guard = self.indexer.locks().acquire(record_lock(url)).await;
        let changed = self.update(url, patch.clone()).await?;
        if changed > 0 {
            return Ok(UpsertOutcome::Updated(changed));
        }
        let url = self.put(url, patch.into_record()).await?;
        Ok(UpsertOutcome::Inserted(url))
    }

    // record files

    /// Returns true if `path` selects a document for this table.
    #[must_use]
    pub fn is_record_file(&self, path: &str) -> bool {
        !self.is_helper() && self.state.patterns.matches(path)
    }

    /// Urls of every file in `source` that belongs to this table.
    ///
    /// # Errors
    ///
    /// Fails if the source cannot be listed.
    pub async fn list_record_files(&self, source: &dyn Source) -> DbResult<Vec<String>> {
        if self.is_helper() {
            return Ok(Vec::new());
        }
        let timeout = self.indexer.config().read_timeout;
        let names = tokio::time::timeout(timeout, source.readdir("/", true))
            .await
            .map_err(|_| DbError::Timeout {
                operation: "readdir".into(),
            })??;
        Ok(names
            .into_iter()
            .filter(|name| self.state.patterns.matches(name))
            .map(|name| format!("{}/{}", source.url(), name.trim_start_matches('/')))
            .collect())
    }

    // events

    /// Registers a record lifecycle callback.
    pub fn on(&self, f: impl Fn(&TableEvent) + Send + Sync + 'static) -> ListenerId {
        self.state.events.on(f)
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.state.events.off(id)
    }

    /// A channel receiving every future record event.
    pub fn subscribe(&self) -> Receiver<TableEvent> {
        self.state.events.subscribe()
    }
}

/// Splits a record url into its origin and path.
pub(crate) fn split_url(url: &str) -> DbResult<(&str, &str)> {
    let origin = origin_of(url)
        .ok_or_else(|| DbError::parameter(format!("'{url}' is not an absolute url")))?;
    let path = &url[origin.len()..];
    if path.is_empty() || path == "/" {
        return Err(DbError::parameter(format!("'{url}' names no file")));
    }
    Ok((origin, path))
}

pub(crate) async fn write_json(source: &dyn Source, path: &str, record: &Value) -> DbResult<()> {
    let bytes = serde_json::to_vec(record).map_err(|e| DbError::Parse {
        url: format!("{}{path}", source.url()),
        message: e.to_string(),
    })?;
    source.write_file(path, &bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_splitting() {
        assert_eq!(
            split_url("dweb://alice/posts/1.json").unwrap(),
            ("dweb://alice", "/posts/1.json")
        );
        assert!(matches!(
            split_url("posts/1.json"),
            Err(DbError::Parameter { .. })
        ));
        assert!(matches!(
            split_url("dweb://alice/"),
            Err(DbError::Parameter { .. })
        ));
    }
}
