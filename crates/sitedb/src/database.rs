//! The database handle and its lifecycle.

use crate::config::{DbConfig, StorageLocation};
use crate::error::{DbError, DbResult};
use crate::events::DbEvent;
use crate::indexer::Indexer;
use crate::source::Source;
use crate::table::{Table, TableState};
use parking_lot::{Mutex, RwLock};
use sitedb_core::{ChecksumStore, KvStore, ListenerId, Listeners, TableSchema};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of [`SiteDb::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Tables whose schema differs from the one stored by the previous open
    /// (or that are new). When non-empty every table was cleared and every
    /// source will be re-indexed from version zero.
    pub rebuilds: Vec<String>,
}

/// An embedded document index over a set of sources.
///
/// Tables are declared with [`define`](Self::define) while the database is
/// closed. [`open`](Self::open) creates the store, rebuilds the indexes if
/// any schema changed, and hands out [`Table`] handles.
///
/// # Example
///
/// ```no_run
/// use sitedb::{DbConfig, MemorySource, SiteDb, TableSchema};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn demo() -> sitedb::DbResult<()> {
/// let db = SiteDb::new("feeds", DbConfig::in_memory());
/// db.define(
///     "broadcasts",
///     TableSchema::new()
///         .with_file_pattern("/broadcasts/*.json")
///         .with_index("createdAt"),
/// )?;
/// db.open()?;
///
/// let alice = Arc::new(MemorySource::new("dweb://alice"));
/// alice.put_json("/broadcasts/1.json", &json!({"createdAt": 1}));
/// db.index_source(alice, None).await?;
///
/// let first = db.table("broadcasts")?.order_by("createdAt")?.first()?;
/// assert!(first.is_some());
/// # Ok(())
/// # }
/// ```
pub struct SiteDb {
    name: String,
    config: DbConfig,
    schemas: Mutex<Vec<(String, TableSchema)>>,
    session: RwLock<Option<Session>>,
    events: Arc<Listeners<DbEvent>>,
}

struct Session {
    indexer: Arc<Indexer>,
    tables: BTreeMap<String, Table>,
}

impl std::fmt::Debug for SiteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteDb")
            .field("name", &self.name)
            .field("location", &self.config.location)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SiteDb {
    /// Creates a closed database.
    pub fn new(name: impl Into<String>, config: DbConfig) -> Self {
        Self {
            name: name.into(),
            config,
            schemas: Mutex::new(Vec::new()),
            session: RwLock::new(None),
            events: Arc::new(Listeners::new()),
        }
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Declares a table.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if the database is open, the name is taken or
    /// malformed, or the schema's indexes or patterns do not compile.
    pub fn define(&self, name: &str, schema: TableSchema) -> DbResult<()> {
        if self.is_open() {
            return Err(DbError::schema("cannot define tables while the database is open"));
        }
        if name.is_empty() || name.contains('/') {
            return Err(DbError::schema(format!("invalid table name '{name}'")));
        }
        schema.compile_indexes()?;
        schema.compile_patterns()?;
        let mut schemas = self.schemas.lock();
        if schemas.iter().any(|(n, _)| n == name) {
            return Err(DbError::schema(format!("table '{name}' is already defined")));
        }
        debug!(db = %self.name, table = %name, "table defined");
        schemas.push((name.to_string(), schema));
        Ok(())
    }

    /// Opens the store and the tables.
    ///
    /// Stored schema checksums are compared with the current ones; on any
    /// difference every table is cleared, every watermark rewound and
    /// [`DbEvent::IndexesReset`] emitted.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if already open, or a storage error.
    pub fn open(&self) -> DbResult<OpenReport> {
        let mut session = self.session.write();
        if session.is_some() {
            return Err(DbError::schema("database is already open"));
        }

        let kv = Arc::new(match &self.config.location {
            StorageLocation::Memory => KvStore::open_in_memory(self.config.store.clone())?,
            StorageLocation::Path(path) => KvStore::open(path, self.config.store.clone())?,
        });

        let schemas = self.schemas.lock().clone();
        let checksums = ChecksumStore::new(kv.clone());
        let mut states = Vec::with_capacity(schemas.len());
        let mut rebuilds = Vec::new();
        let mut sums = Vec::with_capacity(schemas.len());
        for (name, schema) in schemas {
            let sum = schema.checksum();
            if checksums.get(&name)?.as_deref() != Some(sum.as_str()) {
                rebuilds.push(name.clone());
            }
            states.push(Arc::new(TableState::new(kv.clone(), &name, schema)?));
            sums.push((name, sum));
        }

        let indexer = Arc::new(Indexer::new(
            kv,
            states,
            self.config.indexer.clone(),
            self.events.clone(),
        )?);
        let reset = indexer.reset_outdated(&rebuilds)?;
        checksums.set_all(sums.iter().map(|(n, s)| (n.as_str(), s.as_str())))?;

        let tables = indexer
            .tables()
            .iter()
            .map(|state| (state.name.clone(), Table::new(state.clone(), indexer.clone())))
            .collect();
        *session = Some(Session { indexer, tables });
        drop(session);
        info!(db = %self.name, rebuilds = rebuilds.len(), "database opened");
        if reset {
            self.events.emit(&DbEvent::IndexesReset {
                tables: rebuilds.clone(),
            });
        }
        Ok(OpenReport { rebuilds })
    }

    /// Stops watching and retrying, forgets every source and releases the
    /// store. Closing a closed database does nothing.
    pub fn close(&self) {
        if let Some(session) = self.session.write().take() {
            session.indexer.shutdown();
            info!(db = %self.name, "database closed");
        }
    }

    /// Returns true between `open` and `close`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.read().is_some()
    }

    fn indexer(&self) -> DbResult<Arc<Indexer>> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.indexer.clone())
            .ok_or(DbError::Closed)
    }

    /// The table named `name`.
    ///
    /// # Errors
    ///
    /// `Closed` if the database is not open, `Parameter` for an unknown
    /// table.
    pub fn table(&self, name: &str) -> DbResult<Table> {
        let session = self.session.read();
        let session = session.as_ref().ok_or(DbError::Closed)?;
        session
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::parameter(format!("unknown table '{name}'")))
    }

    /// Every table, by name.
    ///
    /// # Errors
    ///
    /// `Closed` if the database is not open.
    pub fn tables(&self) -> DbResult<Vec<Table>> {
        let session = self.session.read();
        let session = session.as_ref().ok_or(DbError::Closed)?;
        Ok(session.tables.values().cloned().collect())
    }

    // sources

    /// Adds `source` to the index, or reconciles it again if already added.
    ///
    /// `watch` defaults to the configured value. If the source cannot be
    /// reached in time the call still succeeds: the source stays registered,
    /// [`DbEvent::SourceMissing`] is emitted and indexing is retried in the
    /// background.
    ///
    /// # Errors
    ///
    /// `Closed`, or any non-timeout failure of the first pass.
    pub async fn index_source(&self, source: Arc<dyn Source>, watch: Option<bool>) -> DbResult<()> {
        let indexer = self.indexer()?;
        let watch = watch.unwrap_or(indexer.config().watch);
        indexer.add_source(source, watch).await
    }

    /// Removes a source and every record it produced. Returns false if it
    /// was not registered.
    ///
    /// # Errors
    ///
    /// `Closed`, or a storage error.
    pub async fn unindex_source(&self, url: &str) -> DbResult<bool> {
        self.indexer()?.remove_source(url).await
    }

    /// Reconciles a registered source now. Returns its watermark.
    ///
    /// # Errors
    ///
    /// `Parameter` for an unknown source, or the pass's failure.
    pub async fn sync_source(&self, url: &str) -> DbResult<u64> {
        let indexer = self.indexer()?;
        let source = indexer
            .source(url)
            .ok_or_else(|| DbError::parameter(format!("source {url} is not indexed")))?;
        indexer.reconcile(&source).await
    }

    /// Indexes one file of `source` into every matching table.
    ///
    /// # Errors
    ///
    /// Read and parse failures.
    pub async fn index_file(&self, source: &Arc<dyn Source>, path: &str) -> DbResult<()> {
        self.indexer()?.index_file(source, path).await
    }

    /// Removes one file of `source` from every matching table.
    ///
    /// # Errors
    ///
    /// `Closed`, or a storage error.
    pub async fn unindex_file(&self, source: &Arc<dyn Source>, path: &str) -> DbResult<()> {
        self.indexer()?.unindex_file(source, path).await
    }

    /// Urls of the registered sources, sorted.
    #[must_use]
    pub fn list_sources(&self) -> Vec<String> {
        self.indexer()
            .map(|i| i.list_sources())
            .unwrap_or_default()
    }

    /// Returns true if `url` is a registered source.
    #[must_use]
    pub fn is_source(&self, url: &str) -> bool {
        self.indexer().is_ok_and(|i| i.is_source(url))
    }

    /// Returns true if change notices from `url` are being followed.
    #[must_use]
    pub fn is_watched(&self, url: &str) -> bool {
        self.indexer().is_ok_and(|i| i.is_watched(url))
    }

    /// Stops following change notices from `url`. Returns false if it was
    /// not watched.
    pub fn unwatch_source(&self, url: &str) -> bool {
        self.indexer().is_ok_and(|i| i.unwatch(url))
    }

    /// The version of `url` applied to the index (0 if never indexed).
    ///
    /// # Errors
    ///
    /// `Closed`, or a storage error.
    pub fn watermark(&self, url: &str) -> DbResult<u64> {
        Ok(self.indexer()?.watermarks().get(url)?)
    }

    /// Rewrites the store's log as a single snapshot.
    ///
    /// # Errors
    ///
    /// `Closed`, or a storage error.
    pub fn compact(&self) -> DbResult<()> {
        Ok(self.indexer()?.kv().compact()?)
    }

    // events

    /// Registers a callback for database events.
    pub fn on(&self, f: impl Fn(&DbEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on(f)
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// A channel receiving every future database event.
    pub fn subscribe(&self) -> Receiver<DbEvent> {
        self.events.subscribe()
    }
}

impl Drop for SiteDb {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_rules() {
        let db = SiteDb::new("t", DbConfig::in_memory());
        db.define("posts", TableSchema::new()).unwrap();
        assert!(matches!(
            db.define("posts", TableSchema::new()),
            Err(DbError::Schema { .. })
        ));
        assert!(matches!(
            db.define("a/b", TableSchema::new()),
            Err(DbError::Schema { .. })
        ));
        assert!(matches!(
            db.define("bad", TableSchema::new().with_named_index("x", ["a", "a+b"])),
            Err(DbError::Schema { .. })
        ));

        db.open().unwrap();
        assert!(matches!(
            db.define("late", TableSchema::new()),
            Err(DbError::Schema { .. })
        ));
        assert!(matches!(db.open(), Err(DbError::Schema { .. })));
    }

    #[test]
    fn tables_require_open() {
        let db = SiteDb::new("t", DbConfig::in_memory());
        db.define("posts", TableSchema::new()).unwrap();
        assert!(matches!(db.table("posts"), Err(DbError::Closed)));

        db.open().unwrap();
        assert_eq!(db.table("posts").unwrap().name(), "posts");
        assert!(matches!(db.table("nope"), Err(DbError::Parameter { .. })));
        assert_eq!(db.tables().unwrap().len(), 1);

        let posts = db.table("posts").unwrap();
        db.close();
        assert!(!db.is_open());
        assert!(matches!(posts.count(), Err(DbError::Closed)));
        assert!(matches!(db.watermark("dweb://x"), Err(DbError::Closed)));
    }

    #[test]
    fn first_open_reports_every_table() {
        let db = SiteDb::new("t", DbConfig::in_memory());
        db.define("a", TableSchema::new()).unwrap();
        db.define("b", TableSchema::new().helper()).unwrap();
        let rx = db.subscribe();
        let report = db.open().unwrap();
        assert_eq!(report.rebuilds, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            rx.try_recv().unwrap(),
            DbEvent::IndexesReset {
                tables: vec!["a".into(), "b".into()]
            }
        );
    }
}
