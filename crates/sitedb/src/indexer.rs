//! Incremental indexing of sources.
//!
//! The indexer keeps, per source, a watermark: the highest history version
//! whose changes have been applied to every table. A reconciliation pass
//! compares it with the source's live version, replays the missing slice of
//! history and advances the watermark after each applied change, so an
//! interrupted pass resumes where it stopped.
//!
//! Passes for one source are serialized through the `index:{url}` lock;
//! passes for different sources run concurrently.

use crate::config::IndexerConfig;
use crate::error::{DbError, DbResult};
use crate::events::DbEvent;
use crate::lock::LockRegistry;
use crate::source::{ChangeKind, ChangeNotice, HistoryEntry, Source, SourceError, SourceResult};
use crate::table::TableState;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sitedb_codec::KeyValue;
use sitedb_core::{
    Direction, FilePatterns, KeyRange, KvStore, Listeners, SyncStateStore, ORIGIN_INDEX,
};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Lock serializing reconciliation and unindexing of a source.
pub(crate) fn index_lock(url: &str) -> String {
    format!("index:{url}")
}

/// Lock serializing direct writes against a source.
pub(crate) fn source_lock(origin: &str) -> String {
    format!("source:{origin}")
}

/// Lock serializing upserts of one record.
pub(crate) fn record_lock(url: &str) -> String {
    format!("record:{url}")
}

#[derive(Clone)]
struct SourceEntry {
    source: Arc<dyn Source>,
    writable: bool,
}

#[derive(Default)]
struct SourceTasks {
    watch: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl SourceTasks {
    fn abort(&mut self) {
        for handle in [self.watch.take(), self.retry.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Keeps the tables of one open database in step with its sources.
pub(crate) struct Indexer {
    kv: Arc<KvStore>,
    tables: Vec<Arc<TableState>>,
    patterns: FilePatterns,
    sources: RwLock<HashMap<String, SourceEntry>>,
    watermarks: SyncStateStore,
    locks: LockRegistry,
    config: IndexerConfig,
    events: Arc<Listeners<DbEvent>>,
    tasks: Mutex<HashMap<String, SourceTasks>>,
    open: AtomicBool,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("tables", &self.tables.len())
            .field("sources", &self.sources.read().len())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Indexer {
    pub(crate) fn new(
        kv: Arc<KvStore>,
        tables: Vec<Arc<TableState>>,
        config: IndexerConfig,
        events: Arc<Listeners<DbEvent>>,
    ) -> DbResult<Self> {
        let patterns = FilePatterns::new(
            tables
                .iter()
                .flat_map(|t| t.patterns.patterns().iter().cloned()),
        )?;
        Ok(Self {
            watermarks: SyncStateStore::new(kv.clone()),
            kv,
            tables,
            patterns,
            sources: RwLock::new(HashMap::new()),
            locks: LockRegistry::new(),
            config,
            events,
            tasks: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        })
    }

    pub(crate) fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub(crate) fn tables(&self) -> &[Arc<TableState>] {
        &self.tables
    }

    pub(crate) fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub(crate) fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub(crate) fn watermarks(&self) -> &SyncStateStore {
        &self.watermarks
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DbError::Closed)
        }
    }

    pub(crate) fn is_source(&self, url: &str) -> bool {
        self.sources.read().contains_key(url)
    }

    pub(crate) fn list_sources(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.sources.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub(crate) fn source(&self, url: &str) -> Option<Arc<dyn Source>> {
        self.sources.read().get(url).map(|e| e.source.clone())
    }

    /// The registered source at `origin`, if it accepts writes.
    pub(crate) fn writable_source(&self, origin: &str) -> Option<Arc<dyn Source>> {
        self.sources
            .read()
            .get(origin)
            .filter(|e| e.writable)
            .map(|e| e.source.clone())
    }

    /// Like [`writable_source`](Self::writable_source), with the reason as
    /// an error.
    pub(crate) fn require_writable(&self, origin: &str) -> DbResult<Arc<dyn Source>> {
        let sources = self.sources.read();
        let entry = sources.get(origin).ok_or_else(|| {
            DbError::write_rejected(format!("source {origin} is not part of the index"))
        })?;
        if !entry.writable {
            return Err(DbError::write_rejected(format!(
                "source {origin} is not owned by this user"
            )));
        }
        Ok(entry.source.clone())
    }

    fn set_writable(&self, url: &str, writable: bool) {
        if let Some(entry) = self.sources.write().get_mut(url) {
            entry.writable = writable;
        }
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = SourceResult<T>>,
    ) -> SourceResult<T> {
        tokio::time::timeout(self.config.read_timeout, fut)
            .await
            .unwrap_or_else(|_| Err(SourceError::timeout(operation)))
    }

    /// Registers a source and indexes it.
    ///
    /// A source that is already registered is only reconciled again. If the
    /// first pass times out the source stays registered, `SourceMissing` is
    /// emitted and a background task keeps retrying; any other failure emits
    /// `SourceError` and is returned.
    pub(crate) async fn add_source(
        self: &Arc<Self>,
        source: Arc<dyn Source>,
        watch: bool,
    ) -> DbResult<()> {
        self.ensure_open()?;
        let url = source.url().to_string();
        if self.is_source(&url) {
            debug!(source = %url, "already registered, reconciling");
            self.reconcile(&source).await?;
            return Ok(());
        }

        info!(source = %url, watch, "adding source");
        self.sources.write().insert(
            url.clone(),
            SourceEntry {
                source: source.clone(),
                writable: false,
            },
        );

        match self.reconcile(&source).await {
            Ok(_) => {
                if watch {
                    self.watch(&source);
                }
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                info!(source = %url, "source unreachable, starting retry loop");
                self.events.emit(&DbEvent::SourceMissing { url });
                self.spawn_retry(source, watch);
                Ok(())
            }
            Err(e) => {
                error!(source = %url, error = %e, "initial indexing failed");
                self.events.emit(&DbEvent::SourceError {
                    url,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn spawn_retry(self: &Arc<Self>, source: Arc<dyn Source>, watch: bool) {
        let url = source.url().to_string();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.retry_interval;
        let task = async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(indexer) = weak.upgrade() else {
                    return;
                };
                let url = source.url();
                if !indexer.is_open() || !indexer.is_source(url) {
                    debug!("source removed, stopping retry loop");
                    return;
                }
                match indexer.reconcile(&source).await {
                    Ok(_) => {
                        info!("source found");
                        indexer.events.emit(&DbEvent::SourceFound {
                            url: url.to_string(),
                        });
                        if watch {
                            indexer.watch(&source);
                        }
                        return;
                    }
                    Err(e) if e.is_timeout() => debug!("still unreachable"),
                    Err(e) => {
                        warn!(error = %e, "retry failed, giving up");
                        indexer.events.emit(&DbEvent::SourceError {
                            url: url.to_string(),
                            message: e.to_string(),
                        });
                        return;
                    }
                }
            }
        }
        .instrument(info_span!("source", url = %url));

        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        let entry = tasks.entry(url).or_default();
        if let Some(previous) = entry.retry.replace(handle) {
            previous.abort();
        }
    }

    /// Starts reacting to change notices from `source`.
    pub(crate) fn watch(self: &Arc<Self>, source: &Arc<dyn Source>) {
        let url = source.url().to_string();
        let mut tasks = self.tasks.lock();
        let entry = tasks.entry(url.clone()).or_default();
        if entry.watch.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(source = %url, "source is already watched");
            return;
        }

        let mut stream = source.create_change_stream(&self.patterns);
        let source = source.clone();
        let weak = Arc::downgrade(self);
        let task = async move {
            while let Some(notice) = stream.recv().await {
                let Some(indexer) = weak.upgrade() else {
                    break;
                };
                if !indexer.is_open() {
                    break;
                }
                match notice {
                    ChangeNotice::Invalidated { path } => {
                        debug!(%path, "fetching invalidated file");
                        if let Err(e) = indexer.timed("read_file", source.read_file(&path)).await {
                            debug!(%path, error = %e, "fetch failed");
                        }
                    }
                    ChangeNotice::Changed { path } => {
                        debug!(%path, "change notice");
                        if let Err(e) = indexer.reconcile(&source).await {
                            warn!(error = %e, "reconciliation after change failed");
                            indexer.events.emit(&DbEvent::SourceError {
                                url: source.url().to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
        .instrument(info_span!("source", url = %url));
        entry.watch = Some(tokio::spawn(task));
        debug!(source = %url, "watching");
    }

    /// Stops watching `url`. Returns false if it was not watched.
    pub(crate) fn unwatch(&self, url: &str) -> bool {
        let handle = self
            .tasks
            .lock()
            .get_mut(url)
            .and_then(|t| t.watch.take());
        match handle {
            Some(handle) => {
                handle.abort();
                debug!(source = %url, "unwatched");
                true
            }
            None => false,
        }
    }

    /// Returns true if a watch task is running for `url`.
    pub(crate) fn is_watched(&self, url: &str) -> bool {
        self.tasks
            .lock()
            .get(url)
            .and_then(|t| t.watch.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops background work for `url`, deregisters it and removes every
    /// record it produced.
    pub(crate) async fn remove_source(&self, url: &str) -> DbResult<bool> {
        self.ensure_open()?;
        if let Some(mut tasks) = self.tasks.lock().remove(url) {
            tasks.abort();
        }
        let Some(entry) = self.sources.write().remove(url) else {
            return Ok(false);
        };
        info!(source = %url, "removing source");
        self.unsync(&entry.source).await?;
        Ok(true)
    }

    /// Brings every table up to date with `source`'s live version.
    ///
    /// Returns the watermark after the pass.
    pub(crate) async fn reconcile(&self, source: &Arc<dyn Source>) -> DbResult<u64> {
        self.ensure_open()?;
        let url = source.url();
        let _guard = self.locks.acquire(index_lock(url)).await;

        let from = self.watermarks.get(url)?;
        let info = self.timed("get_info", source.get_info()).await?;
        self.set_writable(url, info.is_owner);
        let to = info.version;
        self.events.emit(&DbEvent::SourceIndexing {
            url: url.to_string(),
            from,
            to,
        });

        if from >= to {
            debug!(source = %url, version = from, "index is current");
            self.events.emit(&DbEvent::SourceIndexed {
                url: url.to_string(),
                version: from,
            });
            return Ok(from);
        }

        debug!(source = %url, from, to, "catching up");
        let history = self
            .timed("history", source.history(from + 1, to + 1))
            .await?;
        let updates = self.select_updates(history, from, to);
        let total = updates.len();

        for (i, update) in updates.iter().enumerate() {
            let applied = match update.kind {
                ChangeKind::Del => self.unindex_path(url, &update.path),
                ChangeKind::Put => self.read_and_index(source, &update.path).await,
            };
            if let Err(e) = applied {
                error!(source = %url, path = %update.path, error = %e, "pass aborted");
                return Err(e);
            }
            self.watermarks.advance(url, update.version)?;
            self.events.emit(&DbEvent::SourceIndexProgress {
                url: url.to_string(),
                tick: i + 1,
                total,
            });
        }
        // skipped entries between the last applied change and `to`
        let version = self.watermarks.advance(url, to)?;
        debug!(source = %url, applied = total, version, "caught up");

        self.events.emit(&DbEvent::SourceIndexed {
            url: url.to_string(),
            version,
        });
        self.events.emit(&DbEvent::IndexesUpdated {
            url: url.to_string(),
            version,
        });
        Ok(version)
    }

    /// Keeps the latest change per matching path, ordered by version.
    fn select_updates(&self, history: Vec<HistoryEntry>, from: u64, to: u64) -> Vec<HistoryEntry> {
        let mut latest: HashMap<String, HistoryEntry> = HashMap::new();
        for entry in history {
            if entry.version <= from || entry.version > to || !self.patterns.matches(&entry.path) {
                continue;
            }
            match latest.get(&entry.path) {
                Some(seen) if seen.version >= entry.version => {}
                _ => {
                    latest.insert(entry.path.clone(), entry);
                }
            }
        }
        let mut updates: Vec<HistoryEntry> = latest.into_values().collect();
        updates.sort_by_key(|e| e.version);
        updates
    }

    /// Reads `path` and stores it in every table whose patterns match.
    ///
    /// A missing file counts as a deletion. Unparseable documents and read
    /// failures are errors.
    async fn read_and_index(&self, source: &Arc<dyn Source>, path: &str) -> DbResult<()> {
        let origin = source.url();
        if !self.tables.iter().any(|t| t.patterns.matches(path)) {
            return Ok(());
        }
        let url = format!("{origin}{path}");
        let bytes = match self.timed("read_file", source.read_file(path)).await {
            Ok(bytes) => bytes,
            Err(SourceError::NotFound { .. }) => {
                debug!(%url, "file gone, unindexing");
                return self.unindex_path(origin, path);
            }
            Err(e) => return Err(e.into()),
        };
        let record: Value = serde_json::from_slice(&bytes).map_err(|e| DbError::Parse {
            url: url.clone(),
            message: e.to_string(),
        })?;
        for table in self.tables.iter().filter(|t| t.patterns.matches(path)) {
            table.ingest(&url, origin, record.clone())?;
        }
        Ok(())
    }

    fn unindex_path(&self, origin: &str, path: &str) -> DbResult<()> {
        let url = format!("{origin}{path}");
        for table in self.tables.iter().filter(|t| t.patterns.matches(path)) {
            table.remove(&url)?;
        }
        Ok(())
    }

    /// Indexes a single file outside of history replay.
    pub(crate) async fn index_file(&self, source: &Arc<dyn Source>, path: &str) -> DbResult<()> {
        self.ensure_open()?;
        let _guard = self.locks.acquire(index_lock(source.url())).await;
        self.read_and_index(source, path).await
    }

    /// Removes a single file's records.
    pub(crate) async fn unindex_file(&self, source: &Arc<dyn Source>, path: &str) -> DbResult<()> {
        self.ensure_open()?;
        let _guard = self.locks.acquire(index_lock(source.url())).await;
        self.unindex_path(source.url(), path)
    }

    /// Removes every record of `source` from every table and forgets its
    /// watermark.
    ///
    /// Records are found by listing the source and, so that files deleted
    /// since they were indexed are not missed, through the origin index.
    pub(crate) async fn unsync(&self, source: &Arc<dyn Source>) -> DbResult<usize> {
        let url = source.url();
        let _guard = self.locks.acquire(index_lock(url)).await;

        let listing = match self.timed("readdir", source.readdir("/", true)).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(source = %url, error = %e, "listing failed, using the origin index only");
                Vec::new()
            }
        };

        let mut removed = 0;
        for table in self.tables.iter().filter(|t| !t.schema.is_helper()) {
            let mut urls: BTreeSet<String> = listing
                .iter()
                .filter(|name| table.patterns.matches(name))
                .map(|name| format!("{url}/{}", name.trim_start_matches('/')))
                .collect();
            let range = KeyRange::point(&KeyValue::from(url))?;
            for entry in table.store.scan(Some(ORIGIN_INDEX), range, Direction::Forward)? {
                urls.insert(entry?.envelope.url);
            }
            for record_url in urls {
                if table.remove(&record_url)?.is_some() {
                    removed += 1;
                }
            }
        }
        self.watermarks.remove(url)?;
        info!(source = %url, removed, "source unindexed");
        Ok(removed)
    }

    /// Clears every table and rewinds every watermark when any table needs
    /// a rebuild. Returns true if anything was reset.
    pub(crate) fn reset_outdated(&self, rebuilds: &[String]) -> DbResult<bool> {
        if rebuilds.is_empty() {
            return Ok(false);
        }
        info!(tables = ?rebuilds, "schema changed, rebuilding all indexes");
        for table in &self.tables {
            debug!(table = %table.name, "clearing");
            table.store.clear()?;
        }
        self.watermarks.reset_all()?;
        Ok(true)
    }

    /// Stops background work and forgets every source.
    pub(crate) fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        for (_, mut tasks) in self.tasks.lock().drain() {
            tasks.abort();
        }
        self.sources.write().clear();
        debug!("indexer shut down");
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        for (_, tasks) in self.tasks.get_mut().iter_mut() {
            tasks.abort();
        }
    }
}
