//! In-memory source for tests and examples.

use crate::source::{
    ChangeKind, ChangeNotice, ChangeStream, HistoryEntry, Source, SourceError, SourceInfo,
    SourceResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sitedb_core::FilePatterns;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};

struct Watcher {
    id: u64,
    patterns: FilePatterns,
    tx: UnboundedSender<ChangeNotice>,
}

#[derive(Default)]
struct Files {
    files: BTreeMap<String, Vec<u8>>,
    history: Vec<HistoryEntry>,
}

/// A versioned source held in memory.
///
/// Every write bumps the version by one and is recorded in the history.
/// Failure injection covers the conditions the indexer must survive:
/// timeouts ([`set_offline`](Self::set_offline)), reads that never answer
/// ([`set_hanging`](Self::set_hanging)), per-file read errors and loss of
/// ownership.
pub struct MemorySource {
    url: String,
    files: Mutex<Files>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    next_watcher: AtomicU64,
    owner: AtomicBool,
    offline: AtomicBool,
    hanging: AtomicBool,
    failing_reads: Mutex<HashSet<String>>,
    history_delay: Mutex<Option<Duration>>,
    history_in_flight: AtomicUsize,
    max_history_in_flight: AtomicUsize,
    history_calls: AtomicUsize,
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("url", &self.url)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl MemorySource {
    /// Creates an empty, owned source at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            files: Mutex::new(Files::default()),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_watcher: AtomicU64::new(0),
            owner: AtomicBool::new(true),
            offline: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            failing_reads: Mutex::new(HashSet::new()),
            history_delay: Mutex::new(None),
            history_in_flight: AtomicUsize::new(0),
            max_history_in_flight: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
        }
    }

    /// Current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.files.lock().history.len() as u64
    }

    /// Writes raw bytes, bypassing the ownership check.
    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>) -> u64 {
        let path = normalize(path);
        let version = {
            let mut files = self.files.lock();
            files.files.insert(path.clone(), data.into());
            record(&mut files, &path, ChangeKind::Put)
        };
        self.notify(&path);
        version
    }

    /// Writes a JSON document, bypassing the ownership check.
    pub fn put_json(&self, path: &str, value: &Value) -> u64 {
        self.put_file(path, value.to_string())
    }

    /// Removes a file, bypassing the ownership check.
    ///
    /// Returns the new version, or `None` if the file did not exist.
    pub fn remove_file(&self, path: &str) -> Option<u64> {
        let path = normalize(path);
        let version = {
            let mut files = self.files.lock();
            files.files.remove(&path)?;
            record(&mut files, &path, ChangeKind::Del)
        };
        self.notify(&path);
        Some(version)
    }

    /// Reads a file as JSON.
    #[must_use]
    pub fn json(&self, path: &str) -> Option<Value> {
        let files = self.files.lock();
        let bytes = files.files.get(&normalize(path))?;
        serde_json::from_slice(bytes).ok()
    }

    /// Returns true if the file exists.
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.files.lock().files.contains_key(&normalize(path))
    }

    /// Sends an invalidation notice for `path` to matching watchers.
    pub fn invalidate(&self, path: &str) {
        let path = normalize(path);
        self.broadcast(&path, || ChangeNotice::Invalidated { path: path.clone() });
    }

    /// Grants or revokes write access.
    pub fn set_owner(&self, owner: bool) {
        self.owner.store(owner, Ordering::SeqCst);
    }

    /// While offline, metadata, history and reads fail with a timeout.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While hanging, metadata, history and reads never complete.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Makes reads of `path` fail with an I/O error.
    pub fn fail_reads_of(&self, path: &str) {
        self.failing_reads.lock().insert(normalize(path));
    }

    /// Clears injected read failures.
    pub fn clear_read_failures(&self) {
        self.failing_reads.lock().clear();
    }

    /// Delays every history call, to widen race windows in tests.
    pub fn set_history_delay(&self, delay: Option<Duration>) {
        *self.history_delay.lock() = delay;
    }

    /// Largest number of history calls seen running at once.
    #[must_use]
    pub fn max_concurrent_history(&self) -> usize {
        self.max_history_in_flight.load(Ordering::SeqCst)
    }

    /// Total history calls.
    #[must_use]
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Number of open change streams.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    fn notify(&self, path: &str) {
        self.broadcast(path, || ChangeNotice::Changed {
            path: path.to_string(),
        });
    }

    fn broadcast(&self, path: &str, notice: impl Fn() -> ChangeNotice) {
        self.watchers
            .lock()
            .retain(|w| !w.patterns.matches(path) || w.tx.send(notice()).is_ok());
    }

    async fn reachable(&self, operation: &str) -> SourceResult<()> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SourceError::timeout(operation));
        }
        Ok(())
    }

    fn check_owner(&self) -> SourceResult<()> {
        if self.owner.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SourceError::ReadOnly)
        }
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn record(files: &mut Files, path: &str, kind: ChangeKind) -> u64 {
    let version = files.history.len() as u64 + 1;
    files.history.push(HistoryEntry {
        path: path.to_string(),
        version,
        kind,
    });
    version
}

#[async_trait]
impl Source for MemorySource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_info(&self) -> SourceResult<SourceInfo> {
        self.reachable("get_info").await?;
        Ok(SourceInfo {
            version: self.version(),
            is_owner: self.owner.load(Ordering::SeqCst),
        })
    }

    async fn history(&self, start: u64, end: u64) -> SourceResult<Vec<HistoryEntry>> {
        self.reachable("history").await?;
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.history_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_history_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.history_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let entries = self
            .files
            .lock()
            .history
            .iter()
            .filter(|e| e.version >= start && e.version < end)
            .cloned()
            .collect();
        self.history_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> SourceResult<Vec<u8>> {
        self.reachable("read_file").await?;
        let path = normalize(path);
        if self.failing_reads.lock().contains(&path) {
            return Err(SourceError::Io {
                message: format!("injected read failure for {path}"),
            });
        }
        self.files
            .lock()
            .files
            .get(&path)
            .cloned()
            .ok_or(SourceError::NotFound { path })
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> SourceResult<()> {
        self.check_owner()?;
        self.put_file(path, data);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> SourceResult<()> {
        self.check_owner()?;
        self.remove_file(path)
            .map(|_| ())
            .ok_or_else(|| SourceError::NotFound {
                path: path.to_string(),
            })
    }

    async fn readdir(&self, path: &str, recursive: bool) -> SourceResult<Vec<String>> {
        self.reachable("readdir").await?;
        let dir = normalize(path);
        let prefix = if dir.ends_with('/') {
            dir
        } else {
            format!("{dir}/")
        };
        let files = self.files.lock();
        let mut out: Vec<String> = Vec::new();
        for file in files.files.keys() {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            if recursive {
                out.push(rest.to_string());
            } else {
                let entry = rest.split('/').next().unwrap_or(rest).to_string();
                if out.last() != Some(&entry) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    fn create_change_stream(&self, patterns: &FilePatterns) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher.fetch_add(1, Ordering::SeqCst);
        self.watchers.lock().push(Watcher {
            id,
            patterns: patterns.clone(),
            tx,
        });
        let watchers = Arc::clone(&self.watchers);
        ChangeStream::new(rx, move || watchers.lock().retain(|w| w.id != id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn versions_and_history() {
        let source = MemorySource::new("dweb://alice");
        assert_eq!(source.put_json("/a.json", &json!({"n": 1})), 1);
        assert_eq!(source.put_json("b.json", &json!({"n": 2})), 2);
        assert_eq!(source.remove_file("/a.json"), Some(3));
        assert_eq!(source.remove_file("/a.json"), None);

        let info = source.get_info().await.unwrap();
        assert_eq!(info.version, 3);
        assert!(info.is_owner);

        let slice = source.history(2, 4).await.unwrap();
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].path, "/b.json");
        assert_eq!(slice[1].kind, ChangeKind::Del);
    }

    #[tokio::test]
    async fn readdir_lists_relative_paths() {
        let source = MemorySource::new("dweb://alice");
        source.put_file("/profile.json", "{}");
        source.put_file("/posts/1.json", "{}");
        source.put_file("/posts/2.json", "{}");
        assert_eq!(
            source.readdir("/", true).await.unwrap(),
            vec!["posts/1.json", "posts/2.json", "profile.json"]
        );
        assert_eq!(
            source.readdir("/", false).await.unwrap(),
            vec!["posts", "profile.json"]
        );
        assert_eq!(
            source.readdir("/posts", false).await.unwrap(),
            vec!["1.json", "2.json"]
        );
    }

    #[tokio::test]
    async fn failure_injection() {
        let source = MemorySource::new("dweb://alice");
        source.put_file("/a.json", "{}");
        source.set_offline(true);
        assert!(matches!(
            source.get_info().await,
            Err(SourceError::Timeout { .. })
        ));
        source.set_offline(false);

        source.fail_reads_of("/a.json");
        assert!(matches!(
            source.read_file("/a.json").await,
            Err(SourceError::Io { .. })
        ));
        source.clear_read_failures();
        assert!(source.read_file("/a.json").await.is_ok());
        assert!(matches!(
            source.read_file("/missing.json").await,
            Err(SourceError::NotFound { .. })
        ));

        source.set_owner(false);
        assert_eq!(
            source.write_file("/b.json", b"{}").await,
            Err(SourceError::ReadOnly)
        );
    }

    #[tokio::test]
    async fn change_streams_filter_and_close() {
        let source = MemorySource::new("dweb://alice");
        let patterns = FilePatterns::new(["/posts/*.json"]).unwrap();
        let mut stream = source.create_change_stream(&patterns);
        assert_eq!(source.watcher_count(), 1);

        source.put_file("/other.txt", "x");
        source.put_file("/posts/1.json", "{}");
        source.invalidate("/posts/2.json");
        assert_eq!(
            stream.recv().await,
            Some(ChangeNotice::Changed {
                path: "/posts/1.json".into()
            })
        );
        assert_eq!(
            stream.recv().await,
            Some(ChangeNotice::Invalidated {
                path: "/posts/2.json".into()
            })
        );

        stream.close();
        assert_eq!(source.watcher_count(), 0);
        assert_eq!(stream.recv().await, None);
    }
}
