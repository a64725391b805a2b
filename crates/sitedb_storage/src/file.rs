//! Disk-backed log file.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single log file on disk.
///
/// `sync()` flushes and fsyncs. `replace()` writes a sibling `.tmp`
/// file, fsyncs it and renames it over the log, so after a crash the
/// file holds either the previous contents or the new ones.
///
/// ```no_run
/// use sitedb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut log = FileBackend::open(Path::new("records.log")).unwrap();
/// log.append(b"frame").unwrap();
/// log.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    location: PathBuf,
    handle: RwLock<File>,
    len: u64,
}

impl FileBackend {
    /// Opens the log at `path`, creating an empty one if it is missing.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Io`] when the file cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let handle = open_log(path)?;
        let len = handle.metadata()?.len();
        Ok(Self {
            location: path.to_path_buf(),
            handle: RwLock::new(handle),
            len,
        })
    }

    /// Like [`FileBackend::open`], but creates missing parent directories first.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Io`] on any filesystem error.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)?,
            _ => {}
        }
        Self::open(path)
    }

    /// Location of the log on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.location
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.location.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.location.with_file_name(name)
    }
}

fn open_log(path: &Path) -> StorageResult<File> {
    let handle = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    Ok(handle)
}

impl StorageBackend for FileBackend {
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let mut handle = self.handle.write();
        handle.rewind()?;
        #[allow(clippy::cast_possible_truncation)]
        let mut bytes = Vec::with_capacity(self.len as usize);
        handle.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let start = self.len;
        if !bytes.is_empty() {
            let handle = self.handle.get_mut();
            handle.seek(SeekFrom::Start(start))?;
            handle.write_all(bytes)?;
            self.len = start + bytes.len() as u64;
        }
        Ok(start)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        handle.flush()?;
        handle.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.len)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if new_size > self.len {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size: self.len,
            });
        }
        let handle = self.handle.get_mut();
        handle.set_len(new_size)?;
        handle.sync_all()?;
        self.len = new_size;
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        let staging = self.staging_path();
        let mut out = File::create(&staging)?;
        out.write_all(bytes)?;
        out.sync_all()?;
        drop(out);

        fs::rename(&staging, &self.location)?;
        *self.handle.get_mut() = open_log(&self.location)?;
        self.len = bytes.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.log");
        (dir, path)
    }

    #[test]
    fn missing_file_is_created_empty() {
        let (_dir, path) = scratch();
        let log = FileBackend::open(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(log.size().unwrap(), 0);
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn appends_report_their_start_offset() {
        let (_dir, path) = scratch();
        let mut log = FileBackend::open(&path).unwrap();

        assert_eq!(log.append(b"abc").unwrap(), 0);
        assert_eq!(log.append(b"").unwrap(), 3);
        assert_eq!(log.append(b"defg").unwrap(), 3);
        assert_eq!(log.read_all().unwrap(), b"abcdefg");
    }

    #[test]
    fn reopen_sees_synced_bytes() {
        let (_dir, path) = scratch();
        let mut log = FileBackend::open(&path).unwrap();
        log.append(b"frame-1|frame-2").unwrap();
        log.sync().unwrap();
        drop(log);

        let log = FileBackend::open(&path).unwrap();
        assert_eq!(log.size().unwrap(), 15);
        assert_eq!(log.read_all().unwrap(), b"frame-1|frame-2");
    }

    #[test]
    fn truncate_cuts_a_torn_tail() {
        let (_dir, path) = scratch();
        let mut log = FileBackend::open(&path).unwrap();
        log.append(b"good|torn").unwrap();

        log.truncate(4).unwrap();
        assert_eq!(log.read_all().unwrap(), b"good");
        assert_eq!(log.append(b"!").unwrap(), 4);
        assert!(matches!(
            log.truncate(99),
            Err(StorageError::TruncatePastEnd { requested: 99, size: 5 })
        ));
    }

    #[test]
    fn replace_survives_reopen() {
        let (dir, path) = scratch();
        let mut log = FileBackend::open(&path).unwrap();
        log.append(b"stale stale stale").unwrap();

        log.replace(b"compact").unwrap();
        log.append(b"+1").unwrap();
        assert_eq!(log.read_all().unwrap(), b"compact+1");
        assert!(!dir.path().join("records.log.tmp").exists());
        drop(log);

        let log = FileBackend::open(&path).unwrap();
        assert_eq!(log.read_all().unwrap(), b"compact+1");
    }

    #[test]
    fn parent_directories_are_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("records.log");

        let log = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(log.path(), path.as_path());
        assert!(path.is_file());
    }
}
