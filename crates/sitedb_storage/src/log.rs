//! Append-only log of framed payloads.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::frame::{encode_frame, scan_frames};
use tracing::{debug, warn};

/// A durable sequence of payloads on top of a [`StorageBackend`].
///
/// Each payload is written as one checksummed frame. Opening the log
/// replays every intact frame; a damaged tail (torn write, bit flip) is
/// truncated away so the next append starts on a clean boundary.
pub struct AppendLog {
    backend: Box<dyn StorageBackend>,
    frames: u64,
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog")
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

impl AppendLog {
    /// Opens a log, returning it with every intact payload in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or truncated.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> StorageResult<(Self, Vec<Vec<u8>>)> {
        let bytes = backend.read_all()?;
        let scan = scan_frames(&bytes);
        if let Some(damage) = &scan.damage {
            warn!(
                valid_len = scan.valid_len,
                total_len = bytes.len(),
                %damage,
                "truncating damaged log tail"
            );
            backend.truncate(scan.valid_len)?;
        }
        debug!(frames = scan.payloads.len(), "log replayed");
        let log = Self {
            backend,
            frames: scan.payloads.len() as u64,
        };
        Ok((log, scan.payloads))
    }

    /// Appends one payload, syncing if `sync` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn append(&mut self, payload: &[u8], sync: bool) -> StorageResult<()> {
        let frame = encode_frame(payload)?;
        self.backend.append(&frame)?;
        if sync {
            self.backend.sync()?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Replaces the whole log with the given payloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend replace fails; the old log is kept.
    pub fn rewrite(&mut self, payloads: &[Vec<u8>]) -> StorageResult<()> {
        let mut bytes = Vec::new();
        for payload in payloads {
            bytes.extend(encode_frame(payload)?);
        }
        self.backend.replace(&bytes)?;
        self.frames = payloads.len() as u64;
        Ok(())
    }

    /// Size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }

    /// Number of frames in the log.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;

    #[test]
    fn append_then_reopen() {
        let backend = InMemoryBackend::new();
        let (mut log, payloads) = AppendLog::open(Box::new(backend.clone())).unwrap();
        assert!(payloads.is_empty());
        log.append(b"a", true).unwrap();
        log.append(b"bb", false).unwrap();

        let (log, payloads) = AppendLog::open(Box::new(backend)).unwrap();
        assert_eq!(payloads, vec![b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(log.frames(), 2);
    }

    #[test]
    fn open_truncates_torn_tail() {
        let mut bytes = encode_frame(b"good").unwrap();
        let good_len = bytes.len() as u64;
        bytes.extend_from_slice(&encode_frame(b"partial").unwrap()[..7]);
        let backend = InMemoryBackend::with_data(bytes);

        let (mut log, payloads) = AppendLog::open(Box::new(backend.clone())).unwrap();
        assert_eq!(payloads, vec![b"good".to_vec()]);
        assert_eq!(log.size().unwrap(), good_len);

        log.append(b"next", true).unwrap();
        let (_, payloads) = AppendLog::open(Box::new(backend)).unwrap();
        assert_eq!(payloads, vec![b"good".to_vec(), b"next".to_vec()]);
    }

    #[test]
    fn rewrite_replaces_frames() {
        let backend = InMemoryBackend::new();
        let (mut log, _) = AppendLog::open(Box::new(backend.clone())).unwrap();
        for i in 0..5u8 {
            log.append(&[i], false).unwrap();
        }
        log.rewrite(&[b"snapshot".to_vec()]).unwrap();
        assert_eq!(log.frames(), 1);

        let (_, payloads) = AppendLog::open(Box::new(backend)).unwrap();
        assert_eq!(payloads, vec![b"snapshot".to_vec()]);
    }
}
