//! # SiteDB Storage
//!
//! Durable byte storage for SiteDB.
//!
//! Backends are **opaque byte stores**; [`AppendLog`] adds checksummed
//! framing on top and recovers from a torn tail on open. SiteDB writes one
//! frame per atomic batch of keyspace operations and replays the log to
//! rebuild its in-memory state.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral databases
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use sitedb_storage::{AppendLog, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! let (mut log, replayed) = AppendLog::open(Box::new(backend.clone())).unwrap();
//! assert!(replayed.is_empty());
//! log.append(b"batch", true).unwrap();
//!
//! let (_, replayed) = AppendLog::open(Box::new(backend)).unwrap();
//! assert_eq!(replayed, vec![b"batch".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod log;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{compute_crc32, encode_frame, scan_frames, FrameScan, FRAME_HEADER_LEN, FRAME_MAGIC};
pub use log::AppendLog;
pub use memory::InMemoryBackend;
