//! # SiteDB Core
//!
//! Synchronous embedded engine behind SiteDB.
//!
//! This crate provides:
//! - A keyspace store replayed from a CRC-framed append-only log
//! - Per-table primary stores with simple, compound and multi-entry indexes
//! - Lazy, chunked range scans in either direction
//! - Compilation of where-clause operators into scan plans
//! - Table schemas, record hooks and glob file patterns
//! - Source watermarks and schema checksums
//! - Listener registries for lifecycle events
//!
//! The async indexer and query surface live in the `sitedb` crate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
mod dir;
mod envelope;
mod error;
mod events;
pub mod index;
mod kv;
mod meta;
mod plan;
mod range;
mod schema;
mod store;

pub use config::StoreConfig;
pub use cursor::PlanCursor;
pub use dir::DatabaseDir;
pub use envelope::{now_millis, origin_of, RecordEnvelope};
pub use error::{CoreError, CoreResult};
pub use events::{ListenerId, Listeners};
pub use index::{IndexDef, IndexShape, ORIGIN_INDEX, URL_INDEX};
pub use kv::{KvOp, KvStore, KvView};
pub use meta::{ChecksumStore, SyncStateStore};
pub use plan::{EntryFilter, ScanPlan, WhereOp};
pub use range::{Direction, KeyRange, RangeScan};
pub use schema::{FilePatterns, NoHooks, RecordHooks, TableSchema, DEFAULT_FILE_PATTERN};
pub use store::{IndexEntry, IndexedStore};
