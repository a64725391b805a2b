//! # SiteDB
//!
//! Incremental document indexer with a relational-like query surface.
//!
//! SiteDB watches versioned content sources, picks out the JSON documents
//! each table's file patterns select, and keeps them in a local store with
//! ordered secondary indexes. Tables are queried with a fluent builder:
//! range bounds, compound and multi-entry keys, filters, offset and limit.
//!
//! This crate provides:
//! - [`SiteDb`]: table definitions, open/close and schema-change rebuilds
//! - The indexer: per-source watermarks, resumable history replay, a
//!   background retry loop for unreachable sources, change watching
//! - [`Table`], [`Query`] and [`WhereClause`]
//! - The [`Source`] trait and an in-memory [`MemorySource`]
//! - [`LockRegistry`], the named async locks serializing work per source
//!
//! ## Key Invariants
//!
//! - A source's watermark only moves forward, and only past applied changes
//! - Reconciliation of one source never interleaves with itself
//! - A document that fails validation is never left in the index
//! - Writes to source-backed tables go through the source; the index follows

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod error;
mod events;
mod indexer;
mod lock;
mod memory_source;
mod query;
mod source;
mod table;
mod where_clause;

pub use config::{DbConfig, IndexerConfig, StorageLocation};
pub use database::{OpenReport, SiteDb};
pub use error::{DbError, DbResult};
pub use events::{DbEvent, TableEvent};
pub use lock::{LockGuard, LockRegistry};
pub use memory_source::MemorySource;
pub use query::{Patch, Query, QueryIter};
pub use source::{
    ChangeKind, ChangeNotice, ChangeStream, HistoryEntry, Source, SourceError, SourceInfo,
    SourceResult,
};
pub use table::{Table, UpsertOutcome};
pub use where_clause::WhereClause;

pub use sitedb_codec::KeyValue;
pub use sitedb_core::{
    IndexEntry, ListenerId, RecordEnvelope, RecordHooks, StoreConfig, TableSchema,
};
