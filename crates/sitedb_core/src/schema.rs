//! Table schemas, record hooks and file patterns.

use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDef, ORIGIN_INDEX};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Pattern used when a schema names none.
pub const DEFAULT_FILE_PATTERN: &str = "*.json";

/// Callbacks a schema author supplies for a table.
///
/// All three run on every write path: reconciliation, direct puts and
/// query updates.
pub trait RecordHooks: Send + Sync {
    /// Returns false to reject a document. Rejected documents are treated
    /// as deleted during reconciliation.
    fn validate(&self, record: &Value) -> bool {
        let _ = record;
        true
    }

    /// Transforms a document before it is stored.
    fn preprocess(&self, record: Value) -> Value {
        record
    }

    /// Transforms a document before it is written back to its source.
    fn serialize(&self, record: Value) -> Value {
        record
    }
}

/// Hooks that accept and keep every document as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl RecordHooks for NoHooks {}

/// Immutable description of one table.
///
/// # Example
///
/// ```
/// use sitedb_core::TableSchema;
///
/// let schema = TableSchema::new()
///     .with_file_pattern("/broadcasts/*.json")
///     .with_index("createdAt")
///     .with_index("type+createdAt");
/// assert!(schema.compile_indexes().is_ok());
/// ```
#[derive(Clone)]
pub struct TableSchema {
    patterns: Vec<String>,
    indexes: Vec<(String, Vec<String>)>,
    helper: bool,
    hooks: Arc<dyn RecordHooks>,
    hooks_version: String,
}

impl fmt::Debug for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSchema")
            .field("patterns", &self.patterns)
            .field("indexes", &self.indexes)
            .field("helper", &self.helper)
            .field("hooks_version", &self.hooks_version)
            .finish_non_exhaustive()
    }
}

impl Default for TableSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl TableSchema {
    /// Creates an empty schema with no indexes and no hooks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            indexes: Vec::new(),
            helper: false,
            hooks: Arc::new(NoHooks),
            hooks_version: String::new(),
        }
    }

    /// Adds a file pattern selecting documents for this table.
    #[must_use]
    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Adds an index named after its expression (`*tags` is named `tags`).
    #[must_use]
    pub fn with_index(mut self, expr: impl Into<String>) -> Self {
        let expr = expr.into();
        let name = expr.trim_start_matches('*').to_string();
        self.indexes.push((name, vec![expr]));
        self
    }

    /// Adds an index with several alternative expressions.
    #[must_use]
    pub fn with_named_index<I, S>(mut self, name: impl Into<String>, defs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes
            .push((name.into(), defs.into_iter().map(Into::into).collect()));
        self
    }

    /// Marks the table as a helper table with no backing source.
    #[must_use]
    pub fn helper(mut self) -> Self {
        self.helper = true;
        self
    }

    /// Installs record hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl RecordHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Version tag of the hooks, folded into the checksum.
    ///
    /// Bump it when hook behaviour changes to force a rebuild.
    #[must_use]
    pub fn with_hooks_version(mut self, version: impl Into<String>) -> Self {
        self.hooks_version = version.into();
        self
    }

    /// Returns true for helper tables.
    #[must_use]
    pub fn is_helper(&self) -> bool {
        self.helper
    }

    /// The record hooks.
    #[must_use]
    pub fn hooks(&self) -> &Arc<dyn RecordHooks> {
        &self.hooks
    }

    /// Effective file patterns (the default when none were given).
    ///
    /// Helper tables match no files.
    #[must_use]
    pub fn file_patterns(&self) -> Vec<String> {
        if self.helper {
            Vec::new()
        } else if self.patterns.is_empty() {
            vec![DEFAULT_FILE_PATTERN.to_string()]
        } else {
            self.patterns.clone()
        }
    }

    /// Builds the index definitions, including the automatic origin index.
    ///
    /// # Errors
    ///
    /// Returns a schema error for malformed or conflicting definitions.
    pub fn compile_indexes(&self) -> CoreResult<Vec<IndexDef>> {
        let mut defs = self
            .indexes
            .iter()
            .map(|(name, exprs)| IndexDef::new(name.clone(), exprs))
            .collect::<CoreResult<Vec<_>>>()?;
        if !defs.iter().any(|d| d.name() == ORIGIN_INDEX) {
            defs.push(IndexDef::simple(ORIGIN_INDEX)?);
        }
        Ok(defs)
    }

    /// Compiles the effective file patterns.
    ///
    /// # Errors
    ///
    /// Returns a schema error for an invalid glob.
    pub fn compile_patterns(&self) -> CoreResult<FilePatterns> {
        FilePatterns::new(self.file_patterns())
    }

    /// Hex SHA-256 over a canonical rendering of the schema.
    #[must_use]
    pub fn checksum(&self) -> String {
        let canonical = json!({
            "patterns": self.file_patterns(),
            "indexes": self.indexes,
            "helper": self.helper,
            "hooks": self.hooks_version,
        });
        format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
    }
}

/// A compiled set of glob patterns.
///
/// `*` does not cross `/`. Paths are tried with and without their leading
/// slash, so `*.json` matches `/a.json` and `/posts/*.json` matches
/// `posts/a.json`.
#[derive(Debug, Clone)]
pub struct FilePatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

impl FilePatterns {
    /// Compiles a list of patterns.
    ///
    /// # Errors
    ///
    /// Returns a schema error for an invalid glob.
    pub fn new<I, S>(patterns: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let trimmed = pattern.trim_start_matches('/');
            for p in [pattern.as_str(), trimmed] {
                let glob = GlobBuilder::new(p)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| CoreError::schema(format!("bad file pattern '{pattern}': {e}")))?;
                builder.add(glob);
            }
        }
        let set = builder
            .build()
            .map_err(|e| CoreError::schema(format!("bad file patterns: {e}")))?;
        Ok(Self { patterns, set })
    }

    /// Patterns matching nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    /// Source patterns.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns true if the path matches any pattern.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.set.is_match(path) || self.set.is_match(path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl RecordHooks for Upper {
        fn validate(&self, record: &Value) -> bool {
            record.get("name").is_some_and(Value::is_string)
        }

        fn preprocess(&self, mut record: Value) -> Value {
            if let Some(name) = record.get("name").and_then(Value::as_str) {
                let upper = name.to_uppercase();
                record["name"] = Value::String(upper);
            }
            record
        }
    }

    #[test]
    fn default_pattern() {
        let schema = TableSchema::new();
        assert_eq!(schema.file_patterns(), vec!["*.json"]);
        let p = schema.compile_patterns().unwrap();
        assert!(p.matches("/a.json"));
        assert!(p.matches("a.json"));
        assert!(!p.matches("/posts/a.json"));
        assert!(!p.matches("/a.txt"));
    }

    #[test]
    fn rooted_patterns() {
        let p = FilePatterns::new(["/broadcasts/*.json", "/profile.json"]).unwrap();
        assert!(p.matches("/broadcasts/1.json"));
        assert!(p.matches("broadcasts/1.json"));
        assert!(p.matches("/profile.json"));
        assert!(!p.matches("/broadcasts/deep/1.json"));
        assert!(!p.matches("/other/profile.json"));
    }

    #[test]
    fn helper_tables_match_nothing() {
        let schema = TableSchema::new().helper().with_file_pattern("*.json");
        assert!(schema.file_patterns().is_empty());
        assert!(!schema.compile_patterns().unwrap().matches("/a.json"));
    }

    #[test]
    fn origin_index_added() {
        let defs = TableSchema::new().with_index("a").compile_indexes().unwrap();
        let names: Vec<&str> = defs.iter().map(IndexDef::name).collect();
        assert_eq!(names, vec!["a", ":origin"]);
    }

    #[test]
    fn checksum_tracks_definition() {
        let a = TableSchema::new().with_index("a");
        let b = TableSchema::new().with_index("a");
        let c = TableSchema::new().with_index("b");
        let d = TableSchema::new().with_index("a").with_hooks_version("2");
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert_ne!(a.checksum(), d.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn hooks_run() {
        let schema = TableSchema::new().with_hooks(Upper);
        let hooks = schema.hooks();
        assert!(!hooks.validate(&json!({"name": 1})));
        assert!(hooks.validate(&json!({"name": "x"})));
        assert_eq!(hooks.preprocess(json!({"name": "x"}))["name"], "X");
        assert_eq!(hooks.serialize(json!({"n": 1})), json!({"n": 1}));
    }

    #[test]
    fn mismatched_index_is_schema_error() {
        let schema = TableSchema::new().with_named_index("x", ["a", "b+c"]);
        assert!(matches!(schema.compile_indexes(), Err(CoreError::Schema { .. })));
    }
}
