//! Bound operators for a selected index.

use crate::error::DbResult;
use crate::query::Query;
use sitedb_codec::KeyValue;
use sitedb_core::WhereOp;

/// A query with an index selected and no bound yet.
///
/// Each operator returns the bounded [`Query`]. Compound indexes take
/// arrays; a shorter array acts as a prefix, so `above_or_equal(["b"])` on
/// `type+createdAt` matches every record whose type is at least `"b"`.
///
/// `between` excludes both ends; use [`between_with`](Self::between_with)
/// to include them.
#[derive(Debug, Clone)]
pub struct WhereClause {
    query: Query,
}

impl WhereClause {
    pub(crate) fn new(query: Query) -> Self {
        Self { query }
    }

    /// The selected index.
    #[must_use]
    pub fn index(&self) -> &str {
        self.query.index().unwrap_or_default()
    }

    fn bind(self, op: WhereOp) -> DbResult<Query> {
        self.query.bind(op)
    }

    /// Key equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn equals(self, value: impl Into<KeyValue>) -> DbResult<Query> {
        self.bind(WhereOp::Equals(value.into()))
    }

    /// Key is greater than `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn above(self, value: impl Into<KeyValue>) -> DbResult<Query> {
        self.bind(WhereOp::Above(value.into()))
    }

    /// Key is greater than or equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn above_or_equal(self, value: impl Into<KeyValue>) -> DbResult<Query> {
        self.bind(WhereOp::AboveOrEqual(value.into()))
    }

    /// Key is less than `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn below(self, value: impl Into<KeyValue>) -> DbResult<Query> {
        self.bind(WhereOp::Below(value.into()))
    }

    /// Key is less than or equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn below_or_equal(self, value: impl Into<KeyValue>) -> DbResult<Query> {
        self.bind(WhereOp::BelowOrEqual(value.into()))
    }

    /// Key lies strictly between `lower` and `upper`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn between(
        self,
        lower: impl Into<KeyValue>,
        upper: impl Into<KeyValue>,
    ) -> DbResult<Query> {
        self.between_with(lower, upper, false, false)
    }

    /// Key lies between `lower` and `upper`, with each end included as
    /// requested.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn between_with(
        self,
        lower: impl Into<KeyValue>,
        upper: impl Into<KeyValue>,
        include_lower: bool,
        include_upper: bool,
    ) -> DbResult<Query> {
        self.bind(WhereOp::Between {
            lower: lower.into(),
            upper: upper.into(),
            include_lower,
            include_upper,
        })
    }

    /// Key equals any of `values`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn any_of<I, V>(self, values: I) -> DbResult<Query>
    where
        I: IntoIterator<Item = V>,
        V: Into<KeyValue>,
    {
        self.bind(WhereOp::AnyOf(values.into_iter().map(Into::into).collect()))
    }

    /// Key equals none of `values`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn none_of<I, V>(self, values: I) -> DbResult<Query>
    where
        I: IntoIterator<Item = V>,
        V: Into<KeyValue>,
    {
        self.bind(WhereOp::NoneOf(values.into_iter().map(Into::into).collect()))
    }

    /// Key differs from `value`.
    ///
    /// # Errors
    ///
    /// Returns `Parameter` for a value with no key encoding.
    pub fn not_equal(self, value: impl Into<KeyValue>) -> DbResult<Query> {
        self.bind(WhereOp::NotEqual(value.into()))
    }

    /// Text key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other operators.
    pub fn starts_with(self, prefix: impl Into<String>) -> DbResult<Query> {
        self.bind(WhereOp::StartsWith(prefix.into()))
    }

    /// Text key starts with any of `prefixes`.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other operators.
    pub fn starts_with_any_of<I, S>(self, prefixes: I) -> DbResult<Query>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bind(WhereOp::StartsWithAnyOf(
            prefixes.into_iter().map(Into::into).collect(),
        ))
    }

    /// Text key equals `value`, ignoring case.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other operators.
    pub fn equals_ignore_case(self, value: impl Into<String>) -> DbResult<Query> {
        self.bind(WhereOp::EqualsIgnoreCase(value.into()))
    }

    /// Text key equals any of `values`, ignoring case.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other operators.
    pub fn any_of_ignore_case<I, S>(self, values: I) -> DbResult<Query>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bind(WhereOp::AnyOfIgnoreCase(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    /// Text key starts with `prefix`, ignoring case.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other operators.
    pub fn starts_with_ignore_case(self, prefix: impl Into<String>) -> DbResult<Query> {
        self.bind(WhereOp::StartsWithIgnoreCase(prefix.into()))
    }

    /// Text key starts with any of `prefixes`, ignoring case.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other operators.
    pub fn starts_with_any_of_ignore_case<I, S>(self, prefixes: I) -> DbResult<Query>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bind(WhereOp::StartsWithAnyOfIgnoreCase(
            prefixes.into_iter().map(Into::into).collect(),
        ))
    }
}
