//! Compiling where-clause operators into scan plans.
//!
//! A plan is a list of disjoint key ranges visited in index order, plus an
//! optional per-entry filter. Unions (`AnyOf`, `StartsWithAnyOf`) become
//! several ranges and are deduplicated by url, since a multi-entry record
//! can match more than one of them. Negations (`NoneOf`, `NotEqual`) scan
//! the full range and drop excluded keys. Case-insensitive operators scan
//! every text key and compare against the lowercased key.

use crate::error::{CoreError, CoreResult};
use crate::range::{Direction, KeyRange};
use sitedb_codec::{encode_key, text_prefix, KeyValue};
use std::collections::BTreeSet;
use std::ops::Bound;

/// A bound operator applied to a selected index.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereOp {
    /// Key equals the value.
    Equals(KeyValue),
    /// Key is strictly greater.
    Above(KeyValue),
    /// Key is greater or equal.
    AboveOrEqual(KeyValue),
    /// Key is strictly less.
    Below(KeyValue),
    /// Key is less or equal.
    BelowOrEqual(KeyValue),
    /// Key lies between two values.
    Between {
        /// Lower value.
        lower: KeyValue,
        /// Upper value.
        upper: KeyValue,
        /// Whether `lower` itself matches.
        include_lower: bool,
        /// Whether `upper` itself matches.
        include_upper: bool,
    },
    /// Key equals any of the values.
    AnyOf(Vec<KeyValue>),
    /// Key equals none of the values.
    NoneOf(Vec<KeyValue>),
    /// Key differs from the value.
    NotEqual(KeyValue),
    /// Text key starts with the prefix.
    StartsWith(String),
    /// Text key starts with any of the prefixes.
    StartsWithAnyOf(Vec<String>),
    /// Text key equals the value ignoring case.
    EqualsIgnoreCase(String),
    /// Text key equals any of the values ignoring case.
    AnyOfIgnoreCase(Vec<String>),
    /// Text key starts with the prefix ignoring case.
    StartsWithIgnoreCase(String),
    /// Text key starts with any of the prefixes ignoring case.
    StartsWithAnyOfIgnoreCase(Vec<String>),
}

/// Per-entry check applied after the range scan.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntryFilter {
    /// Every entry in range matches.
    #[default]
    None,
    /// Drop entries whose encoded key is in the set.
    Exclude(BTreeSet<Vec<u8>>),
    /// Keep text keys whose lowercase form is in the list.
    FoldedEquals(Vec<String>),
    /// Keep text keys whose lowercase form starts with any prefix.
    FoldedPrefix(Vec<String>),
}

impl EntryFilter {
    /// Returns true if an entry with this key passes.
    #[must_use]
    pub fn accepts(&self, key: &KeyValue, raw_key: &[u8]) -> bool {
        match self {
            Self::None => true,
            Self::Exclude(set) => !set.contains(raw_key),
            Self::FoldedEquals(values) => key
                .as_text()
                .is_some_and(|t| values.contains(&t.to_lowercase())),
            Self::FoldedPrefix(prefixes) => key.as_text().is_some_and(|t| {
                let folded = t.to_lowercase();
                prefixes.iter().any(|p| folded.starts_with(p.as_str()))
            }),
        }
    }
}

/// Ranges to visit, in visiting order, and how to filter them.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// Disjoint ranges, ordered for the scan direction.
    pub ranges: Vec<KeyRange>,
    /// Filter applied to each entry.
    pub filter: EntryFilter,
    /// Whether to yield each url at most once.
    pub dedupe: bool,
}

impl ScanPlan {
    /// Visits the whole index.
    #[must_use]
    pub fn full() -> Self {
        Self::single(KeyRange::all())
    }

    fn single(range: KeyRange) -> Self {
        Self {
            ranges: vec![range],
            filter: EntryFilter::None,
            dedupe: false,
        }
    }

    fn union(mut ranges: Vec<KeyRange>) -> Self {
        ranges.retain(|r| !r.is_empty());
        Self {
            ranges,
            filter: EntryFilter::None,
            dedupe: true,
        }
    }

    fn filtered(range: KeyRange, filter: EntryFilter, dedupe: bool) -> Self {
        Self {
            ranges: vec![range],
            filter,
            dedupe,
        }
    }

    /// Compiles an operator into a plan for the given direction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for values that cannot be encoded as keys
    /// (NaN numbers).
    pub fn compile(op: &WhereOp, direction: Direction) -> CoreResult<Self> {
        let mut plan = match op {
            WhereOp::Equals(v) => Self::single(KeyRange::point(v).map_err(invalid)?),
            WhereOp::Above(v) => Self::bounded(Bound::Excluded(v), Bound::Unbounded)?,
            WhereOp::AboveOrEqual(v) => Self::bounded(Bound::Included(v), Bound::Unbounded)?,
            WhereOp::Below(v) => Self::bounded(Bound::Unbounded, Bound::Excluded(v))?,
            WhereOp::BelowOrEqual(v) => Self::bounded(Bound::Unbounded, Bound::Included(v))?,
            WhereOp::Between {
                lower,
                upper,
                include_lower,
                include_upper,
            } => Self::bounded(
                if *include_lower {
                    Bound::Included(lower)
                } else {
                    Bound::Excluded(lower)
                },
                if *include_upper {
                    Bound::Included(upper)
                } else {
                    Bound::Excluded(upper)
                },
            )?,
            WhereOp::AnyOf(values) => {
                let keys = encode_all(values)?;
                Self::union(keys.into_iter().map(KeyRange::prefix).collect())
            }
            WhereOp::NoneOf(values) => Self::filtered(
                KeyRange::all(),
                EntryFilter::Exclude(encode_all(values)?),
                false,
            ),
            WhereOp::NotEqual(v) => Self::filtered(
                KeyRange::all(),
                EntryFilter::Exclude(encode_all(std::slice::from_ref(v))?),
                false,
            ),
            WhereOp::StartsWith(prefix) => Self::filtered(
                KeyRange::prefix(text_prefix(prefix)),
                EntryFilter::None,
                true,
            ),
            WhereOp::StartsWithAnyOf(prefixes) => Self::union(
                minimal_prefixes(prefixes)
                    .into_iter()
                    .map(|p| KeyRange::prefix(text_prefix(&p)))
                    .collect(),
            ),
            WhereOp::EqualsIgnoreCase(value) => Self::filtered(
                text_keys(),
                EntryFilter::FoldedEquals(vec![value.to_lowercase()]),
                true,
            ),
            WhereOp::AnyOfIgnoreCase(values) => Self::filtered(
                text_keys(),
                EntryFilter::FoldedEquals(values.iter().map(|v| v.to_lowercase()).collect()),
                true,
            ),
            WhereOp::StartsWithIgnoreCase(prefix) => Self::filtered(
                text_keys(),
                EntryFilter::FoldedPrefix(vec![prefix.to_lowercase()]),
                true,
            ),
            WhereOp::StartsWithAnyOfIgnoreCase(prefixes) => Self::filtered(
                text_keys(),
                EntryFilter::FoldedPrefix(prefixes.iter().map(|p| p.to_lowercase()).collect()),
                true,
            ),
        };
        if direction == Direction::Reverse {
            plan.ranges.reverse();
        }
        Ok(plan)
    }

    fn bounded(lower: Bound<&KeyValue>, upper: Bound<&KeyValue>) -> CoreResult<Self> {
        KeyRange::from_values(lower, upper)
            .map(Self::single)
            .map_err(invalid)
    }

    /// Returns true if the plan can match nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().all(KeyRange::is_empty)
    }
}

fn invalid(err: CoreError) -> CoreError {
    match err {
        CoreError::Codec(e) => CoreError::invalid_argument(format!("bad key value: {e}")),
        other => other,
    }
}

/// Sorted, deduplicated encodings.
fn encode_all(values: &[KeyValue]) -> CoreResult<BTreeSet<Vec<u8>>> {
    values
        .iter()
        .map(|v| encode_key(v).map_err(|e| invalid(e.into())))
        .collect()
}

/// Every text key (the text tag range).
fn text_keys() -> KeyRange {
    KeyRange::prefix(text_prefix(""))
}

/// Drops prefixes already covered by a shorter one, sorted.
fn minimal_prefixes(prefixes: &[String]) -> Vec<String> {
    let sorted: BTreeSet<&str> = prefixes.iter().map(String::as_str).collect();
    let mut kept: Vec<String> = Vec::new();
    for p in sorted {
        // sorted order puts a covering prefix directly before what it covers
        if kept.last().is_some_and(|k| p.starts_with(k.as_str())) {
            continue;
        }
        kept.push(p.to_string());
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_of_sorts_and_dedupes() {
        let plan = ScanPlan::compile(
            &WhereOp::AnyOf(vec!["b".into(), "a".into(), "b".into()]),
            Direction::Forward,
        )
        .unwrap();
        assert_eq!(plan.ranges.len(), 2);
        assert!(plan.ranges[0].contains(&encode_key(&"a".into()).unwrap()));
        assert!(plan.ranges[1].contains(&encode_key(&"b".into()).unwrap()));
        assert!(plan.dedupe);

        let reversed = ScanPlan::compile(
            &WhereOp::AnyOf(vec!["a".into(), "b".into()]),
            Direction::Reverse,
        )
        .unwrap();
        assert!(reversed.ranges[0].contains(&encode_key(&"b".into()).unwrap()));
    }

    #[test]
    fn prefix_plans_dedupe() {
        let single = ScanPlan::compile(&WhereOp::StartsWith("a".into()), Direction::Forward).unwrap();
        let union =
            ScanPlan::compile(&WhereOp::StartsWithAnyOf(vec!["a".into()]), Direction::Forward)
                .unwrap();
        assert!(single.dedupe && union.dedupe);
        assert_eq!(single.ranges, union.ranges);
    }

    #[test]
    fn empty_any_of_matches_nothing() {
        let plan = ScanPlan::compile(&WhereOp::AnyOf(vec![]), Direction::Forward).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn covered_prefixes_dropped() {
        assert_eq!(
            minimal_prefixes(&["abc".into(), "ab".into(), "b".into(), "abd".into()]),
            vec!["ab".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn not_equal_excludes() {
        let plan = ScanPlan::compile(&WhereOp::NotEqual(1.into()), Direction::Forward).unwrap();
        let one = encode_key(&1.into()).unwrap();
        let two = encode_key(&2.into()).unwrap();
        assert!(!plan.filter.accepts(&1.into(), &one));
        assert!(plan.filter.accepts(&2.into(), &two));
        assert!(!plan.dedupe);
    }

    #[test]
    fn folded_filters() {
        let eq = EntryFilter::FoldedEquals(vec!["rice".into()]);
        assert!(eq.accepts(&"RiCe".into(), &[]));
        assert!(!eq.accepts(&"Ricey".into(), &[]));
        assert!(!eq.accepts(&1.into(), &[]));

        let prefix = EntryFilter::FoldedPrefix(vec!["ri".into()]);
        assert!(prefix.accepts(&"RICE".into(), &[]));
        assert!(!prefix.accepts(&"taggart".into(), &[]));
    }

    #[test]
    fn inverted_between_is_empty() {
        let plan = ScanPlan::compile(
            &WhereOp::Between {
                lower: 5.into(),
                upper: 1.into(),
                include_lower: true,
                include_upper: true,
            },
            Direction::Forward,
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn nan_rejected() {
        let err = ScanPlan::compile(&WhereOp::Equals(KeyValue::Number(f64::NAN)), Direction::Forward)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }
}
