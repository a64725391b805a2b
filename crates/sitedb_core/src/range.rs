//! Key ranges and lazy range scans.

use crate::error::CoreResult;
use crate::kv::{KvStore, KvView};
use sitedb_codec::{ceiling_of, encode_key, KeyValue};
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

/// Traversal order of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending key order.
    #[default]
    Forward,
    /// Descending key order.
    Reverse,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

/// A range over raw stored keys.
///
/// Built from value bounds with [`KeyRange::from_values`]. Because stored
/// index keys are `encode(value) ++ encode(url)`, the value bounds are
/// widened with [`ceiling_of`] where needed so that every entry of a
/// boundary value lands on the correct side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub lower: Bound<Vec<u8>>,
    /// Upper bound.
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    /// The unbounded range.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// A range from raw bounds.
    #[must_use]
    pub fn new(lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> Self {
        Self { lower, upper }
    }

    /// Every key that starts with `prefix`.
    #[must_use]
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let upper = ceiling_of(&prefix);
        Self {
            lower: Bound::Included(prefix),
            upper: Bound::Excluded(upper),
        }
    }

    /// Every entry whose value lies within the given value bounds.
    ///
    /// - `gte v` maps to `>= enc(v)`
    /// - `gt v` maps to `> enc(v) ++ 0xFF` (skips every entry of `v`)
    /// - `lte v` maps to `< enc(v) ++ 0xFF` (keeps every entry of `v`)
    /// - `lt v` maps to `< enc(v)`
    ///
    /// # Errors
    ///
    /// Fails if a bound cannot be encoded (NaN).
    pub fn from_values(lower: Bound<&KeyValue>, upper: Bound<&KeyValue>) -> CoreResult<Self> {
        let lower = match lower {
            Bound::Included(v) => Bound::Included(encode_key(v)?),
            Bound::Excluded(v) => Bound::Excluded(ceiling_of(&encode_key(v)?)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(v) => Bound::Excluded(ceiling_of(&encode_key(v)?)),
            Bound::Excluded(v) => Bound::Excluded(encode_key(v)?),
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(Self { lower, upper })
    }

    /// Every entry of exactly `value`.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be encoded.
    pub fn point(value: &KeyValue) -> CoreResult<Self> {
        Ok(Self::prefix(encode_key(value)?))
    }

    /// Returns true if no key can satisfy both bounds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => key >= lo.as_slice(),
            Bound::Excluded(lo) => key > lo.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => key <= hi.as_slice(),
            Bound::Excluded(hi) => key < hi.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }
}

type Resolver<T> = Box<dyn Fn(&KvView<'_>, &[u8], &[u8]) -> Option<T> + Send + Sync>;

/// A lazy, resumable scan over one keyspace.
///
/// Entries are fetched in batches under a short read lock. After each
/// batch the range is narrowed past the last key seen, so the scan
/// tolerates concurrent writes and can be dropped at any point without
/// touching the rest of the keyspace.
///
/// Each raw entry is passed to a resolver while the read lock is still
/// held, so a resolver that looks up related keys sees one consistent
/// snapshot for that entry. Returning `None` skips the entry.
pub struct RangeScan<T> {
    kv: Arc<KvStore>,
    space: String,
    range: KeyRange,
    direction: Direction,
    batch_size: usize,
    buffer: VecDeque<T>,
    exhausted: bool,
    resolve: Resolver<T>,
}

impl<T> RangeScan<T> {
    /// Creates a scan with a resolver for each raw `(key, value)` pair.
    pub fn new<F>(
        kv: Arc<KvStore>,
        space: impl Into<String>,
        range: KeyRange,
        direction: Direction,
        resolve: F,
    ) -> Self
    where
        F: Fn(&KvView<'_>, &[u8], &[u8]) -> Option<T> + Send + Sync + 'static,
    {
        let batch_size = kv.config().scan_batch_size;
        Self {
            kv,
            space: space.into(),
            exhausted: range.is_empty(),
            range,
            direction,
            batch_size,
            buffer: VecDeque::new(),
            resolve: Box::new(resolve),
        }
    }

    fn fill(&mut self) {
        let space = &self.space;
        let range = &self.range;
        let direction = self.direction;
        let batch_size = self.batch_size;
        let resolve = &self.resolve;

        let (items, last_key, fetched) = self.kv.read(|view| {
            let raw = view.scan(space, range, direction, batch_size);
            let fetched = raw.len();
            let last_key = raw.last().map(|(k, _)| k.clone());
            let items: Vec<T> = raw
                .iter()
                .filter_map(|(k, v)| resolve(view, k, v))
                .collect();
            (items, last_key, fetched)
        });

        match last_key {
            Some(last) => match self.direction {
                Direction::Forward => self.range.lower = Bound::Excluded(last),
                Direction::Reverse => self.range.upper = Bound::Excluded(last),
            },
            None => self.exhausted = true,
        }
        if fetched < batch_size || self.range.is_empty() {
            self.exhausted = true;
        }
        self.buffer.extend(items);
    }
}

impl<T> Iterator for RangeScan<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            self.fill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::kv::KvOp;
    use proptest::prelude::*;
    use sitedb_codec::encode_text;
    use std::cmp::Ordering;

    fn raw(v: impl Into<KeyValue>) -> Vec<u8> {
        encode_key(&v.into()).unwrap()
    }

    fn entry(v: impl Into<KeyValue>, url: &str) -> Vec<u8> {
        let mut key = raw(v);
        key.extend(encode_text(url));
        key
    }

    #[test]
    fn value_bounds_cover_whole_entries() {
        let b = KeyValue::from("b");
        let b_entry = entry("b", "u1");
        let a_entry = entry("a", "u1");
        let c_entry = entry("c", "u1");

        let gte = KeyRange::from_values(Bound::Included(&b), Bound::Unbounded).unwrap();
        assert!(gte.contains(&b_entry) && gte.contains(&c_entry) && !gte.contains(&a_entry));

        let gt = KeyRange::from_values(Bound::Excluded(&b), Bound::Unbounded).unwrap();
        assert!(!gt.contains(&b_entry) && gt.contains(&c_entry));

        let lte = KeyRange::from_values(Bound::Unbounded, Bound::Included(&b)).unwrap();
        assert!(lte.contains(&b_entry) && lte.contains(&a_entry) && !lte.contains(&c_entry));

        let lt = KeyRange::from_values(Bound::Unbounded, Bound::Excluded(&b)).unwrap();
        assert!(!lt.contains(&b_entry) && lt.contains(&a_entry));
    }

    #[test]
    fn partial_tuple_bounds() {
        let rice = KeyValue::from(vec![KeyValue::from("Rice")]);
        let rice_jared = entry(vec![KeyValue::from("Rice"), "Jared".into()], "1");
        let taggart = entry(vec![KeyValue::from("Taggart"), "Mike".into()], "3");
        let adams = entry(vec![KeyValue::from("Adams"), "Zed".into()], "4");

        let gte = KeyRange::from_values(Bound::Included(&rice), Bound::Unbounded).unwrap();
        assert!(gte.contains(&rice_jared) && gte.contains(&taggart) && !gte.contains(&adams));

        let lt = KeyRange::from_values(Bound::Unbounded, Bound::Excluded(&rice)).unwrap();
        assert!(lt.contains(&adams) && !lt.contains(&rice_jared));

        // a partial tuple sorts before its extensions
        let lte = KeyRange::from_values(Bound::Unbounded, Bound::Included(&rice)).unwrap();
        assert!(!lte.contains(&rice_jared));
        let gt = KeyRange::from_values(Bound::Excluded(&rice), Bound::Unbounded).unwrap();
        assert!(gt.contains(&rice_jared));
    }

    #[test]
    fn empty_ranges() {
        let a = KeyValue::from(1);
        let b = KeyValue::from(2);
        assert!(KeyRange::from_values(Bound::Included(&b), Bound::Included(&a))
            .unwrap()
            .is_empty());
        assert!(KeyRange::from_values(Bound::Excluded(&a), Bound::Excluded(&a))
            .unwrap()
            .is_empty());
        assert!(!KeyRange::point(&a).unwrap().is_empty());
        assert!(!KeyRange::all().is_empty());
    }

    fn store_with(n: u8) -> Arc<KvStore> {
        let kv = KvStore::open_in_memory(StoreConfig::new().scan_batch_size(3)).unwrap();
        let ops = (0..n)
            .map(|i| KvOp::put("s", vec![i], vec![i]))
            .collect();
        kv.apply(ops).unwrap();
        Arc::new(kv)
    }

    #[test]
    fn scan_crosses_batches_in_both_directions() {
        let kv = store_with(10);
        let forward: Vec<u8> =
            RangeScan::new(kv.clone(), "s", KeyRange::all(), Direction::Forward, |_, k, _| {
                Some(k[0])
            })
            .collect();
        assert_eq!(forward, (0..10).collect::<Vec<_>>());

        let reverse: Vec<u8> =
            RangeScan::new(kv, "s", KeyRange::all(), Direction::Reverse, |_, k, _| Some(k[0]))
                .collect();
        assert_eq!(reverse, (0..10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn scan_respects_bounds_and_early_stop() {
        let kv = store_with(10);
        let range = KeyRange::new(Bound::Excluded(vec![2]), Bound::Included(vec![7]));
        let mut scan = RangeScan::new(kv, "s", range, Direction::Forward, |_, k, _| Some(k[0]));
        assert_eq!(scan.next(), Some(3));
        assert_eq!(scan.next(), Some(4));
        assert_eq!(scan.by_ref().count(), 3);
        assert_eq!(scan.next(), None);
    }

    #[test]
    fn scan_sees_writes_after_current_batch() {
        let kv = store_with(6);
        let mut scan =
            RangeScan::new(kv.clone(), "s", KeyRange::all(), Direction::Forward, |_, k, _| {
                Some(k[0])
            });
        assert_eq!(scan.next(), Some(0));
        kv.apply(vec![KvOp::delete("s", vec![4]), KvOp::put("s", vec![9], vec![])])
            .unwrap();
        let rest: Vec<u8> = scan.collect();
        assert_eq!(rest, vec![1, 2, 3, 5, 9]);
    }

    fn key_value() -> impl Strategy<Value = KeyValue> {
        prop_oneof![
            (-20i32..20).prop_map(KeyValue::from),
            "[a-d]{0,3}".prop_map(KeyValue::from),
            prop::collection::vec("[a-c]{0,2}".prop_map(KeyValue::from), 1..3)
                .prop_map(KeyValue::Array),
        ]
    }

    fn bound(kind: u8, v: &KeyValue) -> Bound<&KeyValue> {
        match kind % 3 {
            0 => Bound::Included(v),
            1 => Bound::Excluded(v),
            _ => Bound::Unbounded,
        }
    }

    fn admits_lower(b: Bound<&KeyValue>, v: &KeyValue) -> bool {
        match b {
            Bound::Included(lo) => v.cmp_encoded(lo).unwrap() != Ordering::Less,
            Bound::Excluded(lo) => v.cmp_encoded(lo).unwrap() == Ordering::Greater,
            Bound::Unbounded => true,
        }
    }

    fn admits_upper(b: Bound<&KeyValue>, v: &KeyValue) -> bool {
        match b {
            Bound::Included(hi) => v.cmp_encoded(hi).unwrap() != Ordering::Greater,
            Bound::Excluded(hi) => v.cmp_encoded(hi).unwrap() == Ordering::Less,
            Bound::Unbounded => true,
        }
    }

    proptest! {
        #[test]
        fn value_bounds_agree_with_key_order(
            lo in key_value(),
            hi in key_value(),
            v in key_value(),
            lo_kind in 0u8..3,
            hi_kind in 0u8..3,
            url in "[a-z]{1,6}",
        ) {
            let (lower, upper) = (bound(lo_kind, &lo), bound(hi_kind, &hi));
            let range = KeyRange::from_values(lower, upper).unwrap();
            let expected = admits_lower(lower, &v) && admits_upper(upper, &v);
            prop_assert_eq!(range.contains(&entry(v.clone(), &url)), expected);
        }
    }
}
