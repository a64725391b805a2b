//! Lazy iteration of a scan plan.

use crate::error::CoreResult;
use crate::plan::{EntryFilter, ScanPlan};
use crate::range::{Direction, KeyRange, RangeScan};
use crate::store::{IndexEntry, IndexedStore};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Walks the ranges of a [`ScanPlan`] in order, yielding matching entries.
///
/// Each range is opened only once the previous one is exhausted, so a
/// consumer that stops early never touches the remaining ranges.
pub struct PlanCursor {
    store: Arc<IndexedStore>,
    index: Option<String>,
    direction: Direction,
    ranges: VecDeque<KeyRange>,
    filter: EntryFilter,
    seen: Option<HashSet<String>>,
    current: Option<RangeScan<CoreResult<IndexEntry>>>,
}

impl PlanCursor {
    /// Creates a cursor over `index` (or the primary store for `None`).
    ///
    /// The plan must have been compiled for the same direction.
    #[must_use]
    pub fn new(
        store: Arc<IndexedStore>,
        index: Option<String>,
        plan: ScanPlan,
        direction: Direction,
    ) -> Self {
        Self {
            store,
            index,
            direction,
            ranges: plan.ranges.into(),
            filter: plan.filter,
            seen: plan.dedupe.then(HashSet::new),
            current: None,
        }
    }

    /// Cursor over the whole primary store.
    #[must_use]
    pub fn primary(store: Arc<IndexedStore>, direction: Direction) -> Self {
        Self::new(store, None, ScanPlan::full(), direction)
    }
}

impl Iterator for PlanCursor {
    type Item = CoreResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let range = self.ranges.pop_front()?;
                match self.store.scan(self.index.as_deref(), range, self.direction) {
                    Ok(scan) => self.current = Some(scan),
                    Err(err) => {
                        self.ranges.clear();
                        return Some(Err(err));
                    }
                }
            }
            let entry = match self.current.as_mut().and_then(Iterator::next) {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.current = None;
                    continue;
                }
            };
            if !self.filter.accepts(&entry.key, &entry.raw_key) {
                continue;
            }
            if let Some(seen) = &mut self.seen {
                if !seen.insert(entry.envelope.url.clone()) {
                    continue;
                }
            }
            return Some(Ok(entry));
        }
    }
}
