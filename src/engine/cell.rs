//! OBLIVION - Cells and Row Markers
//! Atomic cells, collection mutations and the reconciliation rules that
//! decide which of two versions of a value survives a merge.
//!
//! ## Reconciliation order (atomic cells)
//! 1. Higher timestamp wins.
//! 2. A dead cell beats a live one.
//! 3. Live cells: greater value bytes, then expiring beats non-expiring,
//!    then later expiry.
//! 4. Dead cells: later deletion time.

use std::cmp::Ordering;

use crate::error::{PartitionError, Result};
use crate::schema::{ColumnDefinition, ColumnType};
use crate::tombstone::Tombstone;
use crate::types::{GcTime, Timestamp, Value, MISSING_TIMESTAMP};

use super::compaction::GcPolicy;

/// Time-to-live attached to a live cell or marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    /// GC clock time the value expires at.
    pub expiry: GcTime,
    /// Original TTL in seconds.
    pub ttl: i64,
}

impl Expiry {
    pub fn is_expired(&self, now: GcTime) -> bool {
        self.expiry <= now
    }

    /// Deletion time recorded when the value expires.
    pub fn deletion_time(&self) -> GcTime {
        self.expiry - self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellState {
    Live { value: Value, expiry: Option<Expiry> },
    Dead { deletion_time: GcTime },
}

/// A single timestamped value, or its deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicCell {
    pub timestamp: Timestamp,
    pub state: CellState,
}

impl AtomicCell {
    pub fn live(timestamp: Timestamp, value: Value) -> Self {
        Self {
            timestamp,
            state: CellState::Live {
                value,
                expiry: None,
            },
        }
    }

    pub fn live_expiring(timestamp: Timestamp, value: Value, expiry: GcTime, ttl: i64) -> Self {
        Self {
            timestamp,
            state: CellState::Live {
                value,
                expiry: Some(Expiry { expiry, ttl }),
            },
        }
    }

    pub fn dead(timestamp: Timestamp, deletion_time: GcTime) -> Self {
        Self {
            timestamp,
            state: CellState::Dead { deletion_time },
        }
    }

    pub fn is_live_state(&self) -> bool {
        matches!(self.state, CellState::Live { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.state {
            CellState::Live { value, .. } => Some(value),
            CellState::Dead { .. } => None,
        }
    }

    pub fn expiry(&self) -> Option<Expiry> {
        match &self.state {
            CellState::Live { expiry, .. } => *expiry,
            CellState::Dead { .. } => None,
        }
    }

    pub fn deletion_time(&self) -> Option<GcTime> {
        match self.state {
            CellState::Dead { deletion_time } => Some(deletion_time),
            CellState::Live { .. } => None,
        }
    }

    /// Live, not shadowed by `tomb` and not expired at `now`.
    pub fn is_live(&self, tomb: Tombstone, now: GcTime) -> bool {
        match &self.state {
            CellState::Live { expiry, .. } => {
                !tomb.deletes(self.timestamp) && expiry.map_or(true, |e| !e.is_expired(now))
            }
            CellState::Dead { .. } => false,
        }
    }

    pub fn is_covered_by(&self, tomb: Tombstone) -> bool {
        tomb.deletes(self.timestamp)
    }

    /// Turn an expired live cell into a dead one. Returns true if it changed.
    pub fn expire(&mut self, now: GcTime) -> bool {
        if let CellState::Live {
            expiry: Some(e), ..
        } = &self.state
        {
            if e.is_expired(now) {
                let deletion_time = e.deletion_time();
                self.state = CellState::Dead { deletion_time };
                return true;
            }
        }
        false
    }

    /// Expire, then drop if covered or purgeable. Returns `(keep, live)`.
    pub fn compact_and_expire(
        &mut self,
        tomb: Tombstone,
        now: GcTime,
        gc_before: GcTime,
        gc: &dyn GcPolicy,
    ) -> (bool, bool) {
        if self.is_covered_by(tomb) {
            return (false, false);
        }
        self.expire(now);
        match self.state {
            CellState::Live { .. } => (true, true),
            CellState::Dead { deletion_time } => {
                let own = Tombstone::new(self.timestamp, deletion_time);
                let purge = own.is_purgeable(gc_before) && gc.can_gc(own);
                (!purge, false)
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.value().map_or(0, |v| v.len())
    }
}

/// Total merge order of two versions of an atomic cell.
pub fn compare_atomic_cell_for_merge(left: &AtomicCell, right: &AtomicCell) -> Ordering {
    if left.timestamp != right.timestamp {
        return left.timestamp.cmp(&right.timestamp);
    }
    match (&left.state, &right.state) {
        (CellState::Live { .. }, CellState::Dead { .. }) => Ordering::Less,
        (CellState::Dead { .. }, CellState::Live { .. }) => Ordering::Greater,
        (
            CellState::Live {
                value: lv,
                expiry: le,
            },
            CellState::Live {
                value: rv,
                expiry: re,
            },
        ) => lv.as_ref().cmp(rv.as_ref()).then_with(|| match (le, re) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => l.expiry.cmp(&r.expiry),
        }),
        (CellState::Dead { deletion_time: l }, CellState::Dead { deletion_time: r }) => l.cmp(r),
    }
}

/// Per-element cells of a collection column plus the collection's tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionMutation {
    pub tomb: Tombstone,
    /// Element cells sorted by element key.
    pub cells: Vec<(Value, AtomicCell)>,
}

impl CollectionMutation {
    pub fn new(tomb: Tombstone) -> Self {
        Self {
            tomb,
            cells: Vec::new(),
        }
    }

    /// Add an element, keeping the cells sorted under `column_type`.
    pub fn with_cell(mut self, column_type: &ColumnType, key: Value, cell: AtomicCell) -> Self {
        match self
            .cells
            .binary_search_by(|(k, _)| column_type.compare_element_keys(k, &key))
        {
            Ok(i) => {
                if compare_atomic_cell_for_merge(&cell, &self.cells[i].1) == Ordering::Greater {
                    self.cells[i].1 = cell;
                }
            }
            Err(i) => self.cells.insert(i, (key, cell)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tomb.is_empty() && self.cells.is_empty()
    }

    pub fn is_any_live(&self, tomb: Tombstone, now: GcTime) -> bool {
        let mut effective = tomb;
        effective.apply(self.tomb);
        self.cells.iter().any(|(_, c)| c.is_live(effective, now))
    }

    /// Reconcile with `other` element by element. Elements shadowed by the
    /// merged collection tombstone are dropped.
    pub fn merge(&mut self, other: CollectionMutation, column_type: &ColumnType) {
        self.tomb.apply(other.tomb);
        let tomb = self.tomb;

        let left = std::mem::take(&mut self.cells);
        let mut merged = Vec::with_capacity(left.len() + other.cells.len());
        let mut l = left.into_iter().peekable();
        let mut r = other.cells.into_iter().peekable();
        loop {
            let order = match (l.peek(), r.peek()) {
                (Some((lk, _)), Some((rk, _))) => column_type.compare_element_keys(lk, rk),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            let next = match order {
                Ordering::Less => l.next(),
                Ordering::Greater => r.next(),
                Ordering::Equal => match (l.next(), r.next()) {
                    (Some((k, lc)), Some((_, rc))) => {
                        if compare_atomic_cell_for_merge(&rc, &lc) == Ordering::Greater {
                            Some((k, rc))
                        } else {
                            Some((k, lc))
                        }
                    }
                    (a, b) => a.or(b),
                },
            };
            let Some((k, c)) = next else {
                break;
            };
            if !tomb.deletes(c.timestamp) {
                merged.push((k, c));
            }
        }
        self.cells = merged;
    }

    /// Elements and tombstone of `self` not implied by `other`.
    pub fn difference(&self, other: &CollectionMutation, column_type: &ColumnType) -> CollectionMutation {
        let mut diff = CollectionMutation::new(if self.tomb > other.tomb {
            self.tomb
        } else {
            Tombstone::empty()
        });
        let mut j = 0;
        for (key, cell) in &self.cells {
            while j < other.cells.len()
                && column_type.compare_element_keys(&other.cells[j].0, key) == Ordering::Less
            {
                j += 1;
            }
            let newer = match other.cells.get(j) {
                Some((ok, oc)) if column_type.compare_element_keys(ok, key) == Ordering::Equal => {
                    compare_atomic_cell_for_merge(cell, oc) == Ordering::Greater
                }
                _ => true,
            };
            if newer {
                diff.cells.push((key.clone(), cell.clone()));
            }
        }
        diff
    }

    /// Drop shadowed, expired-and-purgeable elements. Returns whether any
    /// element is still live.
    pub fn compact_and_expire(
        &mut self,
        tomb: Tombstone,
        now: GcTime,
        gc_before: GcTime,
        gc: &dyn GcPolicy,
    ) -> bool {
        if self.tomb <= tomb {
            self.tomb = Tombstone::empty();
        }
        let mut effective = tomb;
        effective.apply(self.tomb);

        let mut any_live = false;
        self.cells.retain_mut(|(_, cell)| {
            let (keep, live) = cell.compact_and_expire(effective, now, gc_before, gc);
            any_live |= live;
            keep
        });

        if self.tomb.is_purgeable(gc_before) && gc.can_gc(self.tomb) {
            self.tomb = Tombstone::empty();
        }
        any_live
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .cells
                .iter()
                .map(|(k, c)| k.len() + c.memory_usage())
                .sum::<usize>()
    }
}

/// Value stored for one column of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Atomic(AtomicCell),
    Collection(CollectionMutation),
}

impl CellValue {
    fn kind_mismatch(def: &ColumnDefinition) -> PartitionError {
        PartitionError::InvariantViolation(format!(
            "cell kind does not match column {} ({:?})",
            def.name, def.column_type
        ))
    }

    /// Fails if an atomic cell targets a collection column or vice versa.
    pub fn check_kind(&self, def: &ColumnDefinition) -> Result<()> {
        match (self, def.is_atomic()) {
            (CellValue::Atomic(_), true) | (CellValue::Collection(_), false) => Ok(()),
            _ => Err(Self::kind_mismatch(def)),
        }
    }

    /// Reconcile `other` into `self`.
    pub fn merge(&mut self, other: CellValue, def: &ColumnDefinition) -> Result<()> {
        match (self, other) {
            (CellValue::Atomic(dst), CellValue::Atomic(src)) => {
                if compare_atomic_cell_for_merge(&src, dst) == Ordering::Greater {
                    *dst = src;
                }
                Ok(())
            }
            (CellValue::Collection(dst), CellValue::Collection(src)) => {
                dst.merge(src, &def.column_type);
                Ok(())
            }
            _ => Err(Self::kind_mismatch(def)),
        }
    }

    /// The part of `self` not implied by `other`, if any.
    pub fn difference(&self, other: &CellValue, def: &ColumnDefinition) -> Option<CellValue> {
        match (self, other) {
            (CellValue::Atomic(a), CellValue::Atomic(b)) => {
                if compare_atomic_cell_for_merge(a, b) == Ordering::Greater {
                    Some(self.clone())
                } else {
                    None
                }
            }
            (CellValue::Collection(a), CellValue::Collection(b)) => {
                let diff = a.difference(b, &def.column_type);
                if diff.is_empty() {
                    None
                } else {
                    Some(CellValue::Collection(diff))
                }
            }
            _ => Some(self.clone()),
        }
    }

    pub fn is_live(&self, tomb: Tombstone, now: GcTime) -> bool {
        match self {
            CellValue::Atomic(c) => c.is_live(tomb, now),
            CellValue::Collection(m) => m.is_any_live(tomb, now),
        }
    }

    /// Returns `(keep, live)`.
    pub fn compact_and_expire(
        &mut self,
        tomb: Tombstone,
        now: GcTime,
        gc_before: GcTime,
        gc: &dyn GcPolicy,
    ) -> (bool, bool) {
        match self {
            CellValue::Atomic(c) => c.compact_and_expire(tomb, now, gc_before, gc),
            CellValue::Collection(m) => {
                let live = m.compact_and_expire(tomb, now, gc_before, gc);
                (!m.is_empty(), live)
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        match self {
            CellValue::Atomic(c) => c.memory_usage(),
            CellValue::Collection(m) => m.memory_usage(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Live,
    Expiring(Expiry),
    Dead { deletion_time: GcTime },
}

/// Records that a row exists independently of its cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMarker {
    pub timestamp: Timestamp,
    pub state: MarkerState,
}

impl RowMarker {
    pub fn missing() -> Self {
        Self {
            timestamp: MISSING_TIMESTAMP,
            state: MarkerState::Live,
        }
    }

    pub fn live(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            state: MarkerState::Live,
        }
    }

    pub fn expiring(timestamp: Timestamp, expiry: GcTime, ttl: i64) -> Self {
        Self {
            timestamp,
            state: MarkerState::Expiring(Expiry { expiry, ttl }),
        }
    }

    pub fn dead(timestamp: Timestamp, deletion_time: GcTime) -> Self {
        Self {
            timestamp,
            state: MarkerState::Dead { deletion_time },
        }
    }

    pub fn is_missing(&self) -> bool {
        self.timestamp == MISSING_TIMESTAMP
    }

    pub fn is_live(&self, tomb: Tombstone, now: GcTime) -> bool {
        if self.is_missing() || tomb.deletes(self.timestamp) {
            return false;
        }
        match self.state {
            MarkerState::Live => true,
            MarkerState::Expiring(e) => !e.is_expired(now),
            MarkerState::Dead { .. } => false,
        }
    }

    fn is_live_state(&self) -> bool {
        !matches!(self.state, MarkerState::Dead { .. })
    }

    /// Merge order, same shape as for atomic cells.
    pub fn compare(&self, other: &RowMarker) -> Ordering {
        if self.timestamp != other.timestamp {
            return self.timestamp.cmp(&other.timestamp);
        }
        match (self.is_live_state(), other.is_live_state()) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match (self.state, other.state) {
            (MarkerState::Live, MarkerState::Expiring(_)) => Ordering::Less,
            (MarkerState::Expiring(_), MarkerState::Live) => Ordering::Greater,
            (MarkerState::Expiring(a), MarkerState::Expiring(b)) => a.expiry.cmp(&b.expiry),
            (MarkerState::Dead { deletion_time: a }, MarkerState::Dead { deletion_time: b }) => a.cmp(&b),
            _ => Ordering::Equal,
        }
    }

    /// Keep the greater of the two markers.
    pub fn apply(&mut self, other: RowMarker) {
        if other.compare(self) == Ordering::Greater {
            *self = other;
        }
    }

    /// Expire and purge. Returns whether the marker is still live.
    pub fn compact_and_expire(
        &mut self,
        tomb: Tombstone,
        now: GcTime,
        gc_before: GcTime,
        gc: &dyn GcPolicy,
    ) -> bool {
        if self.is_missing() {
            return false;
        }
        if tomb.deletes(self.timestamp) {
            *self = RowMarker::missing();
            return false;
        }
        if let MarkerState::Expiring(e) = self.state {
            if e.is_expired(now) {
                self.state = MarkerState::Dead {
                    deletion_time: e.deletion_time(),
                };
            }
        }
        if let MarkerState::Dead { deletion_time } = self.state {
            let own = Tombstone::new(self.timestamp, deletion_time);
            if own.is_purgeable(gc_before) && gc.can_gc(own) {
                *self = RowMarker::missing();
            }
            return false;
        }
        true
    }
}

impl Default for RowMarker {
    fn default() -> Self {
        Self::missing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compaction::AlwaysGc;
    use crate::schema::ColumnKind;
    use crate::types::{int32, text};

    #[test]
    fn test_higher_timestamp_wins() {
        let a = AtomicCell::live(1, int32(9));
        let b = AtomicCell::live(2, int32(1));
        assert_eq!(compare_atomic_cell_for_merge(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_dead_beats_live_on_tie() {
        let live = AtomicCell::live(5, int32(1));
        let dead = AtomicCell::dead(5, 0);
        assert_eq!(compare_atomic_cell_for_merge(&dead, &live), Ordering::Greater);
        assert_eq!(compare_atomic_cell_for_merge(&live, &dead), Ordering::Less);
    }

    #[test]
    fn test_live_tie_breaks() {
        let a = AtomicCell::live(5, int32(1));
        let b = AtomicCell::live(5, int32(2));
        assert_eq!(compare_atomic_cell_for_merge(&a, &b), Ordering::Less);

        let plain = AtomicCell::live(5, int32(1));
        let expiring = AtomicCell::live_expiring(5, int32(1), 100, 10);
        let later = AtomicCell::live_expiring(5, int32(1), 200, 10);
        assert_eq!(compare_atomic_cell_for_merge(&expiring, &plain), Ordering::Greater);
        assert_eq!(compare_atomic_cell_for_merge(&later, &expiring), Ordering::Greater);
        assert_eq!(compare_atomic_cell_for_merge(&later, &later.clone()), Ordering::Equal);
    }

    #[test]
    fn test_dead_tie_breaks_on_deletion_time() {
        let a = AtomicCell::dead(5, 10);
        let b = AtomicCell::dead(5, 20);
        assert_eq!(compare_atomic_cell_for_merge(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_expiry_converts_to_dead() {
        let mut c = AtomicCell::live_expiring(5, int32(1), 100, 30);
        assert!(c.is_live(Tombstone::empty(), 99));
        assert!(!c.is_live(Tombstone::empty(), 100));
        assert!(!c.expire(99));
        assert!(c.expire(100));
        assert_eq!(c, AtomicCell::dead(5, 70));
    }

    #[test]
    fn test_cell_compaction() {
        let gc = AlwaysGc;
        let mut covered = AtomicCell::live(5, int32(1));
        assert_eq!(
            covered.compact_and_expire(Tombstone::new(5, 0), 0, 0, &gc),
            (false, false)
        );

        let mut dead = AtomicCell::dead(5, 10);
        assert_eq!(dead.compact_and_expire(Tombstone::empty(), 0, 10, &gc), (true, false));
        assert_eq!(dead.compact_and_expire(Tombstone::empty(), 0, 11, &gc), (false, false));

        let never = |_: Tombstone| false;
        assert_eq!(dead.compact_and_expire(Tombstone::empty(), 0, 11, &never), (true, false));
    }

    fn set_type() -> ColumnType {
        ColumnType::Set(Box::new(ColumnType::Int32))
    }

    #[test]
    fn test_collection_merge() {
        let t = set_type();
        let mut a = CollectionMutation::new(Tombstone::empty())
            .with_cell(&t, int32(3), AtomicCell::live(1, text("")))
            .with_cell(&t, int32(-1), AtomicCell::live(1, text("")));
        let b = CollectionMutation::new(Tombstone::new(1, 0))
            .with_cell(&t, int32(2), AtomicCell::live(2, text("")))
            .with_cell(&t, int32(3), AtomicCell::live(3, text("")));

        a.merge(b, &t);
        let keys: Vec<_> = a.cells.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![int32(2), int32(3)]);
        assert_eq!(a.cells[1].1.timestamp, 3);
        assert_eq!(a.tomb, Tombstone::new(1, 0));
    }

    #[test]
    fn test_collection_difference() {
        let t = set_type();
        let a = CollectionMutation::new(Tombstone::new(2, 0))
            .with_cell(&t, int32(1), AtomicCell::live(5, text("")))
            .with_cell(&t, int32(2), AtomicCell::live(5, text("")));
        let b = CollectionMutation::new(Tombstone::new(3, 0))
            .with_cell(&t, int32(1), AtomicCell::live(5, text("")));

        let diff = a.difference(&b, &t);
        assert!(diff.tomb.is_empty());
        assert_eq!(diff.cells.len(), 1);
        assert_eq!(diff.cells[0].0, int32(2));
    }

    #[test]
    fn test_cell_value_kind_mismatch() {
        let def = ColumnDefinition {
            name: "v".into(),
            id: 0,
            kind: ColumnKind::Regular,
            column_type: ColumnType::Int32,
        };
        let mut v = CellValue::Atomic(AtomicCell::live(1, int32(1)));
        let err = v.merge(CellValue::Collection(CollectionMutation::default()), &def);
        assert!(matches!(err, Err(PartitionError::InvariantViolation(_))));
        assert!(v.check_kind(&def).is_ok());
    }

    #[test]
    fn test_marker_merge_and_expiry() {
        let mut m = RowMarker::live(5);
        m.apply(RowMarker::expiring(5, 100, 10));
        assert_eq!(m, RowMarker::expiring(5, 100, 10));
        m.apply(RowMarker::dead(5, 0));
        assert_eq!(m, RowMarker::dead(5, 0));
        m.apply(RowMarker::live(4));
        assert_eq!(m, RowMarker::dead(5, 0));

        let mut e = RowMarker::expiring(5, 100, 10);
        assert!(e.compact_and_expire(Tombstone::empty(), 50, 0, &AlwaysGc));
        assert!(!e.compact_and_expire(Tombstone::empty(), 100, 0, &AlwaysGc));
        assert_eq!(e, RowMarker::dead(5, 90));
        assert!(!e.compact_and_expire(Tombstone::empty(), 100, 91, &AlwaysGc));
        assert!(e.is_missing());
    }
}
