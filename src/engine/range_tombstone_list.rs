//! OBLIVION - Range Tombstone List
//! Ordered, non-overlapping set of range tombstones for one partition.
//!
//! ## Invariant
//! For adjacent entries `i` and `i + 1`:
//! - `start_i <= end_i <= start_{i+1}`
//! - entries may share a boundary point, but two zero-width entries at the
//!   same point never sit next to each other.
//!
//! Boundaries are compared with prefix equality, so neighbouring entries
//! may touch. Where they do, `search_tombstone_covering` picks the greater
//! of the two tombstones.
//!
//! After an overlapping insertion the list is put in canonical form: touching
//! neighbours with equal tombstones are joined, and a point entry dominated
//! by the neighbour it touches is dropped. Two lists with the same coverage
//! are then equal, whatever order their ranges were added in.

use std::alloc::Layout;
use std::cmp::Ordering;

use crate::error::Result;
use crate::keys::{
    compare_bound_key, compare_bounds, prefix_equality_compare, Bound, BoundKind, ClusteringKeyPrefix,
};
use crate::schema::Schema;
use crate::tombstone::Tombstone;

use super::arena::Arena;
use super::range_tombstone::RangeTombstone;

fn less(schema: &Schema, a: &Bound, b: &Bound) -> bool {
    prefix_equality_compare(schema, &a.prefix, &b.prefix) == Ordering::Less
}

fn same_point(a: &Bound, b: &Bound) -> bool {
    a.prefix == b.prefix
}

/// `a` ends where `b` starts and at least one of them includes that point.
fn touches(a: &RangeTombstone, b: &RangeTombstone) -> bool {
    same_point(&a.end, &b.start) && (a.end.kind == BoundKind::InclEnd || b.start.kind == BoundKind::InclStart)
}

/// Sorted range tombstones of a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeTombstoneList {
    tombstones: Vec<RangeTombstone>,
}

impl RangeTombstoneList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RangeTombstone> {
        self.tombstones.iter()
    }

    pub fn clear(&mut self) {
        self.tombstones.clear();
    }

    /// Insert `rt`, resolving overlaps by tombstone precedence.
    ///
    /// Uses an unbounded arena, so the only failure left is the vector
    /// growth itself; that aborts through the global allocation error
    /// handler. Use [`try_add`](Self::try_add) to get an error instead.
    pub fn add(&mut self, schema: &Schema, rt: RangeTombstone) {
        let mut arena = Arena::unbounded();
        if self.try_add(schema, rt, &mut arena).is_err() {
            std::alloc::handle_alloc_error(Layout::new::<RangeTombstone>());
        }
    }

    /// Insert `rt`, charging every constructed entry to `arena`.
    ///
    /// On error the list may hold part of the insertion. Callers that need
    /// all-or-nothing behaviour insert into a copy and swap it in.
    pub fn try_add(&mut self, schema: &Schema, rt: RangeTombstone, arena: &mut Arena) -> Result<()> {
        if rt.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.tombstones.last() {
            if !less(schema, &last.end, &rt.start) {
                let i = self
                    .tombstones
                    .partition_point(|e| less(schema, &e.end, &rt.start));
                self.insert_from(schema, i, rt.start, rt.end, rt.tomb, arena)?;
                self.normalize();
                return Ok(());
            }
        }
        self.insert_at(self.tombstones.len(), rt, arena)
    }

    fn insert_at(&mut self, index: usize, rt: RangeTombstone, arena: &mut Arena) -> Result<()> {
        arena.reserve(&mut self.tombstones, 1)?;
        let rt = arena.alloc(rt)?;
        self.tombstones.insert(index, rt);
        Ok(())
    }

    /// Merge `[start, stop] @ tomb` into the list from position `i` on.
    /// Requires `end_{i-1} <= start <= end_i`.
    fn insert_from(
        &mut self,
        schema: &Schema,
        mut i: usize,
        mut start: Bound,
        stop: Bound,
        tomb: Tombstone,
        arena: &mut Arena,
    ) -> Result<()> {
        while i < self.tombstones.len() {
            let it = &self.tombstones[i];

            if same_point(&start, &it.end) {
                // The new range really starts at the next entry, unless the
                // current one is a single point: stepping over it could leave
                // two zero-width entries for the same point.
                if it.is_singular() {
                    if tomb > it.tomb {
                        self.tombstones.remove(i);
                        continue;
                    }
                    if same_point(&start, &stop) {
                        return Ok(());
                    }
                }
                i += 1;
                continue;
            }

            if tomb > it.tomb {
                if less(schema, &it.start, &start) {
                    let left = RangeTombstone::new(
                        it.start.clone(),
                        Bound::incl_end(start.prefix.clone()),
                        it.tomb,
                    );
                    self.insert_at(i, left, arena)?;
                    i += 1;
                }

                // Here start <= it.start.
                let it = &self.tombstones[i];

                if less(schema, &stop, &it.start) {
                    return self.insert_at(i, RangeTombstone::new(start, stop, tomb), arena);
                }

                if same_point(&stop, &it.start) && it.is_singular() {
                    self.tombstones[i] = RangeTombstone::new(start, stop, tomb);
                    return Ok(());
                }

                if less(schema, &stop, &it.end) {
                    let rest_start = if same_point(&stop, &it.start) {
                        it.start.clone()
                    } else {
                        Bound::incl_start(stop.prefix.clone())
                    };
                    self.insert_at(i, RangeTombstone::new(start, stop, tomb), arena)?;
                    self.tombstones[i + 1].start = rest_start;
                    return Ok(());
                }

                // Here start <= it.start and stop >= it.end.
                let next_starts_later = self
                    .tombstones
                    .get(i + 1)
                    .map_or(true, |next| !less(schema, &next.start, &stop));
                if next_starts_later {
                    self.tombstones[i] = RangeTombstone::new(start, stop, tomb);
                    return Ok(());
                }

                let it_end = self.tombstones[i].end.clone();
                if same_point(&stop, &it_end) {
                    self.tombstones[i] = RangeTombstone::new(start, stop, tomb);
                    return Ok(());
                }
                self.tombstones[i] =
                    RangeTombstone::new(start, Bound::incl_end(it_end.prefix.clone()), tomb);
                start = Bound::incl_start(it_end.prefix);
                i += 1;
            } else {
                if less(schema, &start, &it.start) {
                    if less(schema, &it.start, &stop) {
                        let piece = RangeTombstone::new(
                            start,
                            Bound::incl_end(it.start.prefix.clone()),
                            tomb,
                        );
                        self.insert_at(i, piece, arena)?;
                        i += 1;
                    } else {
                        return self.insert_at(i, RangeTombstone::new(start, stop, tomb), arena);
                    }
                }

                let it = &self.tombstones[i];
                if less(schema, &it.end, &stop) {
                    start = Bound::incl_start(it.end.prefix.clone());
                    i += 1;
                } else {
                    return Ok(());
                }
            }
        }

        self.insert_at(self.tombstones.len(), RangeTombstone::new(start, stop, tomb), arena)
    }

    /// The tombstone covering `key`, or the empty tombstone.
    pub fn search_tombstone_covering(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> Tombstone {
        let i = self
            .tombstones
            .partition_point(|e| compare_bound_key(schema, &e.end, key) == Ordering::Less);
        let Some(it) = self.tombstones.get(i) else {
            return Tombstone::empty();
        };
        if compare_bound_key(schema, &it.start, key) == Ordering::Greater {
            return Tombstone::empty();
        }

        // Adjacent entries may share the boundary point the key sits on.
        if let Some(next) = self.tombstones.get(i + 1) {
            if compare_bound_key(schema, &next.start, key) != Ordering::Greater && next.tomb > it.tomb {
                return next.tomb;
            }
        }

        it.tomb
    }

    /// Entries overlapping `[start, end]`, in order.
    pub fn slice<'a>(
        &'a self,
        schema: &'a Schema,
        start: &'a Bound,
        end: &'a Bound,
    ) -> impl Iterator<Item = &'a RangeTombstone> + 'a {
        self.tombstones.iter().filter(move |rt| {
            compare_bounds(schema, &rt.end, start) != Ordering::Less
                && compare_bounds(schema, &rt.start, end) != Ordering::Greater
        })
    }

    /// Remove every entry matching `filter`.
    pub fn erase_where<F>(&mut self, mut filter: F)
    where
        F: FnMut(&RangeTombstone) -> bool,
    {
        self.tombstones.retain(|rt| !filter(rt));
        self.normalize();
    }

    /// Join touching entries with equal tombstones and drop point entries
    /// the touching neighbour already covers. Only removes entries.
    fn normalize(&mut self) {
        let mut i = 0;
        while i + 1 < self.tombstones.len() {
            let (a, b) = (&self.tombstones[i], &self.tombstones[i + 1]);
            if touches(a, b) {
                if a.tomb == b.tomb {
                    let end = b.end.clone();
                    self.tombstones[i].end = end;
                    self.tombstones.remove(i + 1);
                    i = i.saturating_sub(1);
                    continue;
                }
                if b.is_singular() && a.end.kind == BoundKind::InclEnd && a.tomb > b.tomb {
                    self.tombstones.remove(i + 1);
                    i = i.saturating_sub(1);
                    continue;
                }
                if a.is_singular() && b.start.kind == BoundKind::InclStart && b.tomb > a.tomb {
                    self.tombstones.remove(i);
                    i = i.saturating_sub(1);
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Portions of this list not already implied by `other`.
    ///
    /// A piece is kept where `other` has no tombstone or a smaller one.
    pub fn difference(&self, schema: &Schema, other: &RangeTombstoneList) -> RangeTombstoneList {
        let mut diff = RangeTombstoneList::new();
        let mut j = 0;

        for rt in &self.tombstones {
            let mut cur = rt.start.clone();
            loop {
                while j < other.tombstones.len()
                    && compare_bounds(schema, &other.tombstones[j].end, &cur) == Ordering::Less
                {
                    j += 1;
                }
                let Some(o) = other.tombstones.get(j) else {
                    diff.add(schema, RangeTombstone::new(cur, rt.end.clone(), rt.tomb));
                    break;
                };
                if compare_bounds(schema, &rt.end, &o.start) == Ordering::Less {
                    diff.add(schema, RangeTombstone::new(cur, rt.end.clone(), rt.tomb));
                    break;
                }

                if compare_bounds(schema, &cur, &o.start) == Ordering::Less {
                    diff.add(schema, RangeTombstone::new(cur.clone(), o.start.inverted(), rt.tomb));
                    cur = o.start.clone();
                }

                let end_within = compare_bounds(schema, &rt.end, &o.end) != Ordering::Greater;
                if rt.tomb > o.tomb {
                    let overlap_end = if end_within { rt.end.clone() } else { o.end.clone() };
                    diff.add(schema, RangeTombstone::new(cur.clone(), overlap_end, rt.tomb));
                }
                if end_within {
                    break;
                }
                cur = o.end.inverted();
                j += 1;
            }
        }

        diff
    }

    pub fn memory_usage(&self) -> usize {
        self.tombstones.capacity() * std::mem::size_of::<RangeTombstone>()
            + self
                .tombstones
                .iter()
                .map(|rt| rt.memory_usage() - std::mem::size_of::<RangeTombstone>())
                .sum::<usize>()
    }
}

impl<'a> IntoIterator for &'a RangeTombstoneList {
    type Item = &'a RangeTombstone;
    type IntoIter = std::slice::Iter<'a, RangeTombstone>;

    fn into_iter(self) -> Self::IntoIter {
        self.tombstones.iter()
    }
}
