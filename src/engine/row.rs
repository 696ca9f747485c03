//! OBLIVION - Row Storage
//! Cell storage for the static row and clustered rows.
//!
//! ## Representation
//! A row starts dense: a vector indexed by column id. As soon as a column id
//! at or above `MAX_DENSE_COLUMNS` is written the row switches to a sorted
//! map and stays sparse for the rest of its life. Both forms iterate in
//! ascending column id order.

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::schema::ColumnDefinition;
use crate::tombstone::Tombstone;
use crate::types::{ColumnId, GcTime};

use super::arena::Arena;
use super::cell::{CellValue, RowMarker};
use super::compaction::GcPolicy;

/// Column ids below this stay in the dense vector.
pub const MAX_DENSE_COLUMNS: usize = 32;

#[derive(Debug, Clone)]
enum RowStorage {
    Dense(Vec<Option<CellValue>>),
    Sparse(BTreeMap<ColumnId, CellValue>),
}

/// Cells of one row, keyed by column id.
#[derive(Debug, Clone)]
pub struct Row {
    storage: RowStorage,
    cells: usize,
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for Row {}

impl Row {
    pub fn new() -> Self {
        Self {
            storage: RowStorage::Dense(Vec::new()),
            cells: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells == 0
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.storage, RowStorage::Dense(_))
    }

    /// Cells in ascending column id order.
    pub fn iter(&self) -> RowIter<'_> {
        match &self.storage {
            RowStorage::Dense(v) => RowIter::Dense(v.iter().enumerate()),
            RowStorage::Sparse(m) => RowIter::Sparse(m.iter()),
        }
    }

    pub fn find_cell(&self, id: ColumnId) -> Option<&CellValue> {
        match &self.storage {
            RowStorage::Dense(v) => v.get(id as usize).and_then(|c| c.as_ref()),
            RowStorage::Sparse(m) => m.get(&id),
        }
    }

    fn slot(&mut self, id: ColumnId) -> Option<&mut CellValue> {
        match &mut self.storage {
            RowStorage::Dense(v) => v.get_mut(id as usize).and_then(|c| c.as_mut()),
            RowStorage::Sparse(m) => m.get_mut(&id),
        }
    }

    /// One-way switch to the sparse form, preserving order.
    fn make_sparse(&mut self) {
        if let RowStorage::Dense(v) = &mut self.storage {
            let map = std::mem::take(v)
                .into_iter()
                .enumerate()
                .filter_map(|(i, c)| c.map(|c| (i as ColumnId, c)))
                .collect();
            self.storage = RowStorage::Sparse(map);
        }
    }

    /// Store `value` in an empty slot.
    fn insert_new(&mut self, id: ColumnId, value: CellValue) {
        if (id as usize) >= MAX_DENSE_COLUMNS {
            self.make_sparse();
        }
        match &mut self.storage {
            RowStorage::Dense(v) => {
                let idx = id as usize;
                if v.len() <= idx {
                    v.resize_with(idx + 1, || None);
                }
                v[idx] = Some(value);
            }
            RowStorage::Sparse(m) => {
                m.insert(id, value);
            }
        }
        self.cells += 1;
    }

    /// Remove and return the cell of column `id`.
    pub fn remove_cell(&mut self, id: ColumnId) -> Option<CellValue> {
        let removed = match &mut self.storage {
            RowStorage::Dense(v) => v.get_mut(id as usize).and_then(|c| c.take()),
            RowStorage::Sparse(m) => m.remove(&id),
        };
        if removed.is_some() {
            self.cells -= 1;
        }
        removed
    }

    /// Merge `value` into column `def`.
    pub fn apply(&mut self, def: &ColumnDefinition, value: CellValue) -> Result<()> {
        value.check_kind(def)?;
        match self.slot(def.id) {
            Some(existing) => existing.merge(value, def),
            None => {
                self.insert_new(def.id, value);
                Ok(())
            }
        }
    }

    /// Merge `value` into column `def` and return the cell it replaces,
    /// `None` if the column was empty.
    ///
    /// Every fallible step runs before the row is touched, so on error the
    /// row is unchanged.
    pub fn apply_cell_reversibly(
        &mut self,
        def: &ColumnDefinition,
        value: CellValue,
        arena: &mut Arena,
    ) -> Result<Option<CellValue>> {
        value.check_kind(def)?;
        match self.slot(def.id) {
            Some(existing) => {
                let prior = arena.alloc(existing.clone())?;
                let mut merged = prior.clone();
                merged.merge(value, def)?;
                *existing = merged;
                Ok(Some(prior))
            }
            None => {
                let value = arena.alloc(value)?;
                if let RowStorage::Dense(v) = &mut self.storage {
                    let idx = def.id as usize;
                    if idx < MAX_DENSE_COLUMNS && v.len() <= idx {
                        arena.reserve(v, idx + 1 - v.len())?;
                    }
                }
                self.insert_new(def.id, value);
                Ok(None)
            }
        }
    }

    /// Put back a cell returned by [`apply_cell_reversibly`](Self::apply_cell_reversibly).
    pub fn restore_cell(&mut self, id: ColumnId, prior: Option<CellValue>) {
        match prior {
            Some(prior) => match self.slot(id) {
                Some(existing) => *existing = prior,
                None => self.insert_new(id, prior),
            },
            None => {
                self.remove_cell(id);
            }
        }
    }

    /// Whether any cell is live under `tomb` at `now`.
    pub fn is_live(&self, tomb: Tombstone, now: GcTime) -> bool {
        self.iter().any(|(_, c)| c.is_live(tomb, now))
    }

    /// Expire cells, drop shadowed and purgeable ones. Returns whether any
    /// cell is still live.
    pub fn compact_and_expire(
        &mut self,
        tomb: Tombstone,
        now: GcTime,
        gc_before: GcTime,
        gc: &dyn GcPolicy,
    ) -> bool {
        let mut any_live = false;
        let mut removed = 0;
        match &mut self.storage {
            RowStorage::Dense(v) => {
                for slot in v.iter_mut() {
                    if let Some(cell) = slot {
                        let (keep, live) = cell.compact_and_expire(tomb, now, gc_before, gc);
                        any_live |= live;
                        if !keep {
                            *slot = None;
                            removed += 1;
                        }
                    }
                }
            }
            RowStorage::Sparse(m) => {
                m.retain(|_, cell| {
                    let (keep, live) = cell.compact_and_expire(tomb, now, gc_before, gc);
                    any_live |= live;
                    if !keep {
                        removed += 1;
                    }
                    keep
                });
            }
        }
        self.cells -= removed;
        any_live
    }

    /// Cells of `self` not implied by `other`.
    pub fn difference<'a, F>(&self, other: &Row, mut column: F) -> Result<Row>
    where
        F: FnMut(ColumnId) -> Result<&'a ColumnDefinition>,
    {
        let mut diff = Row::new();
        for (id, cell) in self.iter() {
            let def = column(id)?;
            let part = match other.find_cell(id) {
                Some(theirs) => cell.difference(theirs, def),
                None => Some(cell.clone()),
            };
            if let Some(part) = part {
                diff.insert_new(id, part);
            }
        }
        Ok(diff)
    }

    pub fn memory_usage(&self) -> usize {
        let container = match &self.storage {
            RowStorage::Dense(v) => v.capacity() * std::mem::size_of::<Option<CellValue>>(),
            RowStorage::Sparse(m) => {
                m.len() * (std::mem::size_of::<ColumnId>() + std::mem::size_of::<CellValue>())
            }
        };
        std::mem::size_of::<Self>()
            + container
            + self.iter().map(|(_, c)| c.memory_usage()).sum::<usize>()
    }
}

/// Iterator over `(column id, cell)` pairs of a [`Row`].
pub enum RowIter<'a> {
    Dense(std::iter::Enumerate<std::slice::Iter<'a, Option<CellValue>>>),
    Sparse(btree_map::Iter<'a, ColumnId, CellValue>),
}

impl<'a> Iterator for RowIter<'a> {
    type Item = (ColumnId, &'a CellValue);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RowIter::Dense(it) => it.find_map(|(i, c)| c.as_ref().map(|c| (i as ColumnId, c))),
            RowIter::Sparse(it) => it.next().map(|(id, c)| (*id, c)),
        }
    }
}

/// A clustered row: cells plus the row marker and row tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletableRow {
    pub deleted_at: Tombstone,
    pub marker: RowMarker,
    pub cells: Row,
}

impl DeletableRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// No tombstone, no marker and no cells.
    pub fn is_empty(&self) -> bool {
        self.deleted_at.is_empty() && self.marker.is_missing() && self.cells.is_empty()
    }

    pub fn apply_tombstone(&mut self, tomb: Tombstone) {
        self.deleted_at.apply(tomb);
    }

    pub fn apply_marker(&mut self, marker: RowMarker) {
        self.marker.apply(marker);
    }

    /// Live marker or any live cell, under `tomb` and the row's own deletion.
    pub fn is_live(&self, tomb: Tombstone, now: GcTime) -> bool {
        let mut effective = tomb;
        effective.apply(self.deleted_at);
        self.marker.is_live(effective, now) || self.cells.is_live(effective, now)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Tombstone>() + std::mem::size_of::<RowMarker>() + self.cells.memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cell::AtomicCell;
    use crate::engine::compaction::AlwaysGc;
    use crate::error::PartitionError;
    use crate::schema::{ColumnKind, ColumnType};
    use crate::types::int32;

    fn col(id: ColumnId) -> ColumnDefinition {
        ColumnDefinition {
            name: format!("c{}", id),
            id,
            kind: ColumnKind::Regular,
            column_type: ColumnType::Int32,
        }
    }

    fn cell(ts: i64, v: i32) -> CellValue {
        CellValue::Atomic(AtomicCell::live(ts, int32(v)))
    }

    #[test]
    fn test_dense_to_sparse_keeps_order() {
        let mut row = Row::new();
        row.apply(&col(5), cell(1, 5)).unwrap();
        row.apply(&col(1), cell(1, 1)).unwrap();
        assert!(row.is_dense());

        row.apply(&col(40), cell(1, 40)).unwrap();
        assert!(!row.is_dense());
        row.apply(&col(3), cell(1, 3)).unwrap();

        let ids: Vec<_> = row.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3, 5, 40]);
        assert_eq!(row.len(), 4);
    }

    #[test]
    fn test_sparse_equals_dense_with_same_cells() {
        let mut dense = Row::new();
        dense.apply(&col(2), cell(1, 2)).unwrap();

        let mut sparse = Row::new();
        sparse.apply(&col(40), cell(1, 40)).unwrap();
        sparse.apply(&col(2), cell(1, 2)).unwrap();
        sparse.remove_cell(40);

        assert!(!sparse.is_dense());
        assert_eq!(dense, sparse);
    }

    #[test]
    fn test_reversible_apply_and_restore() {
        let mut row = Row::new();
        row.apply(&col(0), cell(1, 0)).unwrap();
        let before = row.clone();

        let mut arena = Arena::unbounded();
        let prior = row.apply_cell_reversibly(&col(0), cell(2, 9), &mut arena).unwrap();
        let absent = row.apply_cell_reversibly(&col(7), cell(2, 7), &mut arena).unwrap();
        assert_eq!(row.find_cell(0), Some(&cell(2, 9)));
        assert!(absent.is_none());

        row.restore_cell(7, absent);
        row.restore_cell(0, prior);
        assert_eq!(row, before);
    }

    #[test]
    fn test_failed_reversible_apply_leaves_row() {
        let mut row = Row::new();
        row.apply(&col(0), cell(1, 0)).unwrap();
        let before = row.clone();

        let mut arena = Arena::with_limit(0);
        assert!(row.apply_cell_reversibly(&col(0), cell(2, 9), &mut arena).is_err());
        assert!(row.apply_cell_reversibly(&col(50), cell(2, 9), &mut arena).is_err());
        assert_eq!(row, before);
        assert!(row.is_dense());
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut row = Row::new();
        let set = ColumnDefinition {
            column_type: ColumnType::Set(Box::new(ColumnType::Int32)),
            ..col(1)
        };
        assert!(matches!(
            row.apply(&set, cell(1, 1)),
            Err(PartitionError::InvariantViolation(_))
        ));
        assert!(row.is_empty());
    }

    #[test]
    fn test_compaction_drops_covered_cells() {
        let mut row = Row::new();
        row.apply(&col(0), cell(1, 0)).unwrap();
        row.apply(&col(1), cell(5, 1)).unwrap();
        let live = row.compact_and_expire(Tombstone::new(3, 0), 0, 0, &AlwaysGc);
        assert!(live);
        assert_eq!(row.len(), 1);
        assert!(row.find_cell(0).is_none());
    }

    #[test]
    fn test_difference() {
        let mut a = Row::new();
        a.apply(&col(0), cell(2, 0)).unwrap();
        a.apply(&col(1), cell(1, 1)).unwrap();
        let mut b = Row::new();
        b.apply(&col(0), cell(1, 0)).unwrap();
        b.apply(&col(1), cell(1, 1)).unwrap();

        let defs = [col(0), col(1)];
        let diff = a
            .difference(&b, |id| Ok(&defs[id as usize]))
            .unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.find_cell(0), Some(&cell(2, 0)));
    }

    #[test]
    fn test_deletable_row_liveness() {
        let mut row = DeletableRow::new();
        assert!(row.is_empty());
        row.apply_marker(RowMarker::live(5));
        assert!(row.is_live(Tombstone::empty(), 0));
        row.apply_tombstone(Tombstone::new(5, 0));
        assert!(!row.is_live(Tombstone::empty(), 0));
        row.cells.apply(&col(0), cell(6, 1)).unwrap();
        assert!(row.is_live(Tombstone::empty(), 0));
    }
}
