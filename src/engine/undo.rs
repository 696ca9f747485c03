//! OBLIVION - Merge Undo Log
//! Records what a partition merge changed so a failed merge can be rolled
//! back to the exact pre-merge state.
//!
//! ## Protocol
//! - Capacity for the next record is reserved *before* the change it
//!   describes, so recording never fails after the partition was touched.
//! - Row positions are the positions at the time of the change. Reverting
//!   replays records newest first, which restores each intermediate state in
//!   turn and keeps those positions valid.

use crate::error::Result;
use crate::tombstone::Tombstone;
use crate::types::ColumnId;

use super::arena::Arena;
use super::cell::{CellValue, RowMarker};
use super::partition::RowEntry;
use super::row::Row;

/// One reversible change.
#[derive(Debug)]
pub enum Undo {
    /// A static cell was written; `prior` is what the column held before.
    StaticCell {
        column: ColumnId,
        prior: Option<CellValue>,
    },
    /// A regular cell of the row at `row` was written.
    Cell {
        row: usize,
        column: ColumnId,
        prior: Option<CellValue>,
    },
    RowTombstone {
        row: usize,
        prior: Tombstone,
    },
    Marker {
        row: usize,
        prior: RowMarker,
    },
    /// A new, empty row was inserted at `row`.
    RowInserted {
        row: usize,
    },
}

/// Undo records of one merge, oldest first.
#[derive(Debug, Default)]
pub struct MergeLog {
    entries: Vec<Undo>,
}

impl MergeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make room for one more record.
    pub fn reserve(&mut self, arena: &mut Arena) -> Result<()> {
        arena.reserve(&mut self.entries, 1)
    }

    /// Append a record. Call [`reserve`](Self::reserve) first.
    pub fn push(&mut self, undo: Undo) {
        self.entries.push(undo);
    }

    /// Forget the records; the merge is final.
    pub fn commit(self) -> usize {
        self.entries.len()
    }

    /// Undo every recorded change, newest first. Returns the number of
    /// records replayed.
    pub fn revert(self, static_row: &mut Row, rows: &mut Vec<RowEntry>) -> usize {
        let count = self.entries.len();
        for undo in self.entries.into_iter().rev() {
            match undo {
                Undo::StaticCell { column, prior } => static_row.restore_cell(column, prior),
                Undo::Cell { row, column, prior } => {
                    if let Some(entry) = rows.get_mut(row) {
                        entry.row.cells.restore_cell(column, prior);
                    }
                }
                Undo::RowTombstone { row, prior } => {
                    if let Some(entry) = rows.get_mut(row) {
                        entry.row.deleted_at = prior;
                    }
                }
                Undo::Marker { row, prior } => {
                    if let Some(entry) = rows.get_mut(row) {
                        entry.row.marker = prior;
                    }
                }
                Undo::RowInserted { row } => {
                    if row < rows.len() {
                        rows.remove(row);
                    }
                }
            }
        }
        count
    }
}
