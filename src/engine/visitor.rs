//! OBLIVION - Partition Visitors
//! Walking a partition in clustering order and rebuilding one from a walk.
//!
//! `MutationPartition::accept` drives a `MutationPartitionVisitor`:
//! partition tombstone, static cells, range tombstones, then every row
//! followed by its cells. `PartitionBuilder` turns such a walk back into a
//! partition and `UpgradingBuilder` does the same while moving cells to the
//! column ids of another schema.

use log::debug;

use crate::error::{PartitionError, Result};
use crate::keys::ClusteringKey;
use crate::schema::{ColumnKind, ColumnMapping, Schema};
use crate::tombstone::Tombstone;
use crate::types::ColumnId;

use super::cell::{AtomicCell, CellValue, CollectionMutation, RowMarker};
use super::partition::MutationPartition;
use super::range_tombstone::RangeTombstone;
use super::row::DeletableRow;

/// Callbacks for a walk over a partition.
pub trait MutationPartitionVisitor {
    fn accept_partition_tombstone(&mut self, tomb: Tombstone);
    fn accept_static_cell(&mut self, id: ColumnId, cell: &AtomicCell);
    fn accept_static_collection(&mut self, id: ColumnId, collection: &CollectionMutation);
    fn accept_row_tombstone(&mut self, rt: &RangeTombstone);
    /// Opens a row; the cells that follow belong to it.
    fn accept_row(&mut self, key: &ClusteringKey, deleted_at: Tombstone, marker: RowMarker);
    fn accept_row_cell(&mut self, id: ColumnId, cell: &AtomicCell);
    fn accept_row_collection(&mut self, id: ColumnId, collection: &CollectionMutation);
}

/// Rebuilds a partition from a walk. The first error is kept and returned
/// by [`finish`](Self::finish); later callbacks are still applied.
pub struct PartitionBuilder<'a> {
    schema: &'a Schema,
    partition: MutationPartition,
    error: Option<PartitionError>,
}

impl<'a> PartitionBuilder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            partition: MutationPartition::new(),
            error: None,
        }
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    fn static_cell(&mut self, id: ColumnId, value: CellValue) {
        let result = self.partition.set_static_cell(self.schema, id, value);
        self.record(result);
    }

    fn row_cell(&mut self, id: ColumnId, value: CellValue) {
        let result = match self.schema.regular_column_at(id) {
            Ok(def) => match self.partition.last_row_mut() {
                Some(row) => row.cells.apply(def, value),
                None => Err(PartitionError::InvariantViolation(format!(
                    "cell for column {} outside of a row",
                    def.name
                ))),
            },
            Err(e) => Err(e),
        };
        self.record(result);
    }

    pub fn finish(self) -> Result<MutationPartition> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.partition),
        }
    }
}

impl MutationPartitionVisitor for PartitionBuilder<'_> {
    fn accept_partition_tombstone(&mut self, tomb: Tombstone) {
        self.partition.apply_tombstone(tomb);
    }

    fn accept_static_cell(&mut self, id: ColumnId, cell: &AtomicCell) {
        self.static_cell(id, CellValue::Atomic(cell.clone()));
    }

    fn accept_static_collection(&mut self, id: ColumnId, collection: &CollectionMutation) {
        self.static_cell(id, CellValue::Collection(collection.clone()));
    }

    fn accept_row_tombstone(&mut self, rt: &RangeTombstone) {
        self.partition.apply_range_tombstone(self.schema, rt.clone());
    }

    fn accept_row(&mut self, key: &ClusteringKey, deleted_at: Tombstone, marker: RowMarker) {
        let row = DeletableRow {
            deleted_at,
            marker,
            ..DeletableRow::new()
        };
        let result = self.partition.append_row(self.schema, key.clone(), row);
        self.record(result);
    }

    fn accept_row_cell(&mut self, id: ColumnId, cell: &AtomicCell) {
        self.row_cell(id, CellValue::Atomic(cell.clone()));
    }

    fn accept_row_collection(&mut self, id: ColumnId, collection: &CollectionMutation) {
        self.row_cell(id, CellValue::Collection(collection.clone()));
    }
}

/// Rebuilds a partition under a newer schema. Cells of columns the target
/// schema dropped are skipped.
pub struct UpgradingBuilder<'a> {
    inner: PartitionBuilder<'a>,
    mapping: &'a ColumnMapping,
    dropped: usize,
}

impl<'a> UpgradingBuilder<'a> {
    pub fn new(target: &'a Schema, mapping: &'a ColumnMapping) -> Self {
        Self {
            inner: PartitionBuilder::new(target),
            mapping,
            dropped: 0,
        }
    }

    fn map(&mut self, kind: ColumnKind, id: ColumnId) -> Option<ColumnId> {
        let mapped = self.mapping.map(kind, id);
        if mapped.is_none() {
            self.dropped += 1;
        }
        mapped
    }

    pub fn finish(self) -> Result<MutationPartition> {
        if self.dropped > 0 {
            debug!("Upgrade dropped {} cells of removed columns", self.dropped);
        }
        self.inner.finish()
    }
}

impl MutationPartitionVisitor for UpgradingBuilder<'_> {
    fn accept_partition_tombstone(&mut self, tomb: Tombstone) {
        self.inner.accept_partition_tombstone(tomb);
    }

    fn accept_static_cell(&mut self, id: ColumnId, cell: &AtomicCell) {
        if let Some(id) = self.map(ColumnKind::Static, id) {
            self.inner.accept_static_cell(id, cell);
        }
    }

    fn accept_static_collection(&mut self, id: ColumnId, collection: &CollectionMutation) {
        if let Some(id) = self.map(ColumnKind::Static, id) {
            self.inner.accept_static_collection(id, collection);
        }
    }

    fn accept_row_tombstone(&mut self, rt: &RangeTombstone) {
        self.inner.accept_row_tombstone(rt);
    }

    fn accept_row(&mut self, key: &ClusteringKey, deleted_at: Tombstone, marker: RowMarker) {
        self.inner.accept_row(key, deleted_at, marker);
    }

    fn accept_row_cell(&mut self, id: ColumnId, cell: &AtomicCell) {
        if let Some(id) = self.map(ColumnKind::Regular, id) {
            self.inner.accept_row_cell(id, cell);
        }
    }

    fn accept_row_collection(&mut self, id: ColumnId, collection: &CollectionMutation) {
        if let Some(id) = self.map(ColumnKind::Regular, id) {
            self.inner.accept_row_collection(id, collection);
        }
    }
}
