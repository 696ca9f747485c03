//! OBLIVION - Query Results
//! Turns partitions into a read result under row and partition limits.
//!
//! Each partition is copied, compacted for the read with the remaining row
//! budget and then flattened into `ResultRow`s carrying only the selected
//! columns. A partition that yields no rows is left out of the result unless
//! it has live static data and the slice selects every clustering row.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{PartitionError, Result};
use crate::keys::{has_ck_selector, ClusteringKey, ClusteringRange};
use crate::schema::{ColumnKind, Schema};
use crate::tombstone::Tombstone;
use crate::types::{ColumnId, GcTime, Key, Timestamp, Value};

use super::cell::{AtomicCell, CellValue};
use super::partition::{MutationPartition, RowEntry};
use super::row::Row;

/// What to send back for every cell and row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceOptions {
    pub send_clustering_key: bool,
    pub send_timestamp: bool,
    pub send_expiry: bool,
    pub send_ttl: bool,
    pub reversed: bool,
}

/// Columns and clustering ranges selected by a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSlice {
    pub ranges: Vec<ClusteringRange>,
    pub static_columns: Vec<ColumnId>,
    pub regular_columns: Vec<ColumnId>,
    pub options: SliceOptions,
}

impl PartitionSlice {
    /// Every row and every column of `schema`, clustering keys included.
    pub fn full(schema: &Schema) -> Self {
        Self {
            ranges: vec![ClusteringRange::full()],
            static_columns: schema.columns(ColumnKind::Static).iter().map(|c| c.id).collect(),
            regular_columns: schema.columns(ColumnKind::Regular).iter().map(|c| c.id).collect(),
            options: SliceOptions {
                send_clustering_key: true,
                ..SliceOptions::default()
            },
        }
    }

    pub fn with_ranges(mut self, ranges: Vec<ClusteringRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_static_columns(mut self, columns: Vec<ColumnId>) -> Self {
        self.static_columns = columns;
        self
    }

    pub fn with_regular_columns(mut self, columns: Vec<ColumnId>) -> Self {
        self.regular_columns = columns;
        self
    }

    pub fn with_options(mut self, options: SliceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn reversed(mut self) -> Self {
        self.options.reversed = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultValue {
    Atomic(Value),
    /// Live elements as (element key, value) pairs.
    Collection(Vec<(Value, Value)>),
}

/// One selected cell. Metadata is present only when the slice asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCell {
    pub value: ResultValue,
    pub timestamp: Option<Timestamp>,
    pub expiry: Option<GcTime>,
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: Option<ClusteringKey>,
    /// One entry per selected regular column, `None` for no live data.
    pub cells: Vec<Option<ResultCell>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPartition {
    pub key: Key,
    /// One entry per selected static column.
    pub static_cells: Vec<Option<ResultCell>>,
    pub rows: Vec<ResultRow>,
}

/// A complete read result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub partitions: Vec<ResultPartition>,
    /// Rows counted against the limit; a static-only partition counts one.
    pub row_count: u32,
}

impl QueryResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PartitionError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PartitionError::Serialization(e.to_string()))
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

/// Accumulates partitions into a [`QueryResult`].
pub struct QueryResultBuilder<'a> {
    schema: &'a Schema,
    slice: &'a PartitionSlice,
    now: GcTime,
    row_limit: u32,
    partition_limit: u32,
    result: QueryResult,
}

impl<'a> QueryResultBuilder<'a> {
    pub fn new(
        schema: &'a Schema,
        slice: &'a PartitionSlice,
        now: GcTime,
        row_limit: u32,
        partition_limit: u32,
    ) -> Self {
        Self {
            schema,
            slice,
            now,
            row_limit,
            partition_limit,
            result: QueryResult::default(),
        }
    }

    /// No more rows or partitions may be added.
    pub fn is_full(&self) -> bool {
        self.result.row_count >= self.row_limit
            || self.result.partitions.len() as u32 >= self.partition_limit
    }

    /// Add one partition. Returns the number of rows it contributed.
    pub fn add_partition(&mut self, key: &Key, partition: &MutationPartition) -> u32 {
        if self.is_full() {
            return 0;
        }
        let mut compacted = partition.clone();
        let remaining = self.row_limit - self.result.row_count;
        let row_count = compacted.compact_for_query(
            self.schema,
            self.now,
            &self.slice.ranges,
            self.slice.options.reversed,
            remaining,
        );

        let retract = row_count == 0
            && (has_ck_selector(&self.slice.ranges) || !compacted.is_static_row_live(self.now));
        if retract {
            debug!("Partition {:02x?} has no rows for the read", key);
            return 0;
        }

        let mut rows = Vec::new();
        let entries: Box<dyn Iterator<Item = &RowEntry>> = if self.slice.options.reversed {
            Box::new(compacted.rows().iter().rev())
        } else {
            Box::new(compacted.rows().iter())
        };
        for entry in entries {
            let mut tomb = compacted.range_tombstone_for_row(self.schema, &entry.key);
            if !entry.row.is_live(tomb, self.now) {
                continue;
            }
            tomb.apply(entry.row.deleted_at);
            rows.push(ResultRow {
                key: self
                    .slice
                    .options
                    .send_clustering_key
                    .then(|| entry.key.clone()),
                cells: self.select(&entry.row.cells, &self.slice.regular_columns, tomb),
            });
        }

        let static_cells = self.select(
            compacted.static_row(),
            &self.slice.static_columns,
            compacted.partition_tombstone(),
        );
        let contributed = row_count.max(1);
        self.result.row_count += contributed;
        self.result.partitions.push(ResultPartition {
            key: key.clone(),
            static_cells,
            rows,
        });
        contributed
    }

    fn select(&self, row: &Row, columns: &[ColumnId], tomb: Tombstone) -> Vec<Option<ResultCell>> {
        columns
            .iter()
            .map(|&id| row.find_cell(id).and_then(|c| self.result_cell(c, tomb)))
            .collect()
    }

    fn result_cell(&self, cell: &CellValue, tomb: Tombstone) -> Option<ResultCell> {
        match cell {
            CellValue::Atomic(c) => {
                if !c.is_live(tomb, self.now) {
                    return None;
                }
                let value = ResultValue::Atomic(c.value()?.clone());
                Some(self.with_metadata(value, c))
            }
            CellValue::Collection(m) => {
                let mut effective = tomb;
                effective.apply(m.tomb);
                let elements: Vec<(Value, Value)> = m
                    .cells
                    .iter()
                    .filter(|(_, c)| c.is_live(effective, self.now))
                    .filter_map(|(k, c)| c.value().map(|v| (k.clone(), v.clone())))
                    .collect();
                if elements.is_empty() {
                    return None;
                }
                Some(ResultCell {
                    value: ResultValue::Collection(elements),
                    timestamp: None,
                    expiry: None,
                    ttl: None,
                })
            }
        }
    }

    fn with_metadata(&self, value: ResultValue, cell: &AtomicCell) -> ResultCell {
        let options = &self.slice.options;
        let expiry = cell.expiry();
        ResultCell {
            value,
            timestamp: options.send_timestamp.then_some(cell.timestamp),
            expiry: if options.send_expiry { expiry.map(|e| e.expiry) } else { None },
            ttl: if options.send_ttl { expiry.map(|e| e.ttl) } else { None },
        }
    }

    pub fn finish(self) -> QueryResult {
        debug!(
            "Query on {}.{} returned {} partitions, {} rows",
            self.schema.keyspace(),
            self.schema.table(),
            self.result.partitions.len(),
            self.result.row_count
        );
        self.result
    }
}
