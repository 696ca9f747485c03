//! OBLIVION - Mutation Partition
//! All data of one partition: partition tombstone, static row, clustered
//! rows and range tombstones.
//!
//! ## Merge
//! `apply` merges a source fragment into `self`, all or nothing:
//! 1. Range tombstones are merged into a copy of the list.
//! 2. Static and clustered cells are merged in place; every change is
//!    recorded in a `MergeLog` before it happens.
//! 3. On success the list copy is swapped in and the partition tombstone is
//!    applied, neither of which can fail. On failure the log is replayed
//!    backwards and the copy dropped.
//!
//! ## Compaction
//! `compact_for_query` and `compact_for_compaction` share one pass that
//! expires cells, drops shadowed data, purges tombstones past the GC
//! horizon and trims rows and range tombstones to the requested ranges
//! and row limit.

use std::cmp::Ordering;

use log::{debug, warn};

use crate::error::{PartitionError, Result};
use crate::keys::{
    compare_bound_key, has_ck_selector, key_compare, BoundKind, ClusteringKey, ClusteringKeyPrefix,
    ClusteringRange,
};
use crate::schema::{ColumnKind, Schema};
use crate::tombstone::Tombstone;
use crate::types::{ColumnId, GcTime, Timestamp};

use super::arena::Arena;
use super::cell::{CellValue, RowMarker};
use super::compaction::{self, AlwaysGc, GcPolicy};
use super::range_tombstone::RangeTombstone;
use super::range_tombstone_list::RangeTombstoneList;
use super::row::{DeletableRow, Row};
use super::undo::{MergeLog, Undo};
use super::visitor::{MutationPartitionVisitor, UpgradingBuilder};

/// A clustered row and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    pub key: ClusteringKey,
    pub row: DeletableRow,
}

/// One partition's worth of mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationPartition {
    tombstone: Tombstone,
    static_row: Row,
    /// Sorted by clustering key.
    rows: Vec<RowEntry>,
    row_tombstones: RangeTombstoneList,
}

impl MutationPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// No tombstone, static cells, rows or range tombstones.
    pub fn is_empty(&self) -> bool {
        self.tombstone.is_empty()
            && self.static_row.is_empty()
            && self.rows.is_empty()
            && self.row_tombstones.is_empty()
    }

    pub fn partition_tombstone(&self) -> Tombstone {
        self.tombstone
    }

    pub fn static_row(&self) -> &Row {
        &self.static_row
    }

    pub fn rows(&self) -> &[RowEntry] {
        &self.rows
    }

    pub fn row_tombstones(&self) -> &RangeTombstoneList {
        &self.row_tombstones
    }

    fn position(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> std::result::Result<usize, usize> {
        self.rows
            .binary_search_by(|e| key_compare(schema, &e.key, key))
    }

    pub fn find_row(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> Option<&DeletableRow> {
        self.position(schema, key).ok().map(|i| &self.rows[i].row)
    }

    /// The row at `key`, inserted empty if missing.
    pub fn clustered_row(&mut self, schema: &Schema, key: ClusteringKey) -> &mut DeletableRow {
        let i = match self.position(schema, &key) {
            Ok(i) => i,
            Err(i) => {
                self.rows.insert(
                    i,
                    RowEntry {
                        key,
                        row: DeletableRow::new(),
                    },
                );
                i
            }
        };
        &mut self.rows[i].row
    }

    /// Append a row after all existing ones.
    pub fn append_row(&mut self, schema: &Schema, key: ClusteringKey, row: DeletableRow) -> Result<()> {
        if let Some(last) = self.rows.last() {
            if key_compare(schema, &last.key, &key) != Ordering::Less {
                return Err(PartitionError::InvariantViolation(format!(
                    "row {} appended after {}",
                    key, last.key
                )));
            }
        }
        self.rows.push(RowEntry { key, row });
        Ok(())
    }

    pub(crate) fn last_row_mut(&mut self) -> Option<&mut DeletableRow> {
        self.rows.last_mut().map(|e| &mut e.row)
    }

    /// Delete the whole partition.
    pub fn apply_tombstone(&mut self, tomb: Tombstone) {
        self.tombstone.apply(tomb);
    }

    /// Delete every row under `prefix`.
    pub fn apply_row_tombstone(&mut self, schema: &Schema, prefix: ClusteringKeyPrefix, tomb: Tombstone) {
        if prefix.is_empty() {
            self.apply_tombstone(tomb);
        } else if prefix.is_full(schema) {
            self.clustered_row(schema, prefix).apply_tombstone(tomb);
        } else {
            self.row_tombstones
                .add(schema, RangeTombstone::inclusive(prefix.clone(), prefix, tomb));
        }
    }

    /// Add `rt` to the range tombstones as is.
    pub fn apply_range_tombstone(&mut self, schema: &Schema, rt: RangeTombstone) {
        self.row_tombstones.add(schema, rt);
    }

    /// Delete a clustering range. A range naming exactly one row becomes a
    /// row tombstone.
    pub fn apply_delete(&mut self, schema: &Schema, rt: RangeTombstone) {
        let single_row = rt.is_singular()
            && rt.start.prefix.is_full(schema)
            && rt.start.kind == BoundKind::InclStart
            && rt.end.kind == BoundKind::InclEnd;
        if single_row {
            self.clustered_row(schema, rt.start.prefix).apply_tombstone(rt.tomb);
        } else {
            self.row_tombstones.add(schema, rt);
        }
    }

    /// Record that the row at `key` was created at `created_at`.
    pub fn apply_insert(&mut self, schema: &Schema, key: ClusteringKey, created_at: Timestamp) {
        self.apply_marker(schema, key, RowMarker::live(created_at));
    }

    pub fn apply_marker(&mut self, schema: &Schema, key: ClusteringKey, marker: RowMarker) {
        self.clustered_row(schema, key).apply_marker(marker);
    }

    pub fn set_static_cell(&mut self, schema: &Schema, id: ColumnId, value: CellValue) -> Result<()> {
        let def = schema.static_column_at(id)?;
        self.static_row.apply(def, value)
    }

    pub fn set_clustered_cell(
        &mut self,
        schema: &Schema,
        key: ClusteringKey,
        id: ColumnId,
        value: CellValue,
    ) -> Result<()> {
        let def = schema.regular_column_at(id)?;
        value.check_kind(def)?;
        self.clustered_row(schema, key).cells.apply(def, value)
    }

    /// Partition tombstone combined with the range tombstone covering `key`.
    pub fn range_tombstone_for_row(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> Tombstone {
        let mut t = self.tombstone;
        if !self.row_tombstones.is_empty() {
            t.apply(self.row_tombstones.search_tombstone_covering(schema, key));
        }
        t
    }

    /// Everything deleting the row at `key`: partition, range and row tombstones.
    pub fn tombstone_for_row(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> Tombstone {
        let mut t = self.range_tombstone_for_row(schema, key);
        if let Some(row) = self.find_row(schema, key) {
            t.apply(row.deleted_at);
        }
        t
    }

    /// Merge `source` into `self` with an unbounded arena.
    pub fn apply(&mut self, schema: &Schema, source: MutationPartition) -> Result<()> {
        let mut arena = Arena::unbounded();
        self.apply_in(schema, source, &mut arena)
    }

    /// Merge `source` into `self`, charging new entries to `arena`.
    ///
    /// On error `self` is exactly as it was before the call. `source` is
    /// consumed either way.
    pub fn apply_in(&mut self, schema: &Schema, source: MutationPartition, arena: &mut Arena) -> Result<()> {
        let MutationPartition {
            tombstone,
            static_row,
            rows,
            row_tombstones,
        } = source;

        let mut pending = self.row_tombstones.clone();
        for rt in row_tombstones.iter() {
            if let Err(e) = pending.try_add(schema, rt.clone(), arena) {
                warn!("Merge into {}.{} failed on range tombstones: {}", schema.keyspace(), schema.table(), e);
                return Err(e);
            }
        }

        let mut log = MergeLog::new();
        if let Err(e) = self.merge_rows(schema, static_row, rows, &mut log, arena) {
            let undone = log.revert(&mut self.static_row, &mut self.rows);
            warn!(
                "Merge into {}.{} rolled back after {} changes: {}",
                schema.keyspace(),
                schema.table(),
                undone,
                e
            );
            return Err(e);
        }

        self.row_tombstones = pending;
        self.tombstone.apply(tombstone);
        let changes = log.commit();
        debug!(
            "Merged fragment into {}.{}: {} changes, {} rows, {} range tombstones",
            schema.keyspace(),
            schema.table(),
            changes,
            self.rows.len(),
            self.row_tombstones.len()
        );
        Ok(())
    }

    fn merge_rows(
        &mut self,
        schema: &Schema,
        static_row: Row,
        rows: Vec<RowEntry>,
        log: &mut MergeLog,
        arena: &mut Arena,
    ) -> Result<()> {
        for (id, cell) in static_row.iter() {
            let def = schema.static_column_at(id)?;
            log.reserve(arena)?;
            let prior = self
                .static_row
                .apply_cell_reversibly(def, cell.clone(), arena)?;
            log.push(Undo::StaticCell { column: id, prior });
        }

        for entry in rows {
            if entry.row.is_empty() {
                continue;
            }
            let RowEntry { key, row: src } = entry;

            let idx = match self.position(schema, &key) {
                Ok(i) => i,
                Err(i) => {
                    log.reserve(arena)?;
                    arena.reserve(&mut self.rows, 1)?;
                    let new_row = arena.alloc(RowEntry {
                        key,
                        row: DeletableRow::new(),
                    })?;
                    self.rows.insert(i, new_row);
                    log.push(Undo::RowInserted { row: i });
                    i
                }
            };

            if !src.deleted_at.is_empty() {
                log.reserve(arena)?;
                let dst = &mut self.rows[idx].row;
                log.push(Undo::RowTombstone {
                    row: idx,
                    prior: dst.deleted_at,
                });
                dst.apply_tombstone(src.deleted_at);
            }

            if !src.marker.is_missing() {
                log.reserve(arena)?;
                let dst = &mut self.rows[idx].row;
                log.push(Undo::Marker {
                    row: idx,
                    prior: dst.marker,
                });
                dst.apply_marker(src.marker);
            }

            for (id, cell) in src.cells.iter() {
                let def = schema.regular_column_at(id)?;
                log.reserve(arena)?;
                let prior = self.rows[idx]
                    .row
                    .cells
                    .apply_cell_reversibly(def, cell.clone(), arena)?;
                log.push(Undo::Cell {
                    row: idx,
                    column: id,
                    prior,
                });
            }
        }
        Ok(())
    }

    /// Merge `source`, written under `source_schema`, into `self`.
    ///
    /// A fragment from another schema version is upgraded first and the
    /// merge retried once; a fragment that cannot be upgraded fails.
    pub fn apply_with_schema(
        &mut self,
        schema: &Schema,
        source: MutationPartition,
        source_schema: &Schema,
        arena: &mut Arena,
    ) -> Result<()> {
        match schema.check_version(source_schema) {
            Ok(()) => self.apply_in(schema, source, arena),
            Err(PartitionError::SchemaVersionMismatch { expected, found }) => {
                debug!(
                    "Upgrading fragment for {}.{} from schema {} to {}",
                    schema.keyspace(),
                    schema.table(),
                    found,
                    expected
                );
                let upgraded = source.upgrade(source_schema, schema)?;
                self.apply_in(schema, upgraded, arena)
            }
            Err(e) => Err(e),
        }
    }

    /// Convert a partition written under `from` to the layout of `to`.
    pub fn upgrade(&self, from: &Schema, to: &Schema) -> Result<MutationPartition> {
        let mapping = from.column_mapping(to)?;
        let mut builder = UpgradingBuilder::new(to, &mapping);
        self.accept(&mut builder);
        builder.finish()
    }

    /// The part of `self` not already implied by `other`.
    pub fn difference(&self, schema: &Schema, other: &MutationPartition) -> Result<MutationPartition> {
        let mut mp = MutationPartition::new();
        if self.tombstone > other.tombstone {
            mp.apply_tombstone(self.tombstone);
        }
        mp.static_row = self
            .static_row
            .difference(&other.static_row, |id| schema.column_at(ColumnKind::Static, id))?;
        mp.row_tombstones = self.row_tombstones.difference(schema, &other.row_tombstones);

        let mut j = 0;
        for entry in &self.rows {
            while j < other.rows.len()
                && key_compare(schema, &other.rows[j].key, &entry.key) == Ordering::Less
            {
                j += 1;
            }
            match other.rows.get(j) {
                Some(theirs) if theirs.key == entry.key => {
                    let mut dr = DeletableRow::new();
                    if entry.row.deleted_at > theirs.row.deleted_at {
                        dr.apply_tombstone(entry.row.deleted_at);
                    }
                    if entry.row.marker.compare(&theirs.row.marker) == Ordering::Greater {
                        dr.apply_marker(entry.row.marker);
                    }
                    dr.cells = entry
                        .row
                        .cells
                        .difference(&theirs.row.cells, |id| schema.column_at(ColumnKind::Regular, id))?;
                    if !dr.is_empty() {
                        mp.rows.push(RowEntry {
                            key: entry.key.clone(),
                            row: dr,
                        });
                    }
                }
                _ => mp.rows.push(entry.clone()),
            }
        }
        Ok(mp)
    }

    /// Walk the partition in clustering order.
    pub fn accept(&self, visitor: &mut dyn MutationPartitionVisitor) {
        visitor.accept_partition_tombstone(self.tombstone);
        for (id, cell) in self.static_row.iter() {
            match cell {
                CellValue::Atomic(c) => visitor.accept_static_cell(id, c),
                CellValue::Collection(m) => visitor.accept_static_collection(id, m),
            }
        }
        for rt in &self.row_tombstones {
            visitor.accept_row_tombstone(rt);
        }
        for entry in &self.rows {
            visitor.accept_row(&entry.key, entry.row.deleted_at, entry.row.marker);
            for (id, cell) in entry.row.cells.iter() {
                match cell {
                    CellValue::Atomic(c) => visitor.accept_row_cell(id, c),
                    CellValue::Collection(m) => visitor.accept_row_collection(id, m),
                }
            }
        }
    }

    /// Compact for a read at `now`: drop everything outside `ranges`,
    /// garbage collect unconditionally past the horizon, and keep at most
    /// `row_limit` live rows. Ranges are given in ascending order; with
    /// `reversed` rows are counted from the end. Returns the live row count.
    pub fn compact_for_query(
        &mut self,
        schema: &Schema,
        now: GcTime,
        ranges: &[ClusteringRange],
        reversed: bool,
        row_limit: u32,
    ) -> u32 {
        self.do_compact(schema, now, ranges, reversed, row_limit, &AlwaysGc)
    }

    /// Compact the whole partition at `compaction_time`, purging only the
    /// tombstones `gc` approves.
    pub fn compact_for_compaction(&mut self, schema: &Schema, gc: &dyn GcPolicy, compaction_time: GcTime) {
        let live = self.do_compact(
            schema,
            compaction_time,
            &[ClusteringRange::full()],
            false,
            u32::MAX,
            gc,
        );
        debug!(
            "Compacted partition of {}.{} with {}: {} live rows, {} rows kept, {} range tombstones",
            schema.keyspace(),
            schema.table(),
            gc.name(),
            live,
            self.rows.len(),
            self.row_tombstones.len()
        );
    }

    fn row_span(&self, schema: &Schema, range: &ClusteringRange) -> (usize, usize) {
        let lo = match &range.start {
            Some(b) => self
                .rows
                .partition_point(|e| compare_bound_key(schema, b, &e.key) == Ordering::Greater),
            None => 0,
        };
        let hi = match &range.end {
            Some(b) => self
                .rows
                .partition_point(|e| compare_bound_key(schema, b, &e.key) == Ordering::Greater),
            None => self.rows.len(),
        };
        (lo, hi.max(lo))
    }

    fn do_compact(
        &mut self,
        schema: &Schema,
        now: GcTime,
        ranges: &[ClusteringRange],
        reversed: bool,
        row_limit: u32,
        gc: &dyn GcPolicy,
    ) -> u32 {
        let gc_before = compaction::gc_before(now, schema.gc_grace_seconds());
        let should_purge = |t: Tombstone| t.is_purgeable(gc_before) && gc.can_gc(t);

        let static_live = self
            .static_row
            .compact_and_expire(self.tombstone, now, gc_before, gc);

        let mut spans: Vec<(usize, usize)> = ranges.iter().map(|r| self.row_span(schema, r)).collect();
        if reversed {
            spans.reverse();
        }

        let mut rows = std::mem::take(&mut self.rows);
        let mut keep = vec![false; rows.len()];
        let mut row_count: u32 = 0;

        'ranges: for (lo, hi) in spans {
            let visit: Box<dyn Iterator<Item = usize>> = if reversed {
                Box::new((lo..hi).rev())
            } else {
                Box::new(lo..hi)
            };
            for idx in visit {
                let entry = &mut rows[idx];
                let mut tomb = self.range_tombstone_for_row(schema, &entry.key);
                tomb.apply(entry.row.deleted_at);

                let row = &mut entry.row;
                let mut is_live = row.cells.compact_and_expire(tomb, now, gc_before, gc);
                is_live |= row.marker.compact_and_expire(tomb, now, gc_before, gc);
                if should_purge(row.deleted_at) {
                    row.deleted_at = Tombstone::empty();
                }

                // Past the limit, stop at the next live row so trailing
                // tombstones stay with the result.
                if is_live {
                    if row_count == row_limit {
                        break 'ranges;
                    }
                    row_count += 1;
                }
                keep[idx] = !row.is_empty();
            }
        }

        let mut flags = keep.into_iter();
        rows.retain(|_| flags.next().unwrap_or(false));
        self.rows = rows;

        if row_count == 0 && static_live && !has_ck_selector(ranges) {
            row_count = 1;
        }

        let partition_ts = self.tombstone.timestamp;
        self.row_tombstones
            .erase_where(|rt| should_purge(rt.tomb) || rt.tomb.timestamp <= partition_ts);
        if should_purge(self.tombstone) {
            self.tombstone = Tombstone::empty();
        }

        if has_ck_selector(ranges) {
            let mut selected = RangeTombstoneList::new();
            for range in ranges {
                let (start, end) = (range.start_bound(), range.end_bound());
                for rt in self.row_tombstones.slice(schema, &start, &end) {
                    selected.add(schema, rt.clone());
                }
            }
            self.row_tombstones = selected;
        }

        row_count
    }

    /// Live rows at `now`; a partition with only live static data counts as one.
    pub fn live_row_count(&self, schema: &Schema, now: GcTime) -> u32 {
        let count = self
            .rows
            .iter()
            .filter(|e| e.row.is_live(self.range_tombstone_for_row(schema, &e.key), now))
            .count() as u32;
        if count == 0 && self.is_static_row_live(now) {
            return 1;
        }
        count
    }

    pub fn is_static_row_live(&self, now: GcTime) -> bool {
        self.static_row.is_live(self.tombstone, now)
    }

    /// Approximate heap and inline footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.static_row.memory_usage()
            + self
                .rows
                .iter()
                .map(|e| e.key.memory_usage() + e.row.memory_usage())
                .sum::<usize>()
            + self.row_tombstones.memory_usage()
    }
}
