//! OBLIVION - Partition Engine Module
//! Top-level module for the partition merge and compaction components.

pub mod arena;
pub mod cell;
pub mod compaction;
pub mod concurrent;
pub mod memtable;
pub mod metrics;
pub mod partition;
pub mod query;
pub mod range_tombstone;
pub mod range_tombstone_list;
pub mod row;
pub mod undo;
pub mod visitor;

use crate::config::Config;
use crate::error::Result;
use crate::schema::Schema;
use crate::types::{GcTime, Key};

use self::arena::Arena;
use self::compaction::GcPolicy;
use self::memtable::MemTable;
use self::metrics::EngineMetrics;
use self::partition::MutationPartition;
use self::query::{PartitionSlice, QueryResult, QueryResultBuilder};

/// The partition engine for one table.
/// Buffers partitions per key, merges incoming fragments into them and
/// serves reads and compactions over the buffer.
pub struct Engine {
    schema: Schema,
    memtable: MemTable,
    config: Config,
    metrics: EngineMetrics,
}

impl Engine {
    /// Open an engine for `schema`. The configured grace period replaces the
    /// schema's own.
    pub fn open(schema: Schema, config: Config) -> Result<Self> {
        config.validate()?;
        let schema = schema.with_gc_grace_seconds(config.gc_grace_seconds);

        log::info!(
            "Oblivion partition engine opened for {}.{} (schema {}, gc grace {}s, arena limit {:?})",
            schema.keyspace(),
            schema.table(),
            schema.version(),
            config.gc_grace_seconds,
            config.arena_limit
        );

        Ok(Self {
            schema,
            memtable: MemTable::new(),
            config,
            metrics: EngineMetrics::new(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Merge a fragment written under the engine's schema.
    pub fn apply(&mut self, key: Key, fragment: MutationPartition) -> Result<()> {
        let mut arena = Arena::from_limit(self.config.arena_limit);
        let result = self
            .memtable
            .apply(&self.schema, key, fragment, &self.schema, &mut arena);
        self.record_merge(result, false)
    }

    /// Merge a fragment written under `source_schema`, upgrading it first if
    /// the versions differ. A failed merge leaves the engine unchanged.
    pub fn apply_with_schema(
        &mut self,
        key: Key,
        fragment: MutationPartition,
        source_schema: &Schema,
    ) -> Result<()> {
        let upgraded = self.schema.version() != source_schema.version();
        let mut arena = Arena::from_limit(self.config.arena_limit);
        let result = self
            .memtable
            .apply(&self.schema, key, fragment, source_schema, &mut arena);
        self.record_merge(result, upgraded)
    }

    fn record_merge(&self, result: Result<()>, upgraded: bool) -> Result<()> {
        match &result {
            Ok(()) => self.metrics.record_merge(upgraded),
            Err(_) => self.metrics.record_rollback(),
        }
        result
    }

    /// The buffered partition at `key`.
    pub fn get(&self, key: &[u8]) -> Option<&MutationPartition> {
        self.memtable.get(key)
    }

    /// A copy of the partition at `key`, unaffected by later merges.
    pub fn snapshot(&self, key: &[u8]) -> Option<MutationPartition> {
        self.memtable.get(key).cloned()
    }

    /// Read every partition through `slice` at `now` under the configured limits.
    pub fn query(&self, slice: &PartitionSlice, now: GcTime) -> QueryResult {
        self.query_with_limits(slice, now, self.config.row_limit, self.config.partition_limit)
    }

    pub fn query_with_limits(
        &self,
        slice: &PartitionSlice,
        now: GcTime,
        row_limit: u32,
        partition_limit: u32,
    ) -> QueryResult {
        let mut builder = QueryResultBuilder::new(&self.schema, slice, now, row_limit, partition_limit);
        for (key, partition) in self.memtable.entries() {
            if builder.is_full() {
                break;
            }
            builder.add_partition(key, partition);
        }
        let result = builder.finish();
        self.metrics.record_query(result.row_count);
        result
    }

    /// Read one partition through `slice` at `now`.
    pub fn query_partition(&self, key: &[u8], slice: &PartitionSlice, now: GcTime) -> QueryResult {
        let mut builder = QueryResultBuilder::new(
            &self.schema,
            slice,
            now,
            self.config.row_limit,
            self.config.partition_limit,
        );
        if let Some(partition) = self.memtable.get(key) {
            builder.add_partition(&key.to_vec(), partition);
        }
        let result = builder.finish();
        self.metrics.record_query(result.row_count);
        result
    }

    /// Compact every buffered partition at `compaction_time`. Returns the
    /// number of partitions that became empty and were dropped.
    pub fn compact(&mut self, gc: &dyn GcPolicy, compaction_time: GcTime) -> usize {
        let purged = self.memtable.compact(&self.schema, gc, compaction_time);
        self.metrics.record_compaction(purged);
        log::debug!(
            "Compaction at {} with {} dropped {} partitions, {} remain",
            compaction_time,
            gc.name(),
            purged,
            self.memtable.len()
        );
        purged
    }

    /// Number of buffered partitions.
    pub fn len(&self) -> usize {
        self.memtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    /// Approximate buffer size in bytes.
    pub fn memtable_size(&self) -> usize {
        self.memtable.size()
    }

    /// Buffered partitions in key order.
    pub fn partitions(&self) -> impl Iterator<Item = (&Key, &MutationPartition)> {
        self.memtable.entries().iter()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }
}
