//! OBLIVION - MemTable (Partition Write Buffer)
//! Sorted map of partition key to `MutationPartition`.
//! Fragments for the same key are merged into one partition as they arrive.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::schema::Schema;
use crate::types::{GcTime, Key};

use super::arena::Arena;
use super::compaction::GcPolicy;
use super::partition::MutationPartition;

/// In-memory partitions keyed by partition key.
pub struct MemTable {
    partitions: BTreeMap<Key, MutationPartition>,
    /// Approximate size in bytes: keys plus partition footprints.
    size_bytes: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
            size_bytes: 0,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Merge `fragment`, written under `source_schema`, into the partition
    /// at `key`. On error the table is unchanged.
    pub fn apply(
        &mut self,
        schema: &Schema,
        key: Key,
        fragment: MutationPartition,
        source_schema: &Schema,
        arena: &mut Arena,
    ) -> Result<()> {
        match self.partitions.get_mut(&key) {
            Some(partition) => {
                let before = partition.memory_usage();
                partition.apply_with_schema(schema, fragment, source_schema, arena)?;
                self.size_bytes = self.size_bytes.saturating_sub(before) + partition.memory_usage();
            }
            None => {
                // A fresh partition is only inserted once the merge succeeded.
                let mut partition = MutationPartition::new();
                partition.apply_with_schema(schema, fragment, source_schema, arena)?;
                self.size_bytes += key.len() + partition.memory_usage();
                self.partitions.insert(key, partition);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<&MutationPartition> {
        self.partitions.get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.partitions.contains_key(key)
    }

    /// Remove a partition, returning it.
    pub fn remove(&mut self, key: &[u8]) -> Option<MutationPartition> {
        let removed = self.partitions.remove(key)?;
        self.size_bytes = self
            .size_bytes
            .saturating_sub(key.len() + removed.memory_usage());
        Some(removed)
    }

    /// Compact every partition at `compaction_time` and drop the ones left
    /// empty. Returns the number of partitions dropped.
    pub fn compact(&mut self, schema: &Schema, gc: &dyn GcPolicy, compaction_time: GcTime) -> usize {
        for partition in self.partitions.values_mut() {
            partition.compact_for_compaction(schema, gc, compaction_time);
        }
        let before = self.partitions.len();
        self.partitions.retain(|_, p| !p.is_empty());
        self.size_bytes = self
            .partitions
            .iter()
            .map(|(k, p)| k.len() + p.memory_usage())
            .sum();
        before - self.partitions.len()
    }

    /// Clear all partitions and reset size.
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.size_bytes = 0;
    }

    /// Returns a reference to the inner BTreeMap for iteration.
    pub fn entries(&self) -> &BTreeMap<Key, MutationPartition> {
        &self.partitions
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
