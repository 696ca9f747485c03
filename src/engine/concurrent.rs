//! OBLIVION - Concurrent Engine Wrapper
//! Thread-safe wrapper around the partition engine using Arc + RwLock.
//!
//! ## Concurrency Model
//! - **Read operations** (`query`, `snapshot`, `len`, etc.) acquire a **read lock** (shared)
//! - **Write operations** (`apply`, `compact`) acquire a **write lock** (exclusive)
//! - A partition is never merged into while another thread reads it; readers
//!   that need a stable copy across merges take a `snapshot`
//!
//! A panic while holding the lock does not leave a partition half merged
//! (merges roll back before returning), so a poisoned lock is recovered.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::error::Result;
use crate::schema::Schema;
use crate::types::{GcTime, Key};

use super::compaction::GcPolicy;
use super::metrics::EngineMetrics;
use super::partition::MutationPartition;
use super::query::{PartitionSlice, QueryResult};
use super::Engine;

/// Thread-safe handle to a partition engine. Clones share the engine.
///
/// ## Example
/// ```no_run
/// use oblivion_partition::config::Config;
/// use oblivion_partition::engine::concurrent::ConcurrentEngine;
/// use oblivion_partition::engine::partition::MutationPartition;
/// use oblivion_partition::schema::{ColumnKind, ColumnType, Schema};
/// use oblivion_partition::tombstone::Tombstone;
/// use std::thread;
///
/// let schema = Schema::builder("ks", "cf")
///     .with_column("pk", ColumnType::Blob, ColumnKind::PartitionKey)
///     .build();
/// let engine = ConcurrentEngine::open(schema, Config::default()).unwrap();
///
/// let writer = engine.clone();
/// thread::spawn(move || {
///     let mut fragment = MutationPartition::new();
///     fragment.apply_tombstone(Tombstone::new(1, 0));
///     writer.apply(b"key".to_vec(), fragment).unwrap();
/// });
///
/// let copy = engine.snapshot(b"key");
/// ```
#[derive(Clone)]
pub struct ConcurrentEngine {
    inner: Arc<RwLock<Engine>>,
}

impl ConcurrentEngine {
    /// Open a concurrent partition engine.
    pub fn open(schema: Schema, config: Config) -> Result<Self> {
        let engine = Engine::open(schema, config)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(engine)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Engine> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Engine> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a fragment (write lock).
    pub fn apply(&self, key: Key, fragment: MutationPartition) -> Result<()> {
        self.write().apply(key, fragment)
    }

    /// Merge a fragment written under another schema (write lock).
    pub fn apply_with_schema(
        &self,
        key: Key,
        fragment: MutationPartition,
        source_schema: &Schema,
    ) -> Result<()> {
        self.write().apply_with_schema(key, fragment, source_schema)
    }

    /// Copy of the partition at `key` (read lock).
    pub fn snapshot(&self, key: &[u8]) -> Option<MutationPartition> {
        self.read().snapshot(key)
    }

    /// Read through `slice` at `now` (read lock).
    pub fn query(&self, slice: &PartitionSlice, now: GcTime) -> QueryResult {
        self.read().query(slice, now)
    }

    /// Compact all partitions (write lock).
    pub fn compact(&self, gc: &dyn GcPolicy, compaction_time: GcTime) -> usize {
        self.write().compact(gc, compaction_time)
    }

    /// Number of partitions (read lock).
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if engine is empty (read lock).
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Get MemTable size in bytes (read lock).
    pub fn memtable_size(&self) -> usize {
        self.read().memtable_size()
    }

    /// Run `f` against the engine metrics within the read lock.
    pub fn with_metrics<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&EngineMetrics) -> R,
    {
        let engine = self.read();
        f(engine.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cell::{AtomicCell, CellValue};
    use crate::keys::ClusteringKeyPrefix;
    use crate::schema::{ColumnKind, ColumnType};
    use crate::types::int32;
    use std::thread;

    fn schema() -> Schema {
        Schema::builder("ks", "cf")
            .with_column("pk", ColumnType::Blob, ColumnKind::PartitionKey)
            .with_column("ck", ColumnType::Int32, ColumnKind::ClusteringKey)
            .with_column("v", ColumnType::Int32, ColumnKind::Regular)
            .build()
    }

    fn fragment(ck: i32, ts: i64) -> MutationPartition {
        let s = schema();
        let mut p = MutationPartition::new();
        p.set_clustered_cell(
            &s,
            ClusteringKeyPrefix::from_i32s(&[ck]),
            0,
            CellValue::Atomic(AtomicCell::live(ts, int32(ck))),
        )
        .unwrap();
        p
    }

    fn open() -> ConcurrentEngine {
        ConcurrentEngine::open(schema(), Config::default()).unwrap()
    }

    #[test]
    fn test_concurrent_apply_snapshot() {
        let engine = open();
        engine.apply(b"test".to_vec(), fragment(1, 1)).unwrap();
        assert_eq!(engine.snapshot(b"test").unwrap().rows().len(), 1);
        assert!(engine.snapshot(b"missing").is_none());
    }

    #[test]
    fn test_clone_and_share() {
        let engine = open();
        let engine_clone = engine.clone();
        engine_clone.apply(b"shared".to_vec(), fragment(1, 1)).unwrap();

        // Original handle sees the update
        assert!(engine.snapshot(b"shared").is_some());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let engine = open();
        engine.apply(b"key".to_vec(), fragment(1, 1)).unwrap();
        let before = engine.snapshot(b"key").unwrap();
        engine.apply(b"key".to_vec(), fragment(2, 1)).unwrap();
        assert_eq!(before.rows().len(), 1);
        assert_eq!(engine.snapshot(b"key").unwrap().rows().len(), 2);
    }

    #[test]
    fn test_concurrent_writers() {
        let engine = open();
        let mut handles = vec![];

        // 5 writers, each merging 10 rows into its own partition
        for i in 0..5 {
            let engine_clone = engine.clone();
            let handle = thread::spawn(move || {
                let key = format!("key_{}", i).into_bytes();
                for ck in 0..10 {
                    engine_clone.apply(key.clone(), fragment(ck, 1)).unwrap();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 5);
        for i in 0..5 {
            let key = format!("key_{}", i).into_bytes();
            assert_eq!(engine.snapshot(&key).unwrap().rows().len(), 10);
        }
    }

    #[test]
    fn test_same_partition_from_many_threads() {
        let engine = open();
        let mut handles = vec![];

        for ck in 0..8 {
            let engine_clone = engine.clone();
            handles.push(thread::spawn(move || {
                engine_clone.apply(b"hot".to_vec(), fragment(ck, 1)).unwrap();
            }));
        }
        for _ in 0..4 {
            let engine_clone = engine.clone();
            handles.push(thread::spawn(move || {
                if let Some(p) = engine_clone.snapshot(b"hot") {
                    assert!(p.rows().len() <= 8);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.snapshot(b"hot").unwrap().rows().len(), 8);
    }

    #[test]
    fn test_metrics_access() {
        let engine = open();
        engine.apply(b"test".to_vec(), fragment(1, 1)).unwrap();

        engine.with_metrics(|metrics| {
            assert!(metrics.total_ops() > 0);
        });
    }
}
