//! OBLIVION - Partition Merge & Compaction Engine
//!
//! The in-memory reconciliation core of a wide-column LSM store: merges
//! independently produced fragments of one partition into a single view and
//! trims that view for reads and compaction.
//!
//! ## Features
//! - **Range Tombstone List**: ordered, non-overlapping clustering range deletions
//! - **Reversible Merge**: all-or-nothing `apply` with an undo log
//! - **Row Storage**: dense/sparse rows with timestamp-based cell reconciliation
//! - **Compaction**: TTL expiry, shadowed data removal and tombstone GC
//! - **Query Results**: row/partition limits, serialisable with bincode
//! - **Schema Upgrades**: fragments from older schema versions are converted
//! - **Metrics**: Lock-free atomic counters for observability
//! - **Concurrency**: Thread-safe Arc + RwLock wrapper
//!
//! ## Example
//! ```no_run
//! use oblivion_partition::config::Config;
//! use oblivion_partition::engine::cell::{AtomicCell, CellValue};
//! use oblivion_partition::engine::partition::MutationPartition;
//! use oblivion_partition::engine::query::PartitionSlice;
//! use oblivion_partition::engine::Engine;
//! use oblivion_partition::keys::ClusteringKeyPrefix;
//! use oblivion_partition::schema::{ColumnKind, ColumnType, Schema};
//! use oblivion_partition::types::{gc_clock_now, int32, now_micros};
//!
//! let schema = Schema::builder("ks", "cf")
//!     .with_column("pk", ColumnType::Blob, ColumnKind::PartitionKey)
//!     .with_column("ck", ColumnType::Int32, ColumnKind::ClusteringKey)
//!     .with_column("v", ColumnType::Int32, ColumnKind::Regular)
//!     .build();
//! let mut engine = Engine::open(schema.clone(), Config::default()).unwrap();
//!
//! let mut fragment = MutationPartition::new();
//! fragment
//!     .set_clustered_cell(
//!         &schema,
//!         ClusteringKeyPrefix::from_i32s(&[1]),
//!         0,
//!         CellValue::Atomic(AtomicCell::live(now_micros(), int32(42))),
//!     )
//!     .unwrap();
//! engine.apply(b"key".to_vec(), fragment).unwrap();
//!
//! let result = engine.query(&PartitionSlice::full(&schema), gc_clock_now());
//! assert_eq!(result.row_count, 1);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod schema;
pub mod tombstone;
pub mod types;
