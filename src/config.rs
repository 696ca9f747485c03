//! OBLIVION - Engine Configuration
//! Defines tunable parameters for the partition merge engine.

use crate::error::{PartitionError, Result};

/// Default tombstone grace period: 10 days.
pub const DEFAULT_GC_GRACE_SECONDS: i64 = 864_000;

/// Configuration for the partition engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds a tombstone is kept before compaction may purge it.
    pub gc_grace_seconds: i64,

    /// Maximum number of entries a single merge may construct.
    /// `None` means unbounded.
    pub arena_limit: Option<usize>,

    /// Default maximum number of live rows returned by a query.
    pub row_limit: u32,

    /// Default maximum number of partitions returned by a query.
    pub partition_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_grace_seconds: DEFAULT_GC_GRACE_SECONDS,
            arena_limit: None,
            row_limit: u32::MAX,
            partition_limit: u32::MAX,
        }
    }
}

impl Config {
    /// Create a new Config with a custom grace period.
    pub fn new(gc_grace_seconds: i64) -> Self {
        Self {
            gc_grace_seconds,
            ..Default::default()
        }
    }

    /// Bound the number of entries each merge may construct.
    pub fn with_arena_limit(mut self, limit: usize) -> Self {
        self.arena_limit = Some(limit);
        self
    }

    /// Set the default query row limit.
    pub fn with_row_limit(mut self, limit: u32) -> Self {
        self.row_limit = limit;
        self
    }

    /// Set the default query partition limit.
    pub fn with_partition_limit(mut self, limit: u32) -> Self {
        self.partition_limit = limit;
        self
    }

    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.gc_grace_seconds < 0 {
            return Err(PartitionError::Config(format!(
                "gc_grace_seconds must not be negative, got {}",
                self.gc_grace_seconds
            )));
        }
        if self.row_limit == 0 {
            return Err(PartitionError::Config("row_limit must be positive".into()));
        }
        if self.partition_limit == 0 {
            return Err(PartitionError::Config(
                "partition_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}
