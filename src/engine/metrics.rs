//! OBLIVION - Engine Metrics & Observability
//! Provides atomic counters for tracking engine operations
//! in a lock-free, thread-safe manner using `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the partition engine.
///
/// All counters use `Ordering::Relaxed`; they are for observation only.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Fragments merged successfully.
    pub merges: AtomicU64,
    /// Merges that failed and were rolled back.
    pub rollbacks: AtomicU64,
    /// Fragments upgraded from another schema version before merging.
    pub upgrades: AtomicU64,
    /// Compaction passes over the whole buffer.
    pub compactions: AtomicU64,
    /// Partitions dropped by compaction.
    pub partitions_purged: AtomicU64,
    /// Queries served.
    pub queries: AtomicU64,
    /// Rows returned by queries, static-only partitions counting one.
    pub rows_returned: AtomicU64,
    /// Timestamp when the engine was opened.
    engine_started: Instant,
}

impl EngineMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            merges: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            partitions_purged: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            rows_returned: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    pub fn record_merge(&self, upgraded: bool) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        if upgraded {
            self.upgrades.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a compaction pass and the partitions it dropped.
    pub fn record_compaction(&self, purged: usize) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.partitions_purged
            .fetch_add(purged as u64, Ordering::Relaxed);
    }

    /// Record a query and the rows it returned.
    pub fn record_query(&self, rows: u32) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.rows_returned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Get engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Merges attempted, queries and compactions.
    pub fn total_ops(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
            + self.rollbacks.load(Ordering::Relaxed)
            + self.compactions.load(Ordering::Relaxed)
            + self.queries.load(Ordering::Relaxed)
    }

    /// Get operations per second since engine start.
    pub fn ops_per_sec(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime < 0.001 {
            return 0.0;
        }
        self.total_ops() as f64 / uptime
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ OBLIVION Engine Metrics ═══\n\
             Merges:\n\
               merged:      {}\n\
               rolled back: {}\n\
               upgraded:    {}\n\
             Compaction:\n\
               passes:      {}\n\
               purged:      {} partitions\n\
             Queries:\n\
               queries:     {}\n\
               rows:        {}\n\
             Throughput:\n\
               total ops:   {}\n\
               ops/sec:     {:.2}\n\
             Uptime: {:.2}s",
            self.merges.load(Ordering::Relaxed),
            self.rollbacks.load(Ordering::Relaxed),
            self.upgrades.load(Ordering::Relaxed),
            self.compactions.load(Ordering::Relaxed),
            self.partitions_purged.load(Ordering::Relaxed),
            self.queries.load(Ordering::Relaxed),
            self.rows_returned.load(Ordering::Relaxed),
            self.total_ops(),
            self.ops_per_sec(),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
