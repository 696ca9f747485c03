//! OBLIVION - Compaction GC Policies
//! Decides which tombstones a compaction pass may purge.
//!
//! ## Purging
//! A tombstone becomes purgeable once its deletion time falls before the GC
//! horizon (`compaction_time - gc_grace_seconds`). Being purgeable is not
//! enough: the policy must also agree. Data the tombstone shadows may still
//! live in fragments this pass does not see, and dropping the tombstone
//! early would resurrect it.
//!
//! ## Policies
//! - `AlwaysGc`: every purgeable tombstone goes (reads use this).
//! - `NeverGc`: nothing is purged.
//! - `PurgeBelow`: only tombstones older than a timestamp no other fragment
//!   can undercut.
//! - Any `Fn(Tombstone) -> bool` closure.

use crate::tombstone::Tombstone;
use crate::types::{GcTime, Timestamp};

/// Trait deciding whether a purgeable tombstone may actually be dropped.
pub trait GcPolicy {
    fn can_gc(&self, tomb: Tombstone) -> bool;

    /// Returns the human-readable name of this policy.
    fn name(&self) -> &str {
        "Custom"
    }
}

impl<F> GcPolicy for F
where
    F: Fn(Tombstone) -> bool,
{
    fn can_gc(&self, tomb: Tombstone) -> bool {
        self(tomb)
    }
}

/// Drops every tombstone past the GC horizon.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGc;

impl GcPolicy for AlwaysGc {
    fn can_gc(&self, _tomb: Tombstone) -> bool {
        true
    }

    fn name(&self) -> &str {
        "AlwaysGc"
    }
}

/// Keeps every tombstone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverGc;

impl GcPolicy for NeverGc {
    fn can_gc(&self, _tomb: Tombstone) -> bool {
        false
    }

    fn name(&self) -> &str {
        "NeverGc"
    }
}

/// Drops tombstones written before `max_purgeable`, the oldest timestamp
/// still present in fragments outside the compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeBelow {
    pub max_purgeable: Timestamp,
}

impl PurgeBelow {
    pub fn new(max_purgeable: Timestamp) -> Self {
        Self { max_purgeable }
    }
}

impl GcPolicy for PurgeBelow {
    fn can_gc(&self, tomb: Tombstone) -> bool {
        tomb.timestamp < self.max_purgeable
    }

    fn name(&self) -> &str {
        "PurgeBelow"
    }
}

/// The GC horizon for a pass at `now`: tombstones deleted before it are
/// purgeable.
pub fn gc_before(now: GcTime, gc_grace_seconds: i64) -> GcTime {
    now.saturating_sub(gc_grace_seconds)
}
