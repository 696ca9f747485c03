//! OBLIVION - Tombstones
//! A deletion marker: the write timestamp it shadows and the GC clock time
//! it was created at.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{GcTime, Timestamp, MISSING_TIMESTAMP};

/// Deletion marker. Ordered by timestamp, then by deletion time, so two
/// tombstones with the same timestamp still reconcile deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tombstone {
    pub timestamp: Timestamp,
    pub deletion_time: GcTime,
}

impl Tombstone {
    pub fn new(timestamp: Timestamp, deletion_time: GcTime) -> Self {
        Self {
            timestamp,
            deletion_time,
        }
    }

    /// The tombstone that deletes nothing.
    pub const fn empty() -> Self {
        Self {
            timestamp: MISSING_TIMESTAMP,
            deletion_time: GcTime::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp == MISSING_TIMESTAMP
    }

    /// Keep the greater of the two.
    pub fn apply(&mut self, other: Tombstone) {
        if other > *self {
            *self = other;
        }
    }

    /// Whether a write at `timestamp` is shadowed.
    pub fn deletes(&self, timestamp: Timestamp) -> bool {
        !self.is_empty() && timestamp <= self.timestamp
    }

    /// Whether the tombstone may be dropped at GC horizon `gc_before`.
    pub fn is_purgeable(&self, gc_before: GcTime) -> bool {
        !self.is_empty() && self.deletion_time < gc_before
    }
}

impl Default for Tombstone {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Tombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "{{tombstone: none}}")
        } else {
            write!(
                f,
                "{{tombstone: timestamp={}, deletion_time={}}}",
                self.timestamp, self.deletion_time
            )
        }
    }
}
