//! OBLIVION - Range Tombstone
//! A deletion covering every clustering key between two bounds.

use std::cmp::Ordering;
use std::fmt;

use crate::keys::{compare_bound_key, compare_bounds, Bound, ClusteringKeyPrefix};
use crate::schema::Schema;
use crate::tombstone::Tombstone;

/// Deletion of the clustering range `[start, end]` as of `tomb`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    pub start: Bound,
    pub end: Bound,
    pub tomb: Tombstone,
}

impl RangeTombstone {
    pub fn new(start: Bound, end: Bound, tomb: Tombstone) -> Self {
        Self { start, end, tomb }
    }

    /// Inclusive range `[start, end]` over prefixes.
    pub fn inclusive(start: ClusteringKeyPrefix, end: ClusteringKeyPrefix, tomb: Tombstone) -> Self {
        Self::new(Bound::incl_start(start), Bound::incl_end(end), tomb)
    }

    pub fn is_empty(&self) -> bool {
        self.tomb.is_empty()
    }

    /// Whether start and end name the same prefix.
    pub fn is_singular(&self) -> bool {
        self.start.prefix == self.end.prefix
    }

    /// Start does not sort after end.
    pub fn is_well_formed(&self, schema: &Schema) -> bool {
        compare_bounds(schema, &self.start, &self.end) != Ordering::Greater
    }

    /// Whether `key` falls between the bounds.
    pub fn contains(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> bool {
        compare_bound_key(schema, &self.start, key) == Ordering::Less
            && compare_bound_key(schema, &self.end, key) == Ordering::Greater
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.start.prefix.memory_usage() + self.end.prefix.memory_usage()
    }
}

impl fmt::Display for RangeTombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{range_tombstone: {}, {}, {}}}", self.start, self.end, self.tomb)
    }
}
