//! OBLIVION - Merge Arena
//! Fallible construction of merge entries.
//!
//! Every entry a merge creates (range tombstone pieces, rows, cells, undo
//! records) is charged against an `Arena`. An arena with a limit fails the
//! charge once the budget is spent, which is how an out-of-memory condition
//! in the middle of a merge is simulated and tested.

use crate::error::{PartitionError, Result};

/// Entry budget for one merge.
#[derive(Debug, Clone)]
pub struct Arena {
    /// Maximum number of entries, `None` for unbounded.
    limit: Option<usize>,
    /// Entries charged so far.
    allocated: usize,
}

impl Arena {
    /// An arena that never fails on its own.
    pub fn unbounded() -> Self {
        Self {
            limit: None,
            allocated: 0,
        }
    }

    /// An arena that fails after `limit` entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            allocated: 0,
        }
    }

    /// Build an arena from an optional limit.
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            Some(n) => Self::with_limit(n),
            None => Self::unbounded(),
        }
    }

    /// Number of entries charged so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Charge one entry of type `what`.
    pub fn charge(&mut self, what: &'static str) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.allocated >= limit {
                return Err(PartitionError::AllocationFailure(what));
            }
        }
        self.allocated += 1;
        Ok(())
    }

    /// Charge one entry and hand back the constructed value.
    pub fn alloc<T>(&mut self, value: T) -> Result<T> {
        self.charge(std::any::type_name::<T>())?;
        Ok(value)
    }

    /// Make room for `additional` elements in `vec` without aborting on OOM.
    pub fn reserve<T>(&mut self, vec: &mut Vec<T>, additional: usize) -> Result<()> {
        vec.try_reserve(additional)
            .map_err(|_| PartitionError::AllocationFailure(std::any::type_name::<T>()))
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::unbounded()
    }
}
