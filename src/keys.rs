//! OBLIVION - Clustering Keys and Bounds
//! Clustering key prefixes, range bounds and the schema-aware comparators
//! that order them.
//!
//! Three orders are used:
//! - prefix-equality: components are compared over the common length only,
//!   so `(1)` and `(1, 2)` are equal. Range tombstone bookkeeping uses it.
//! - key order: lexicographic, a shorter prefix sorts first. Rows use it.
//! - positional order: a bound sorts before or after the keys sharing its
//!   prefix depending on its kind. Covering queries and slicing use it.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::schema::{ColumnType, Schema};

/// An ordered tuple of serialized clustering column values.
/// A full key has one component per clustering column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClusteringKeyPrefix(Vec<Bytes>);

/// Full clustering keys share the prefix representation.
pub type ClusteringKey = ClusteringKeyPrefix;

impl ClusteringKeyPrefix {
    pub fn new(components: Vec<Bytes>) -> Self {
        Self(components)
    }

    /// The empty prefix, matching every key.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a prefix of `Int32` components.
    pub fn from_i32s(values: &[i32]) -> Self {
        Self(
            values
                .iter()
                .map(|v| Bytes::copy_from_slice(&v.to_be_bytes()))
                .collect(),
        )
    }

    pub fn components(&self) -> &[Bytes] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this prefix names exactly one row.
    pub fn is_full(&self, schema: &Schema) -> bool {
        self.0.len() == schema.clustering_key_size()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.iter().map(|c| c.len()).sum::<usize>()
    }
}

impl fmt::Display for ClusteringKeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match <[u8; 4]>::try_from(c.as_ref()) {
                Ok(raw) => write!(f, "{}", i32::from_be_bytes(raw))?,
                Err(_) => write!(f, "{}", String::from_utf8_lossy(c))?,
            }
        }
        write!(f, ")")
    }
}

fn component_type(schema: &Schema, index: usize) -> &ColumnType {
    schema
        .clustering_column_type(index)
        .unwrap_or(&ColumnType::Blob)
}

/// Compare over the common length of the two prefixes.
pub fn prefix_equality_compare(
    schema: &Schema,
    a: &ClusteringKeyPrefix,
    b: &ClusteringKeyPrefix,
) -> Ordering {
    for (i, (x, y)) in a.0.iter().zip(&b.0).enumerate() {
        let ord = component_type(schema, i).compare(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Lexicographic key order; a prefix sorts before its extensions.
pub fn key_compare(schema: &Schema, a: &ClusteringKeyPrefix, b: &ClusteringKeyPrefix) -> Ordering {
    prefix_equality_compare(schema, a, b).then_with(|| a.len().cmp(&b.len()))
}

/// Position of a bound relative to the keys sharing its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundKind {
    ExclEnd,
    InclStart,
    InclEnd,
    ExclStart,
}

impl BoundKind {
    /// Negative weights sort before the keys sharing the prefix, positive after.
    pub fn weight(self) -> i32 {
        match self {
            BoundKind::ExclEnd => -2,
            BoundKind::InclStart => -1,
            BoundKind::InclEnd => 1,
            BoundKind::ExclStart => 2,
        }
    }

    pub fn is_start(self) -> bool {
        matches!(self, BoundKind::InclStart | BoundKind::ExclStart)
    }

    /// The kind of the bound that sits at the same position from the other side.
    pub fn invert(self) -> Self {
        match self {
            BoundKind::ExclEnd => BoundKind::InclStart,
            BoundKind::InclStart => BoundKind::ExclEnd,
            BoundKind::InclEnd => BoundKind::ExclStart,
            BoundKind::ExclStart => BoundKind::InclEnd,
        }
    }
}

/// A clustering prefix with a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bound {
    pub prefix: ClusteringKeyPrefix,
    pub kind: BoundKind,
}

impl Bound {
    pub fn new(prefix: ClusteringKeyPrefix, kind: BoundKind) -> Self {
        Self { prefix, kind }
    }

    pub fn incl_start(prefix: ClusteringKeyPrefix) -> Self {
        Self::new(prefix, BoundKind::InclStart)
    }

    pub fn excl_start(prefix: ClusteringKeyPrefix) -> Self {
        Self::new(prefix, BoundKind::ExclStart)
    }

    pub fn incl_end(prefix: ClusteringKeyPrefix) -> Self {
        Self::new(prefix, BoundKind::InclEnd)
    }

    pub fn excl_end(prefix: ClusteringKeyPrefix) -> Self {
        Self::new(prefix, BoundKind::ExclEnd)
    }

    /// Sorts before every key.
    pub fn bottom() -> Self {
        Self::incl_start(ClusteringKeyPrefix::empty())
    }

    /// Sorts after every key.
    pub fn top() -> Self {
        Self::incl_end(ClusteringKeyPrefix::empty())
    }

    /// The adjacent bound on the other side of the same position.
    pub fn inverted(&self) -> Self {
        Self::new(self.prefix.clone(), self.kind.invert())
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BoundKind::InclStart => write!(f, "[{}", self.prefix),
            BoundKind::ExclStart => write!(f, "({}", self.prefix),
            BoundKind::InclEnd => write!(f, "{}]", self.prefix),
            BoundKind::ExclEnd => write!(f, "{})", self.prefix),
        }
    }
}

/// Positional order of two bounds.
pub fn compare_bounds(schema: &Schema, a: &Bound, b: &Bound) -> Ordering {
    let ord = prefix_equality_compare(schema, &a.prefix, &b.prefix);
    if ord != Ordering::Equal {
        return ord;
    }
    match a.prefix.len().cmp(&b.prefix.len()) {
        Ordering::Equal => a.kind.weight().cmp(&b.kind.weight()),
        Ordering::Less => {
            if a.kind.weight() < 0 {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        Ordering::Greater => {
            if b.kind.weight() < 0 {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    }
}

/// Positional order of a bound against a key.
pub fn compare_bound_key(schema: &Schema, bound: &Bound, key: &ClusteringKeyPrefix) -> Ordering {
    let ord = prefix_equality_compare(schema, &bound.prefix, key);
    if ord != Ordering::Equal {
        return ord;
    }
    if bound.prefix.len() > key.len() {
        return Ordering::Greater;
    }
    if bound.kind.weight() < 0 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// A contiguous clustering range. Missing bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringRange {
    pub start: Option<Bound>,
    pub end: Option<Bound>,
}

impl ClusteringRange {
    /// The range selecting every row.
    pub fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn new(start: Option<Bound>, end: Option<Bound>) -> Self {
        Self { start, end }
    }

    /// The range selecting exactly the rows under `prefix`.
    pub fn singular(prefix: ClusteringKeyPrefix) -> Self {
        Self {
            start: Some(Bound::incl_start(prefix.clone())),
            end: Some(Bound::incl_end(prefix)),
        }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Concrete start bound, `bottom` when unbounded.
    pub fn start_bound(&self) -> Bound {
        self.start.clone().unwrap_or_else(Bound::bottom)
    }

    /// Concrete end bound, `top` when unbounded.
    pub fn end_bound(&self) -> Bound {
        self.end.clone().unwrap_or_else(Bound::top)
    }

    pub fn contains(&self, schema: &Schema, key: &ClusteringKeyPrefix) -> bool {
        let after_start = self
            .start
            .as_ref()
            .map_or(true, |b| compare_bound_key(schema, b, key) == Ordering::Less);
        let before_end = self
            .end
            .as_ref()
            .map_or(true, |b| compare_bound_key(schema, b, key) == Ordering::Greater);
        after_start && before_end
    }
}

/// Whether the ranges restrict clustering keys at all.
pub fn has_ck_selector(ranges: &[ClusteringRange]) -> bool {
    !(ranges.len() == 1 && ranges[0].is_full())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;

    fn schema() -> Schema {
        Schema::builder("ks", "cf")
            .with_column("pk", ColumnType::Int32, ColumnKind::PartitionKey)
            .with_column("ck1", ColumnType::Int32, ColumnKind::ClusteringKey)
            .with_column("ck2", ColumnType::Int32, ColumnKind::ClusteringKey)
            .build()
    }

    fn key(v: &[i32]) -> ClusteringKeyPrefix {
        ClusteringKeyPrefix::from_i32s(v)
    }

    #[test]
    fn test_prefix_equality() {
        let s = schema();
        assert_eq!(prefix_equality_compare(&s, &key(&[1]), &key(&[1, 2])), Ordering::Equal);
        assert_eq!(prefix_equality_compare(&s, &key(&[-1]), &key(&[1, 2])), Ordering::Less);
        assert_eq!(key_compare(&s, &key(&[1]), &key(&[1, 2])), Ordering::Less);
        assert_eq!(key_compare(&s, &key(&[1, 3]), &key(&[1, 2])), Ordering::Greater);
    }

    #[test]
    fn test_bound_against_key() {
        let s = schema();
        let k = key(&[1, 2]);
        assert_eq!(compare_bound_key(&s, &Bound::incl_start(key(&[1])), &k), Ordering::Less);
        assert_eq!(compare_bound_key(&s, &Bound::excl_end(key(&[1])), &k), Ordering::Less);
        assert_eq!(compare_bound_key(&s, &Bound::incl_end(key(&[1])), &k), Ordering::Greater);
        assert_eq!(compare_bound_key(&s, &Bound::excl_start(key(&[1, 2])), &k), Ordering::Greater);
        assert_eq!(compare_bound_key(&s, &Bound::incl_start(key(&[1, 3])), &k), Ordering::Greater);
        assert_eq!(compare_bound_key(&s, &Bound::bottom(), &k), Ordering::Less);
        assert_eq!(compare_bound_key(&s, &Bound::top(), &k), Ordering::Greater);
    }

    #[test]
    fn test_bound_against_bound() {
        let s = schema();
        let p = key(&[4]);
        let kinds = [
            BoundKind::ExclEnd,
            BoundKind::InclStart,
            BoundKind::InclEnd,
            BoundKind::ExclStart,
        ];
        for w in kinds.windows(2) {
            let a = Bound::new(p.clone(), w[0]);
            let b = Bound::new(p.clone(), w[1]);
            assert_eq!(compare_bounds(&s, &a, &b), Ordering::Less);
            assert_eq!(compare_bounds(&s, &b, &a), Ordering::Greater);
        }

        let short_start = Bound::incl_start(key(&[4]));
        let short_end = Bound::incl_end(key(&[4]));
        let long = Bound::incl_end(key(&[4, 9]));
        assert_eq!(compare_bounds(&s, &short_start, &long), Ordering::Less);
        assert_eq!(compare_bounds(&s, &short_end, &long), Ordering::Greater);
        assert_eq!(compare_bounds(&s, &long, &short_end), Ordering::Less);
    }

    #[test]
    fn test_range_contains() {
        let s = schema();
        let r = ClusteringRange::new(
            Some(Bound::excl_start(key(&[1]))),
            Some(Bound::incl_end(key(&[3]))),
        );
        assert!(!r.contains(&s, &key(&[1, 5])));
        assert!(r.contains(&s, &key(&[2, 0])));
        assert!(r.contains(&s, &key(&[3, 7])));
        assert!(!r.contains(&s, &key(&[4, 0])));
        assert!(ClusteringRange::full().contains(&s, &key(&[9, 9])));
    }

    #[test]
    fn test_ck_selector() {
        assert!(!has_ck_selector(&[ClusteringRange::full()]));
        assert!(has_ck_selector(&[ClusteringRange::singular(key(&[1]))]));
        assert!(has_ck_selector(&[]));
    }
}
