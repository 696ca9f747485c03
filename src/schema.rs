//! OBLIVION - Schema Catalog
//! Column definitions, type-aware value comparison and the column mapping
//! used to upgrade fragments written under an older schema version.
//!
//! The engine never mutates a schema; every operation borrows one.

use std::cmp::Ordering;
use std::fmt;

use crate::config::DEFAULT_GC_GRACE_SECONDS;
use crate::error::{PartitionError, Result};
use crate::types::ColumnId;

/// Data type of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int32,
    BigInt,
    Boolean,
    Text,
    Blob,
    /// Same values as the inner type, sorted in descending order.
    Reversed(Box<ColumnType>),
    Set(Box<ColumnType>),
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
}

impl ColumnType {
    /// Atomic columns hold a single cell; collections hold per-element cells.
    pub fn is_atomic(&self) -> bool {
        match self {
            ColumnType::Set(_) | ColumnType::List(_) | ColumnType::Map(_, _) => false,
            ColumnType::Reversed(inner) => inner.is_atomic(),
            _ => true,
        }
    }

    /// Compare two serialized values of this type.
    /// Malformed fixed-width values fall back to byte order.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            ColumnType::Int32 => match (<[u8; 4]>::try_from(a), <[u8; 4]>::try_from(b)) {
                (Ok(x), Ok(y)) => i32::from_be_bytes(x).cmp(&i32::from_be_bytes(y)),
                _ => a.cmp(b),
            },
            ColumnType::BigInt => match (<[u8; 8]>::try_from(a), <[u8; 8]>::try_from(b)) {
                (Ok(x), Ok(y)) => i64::from_be_bytes(x).cmp(&i64::from_be_bytes(y)),
                _ => a.cmp(b),
            },
            ColumnType::Reversed(inner) => inner.compare(a, b).reverse(),
            _ => a.cmp(b),
        }
    }

    /// Compare two collection element keys (set members, map keys, list cell ids).
    pub fn compare_element_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            ColumnType::Set(elem) => elem.compare(a, b),
            ColumnType::Map(key, _) => key.compare(a, b),
            ColumnType::Reversed(inner) => inner.compare_element_keys(a, b),
            _ => a.cmp(b),
        }
    }

    /// Whether values written as `other` can be read as `self`.
    pub fn is_value_compatible_with(&self, other: &ColumnType) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (ColumnType::Blob, o) => o.is_atomic(),
            (ColumnType::Reversed(a), b) | (b, ColumnType::Reversed(a)) => {
                a.is_value_compatible_with(b)
            }
            _ => false,
        }
    }
}

/// Role of a column within the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    PartitionKey,
    ClusteringKey,
    Static,
    Regular,
}

impl ColumnKind {
    fn tag(self) -> u8 {
        match self {
            ColumnKind::PartitionKey => 0,
            ColumnKind::ClusteringKey => 1,
            ColumnKind::Static => 2,
            ColumnKind::Regular => 3,
        }
    }
}

/// A single column of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Position within the columns of the same kind.
    pub id: ColumnId,
    pub kind: ColumnKind,
    pub column_type: ColumnType,
}

impl ColumnDefinition {
    pub fn is_atomic(&self) -> bool {
        self.column_type.is_atomic()
    }
}

/// Digest of a schema's column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaVersion(pub u32);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Table schema as seen by the partition engine.
#[derive(Debug, Clone)]
pub struct Schema {
    keyspace: String,
    table: String,
    version: SchemaVersion,
    partition_key: Vec<ColumnDefinition>,
    clustering_key: Vec<ColumnDefinition>,
    static_columns: Vec<ColumnDefinition>,
    regular_columns: Vec<ColumnDefinition>,
    gc_grace_seconds: i64,
}

impl Schema {
    /// Start building a schema for `keyspace.table`.
    pub fn builder(keyspace: impl Into<String>, table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            keyspace: keyspace.into(),
            table: table.into(),
            columns: Vec::new(),
            gc_grace_seconds: DEFAULT_GC_GRACE_SECONDS,
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Seconds a tombstone must be kept before it may be purged.
    pub fn gc_grace_seconds(&self) -> i64 {
        self.gc_grace_seconds
    }

    /// Same layout and version with another grace period.
    pub fn with_gc_grace_seconds(mut self, seconds: i64) -> Self {
        self.gc_grace_seconds = seconds;
        self
    }

    pub fn partition_key_columns(&self) -> &[ColumnDefinition] {
        &self.partition_key
    }

    pub fn clustering_key_columns(&self) -> &[ColumnDefinition] {
        &self.clustering_key
    }

    pub fn clustering_key_size(&self) -> usize {
        self.clustering_key.len()
    }

    /// Type of the clustering component at `index`, if any.
    pub fn clustering_column_type(&self, index: usize) -> Option<&ColumnType> {
        self.clustering_key.get(index).map(|c| &c.column_type)
    }

    /// Columns of one kind, ordered by id.
    pub fn columns(&self, kind: ColumnKind) -> &[ColumnDefinition] {
        match kind {
            ColumnKind::PartitionKey => &self.partition_key,
            ColumnKind::ClusteringKey => &self.clustering_key,
            ColumnKind::Static => &self.static_columns,
            ColumnKind::Regular => &self.regular_columns,
        }
    }

    /// Look up a column by kind and id.
    pub fn column_at(&self, kind: ColumnKind, id: ColumnId) -> Result<&ColumnDefinition> {
        self.columns(kind)
            .get(id as usize)
            .ok_or(PartitionError::UnknownColumn { kind, id })
    }

    pub fn static_column_at(&self, id: ColumnId) -> Result<&ColumnDefinition> {
        self.column_at(ColumnKind::Static, id)
    }

    pub fn regular_column_at(&self, id: ColumnId) -> Result<&ColumnDefinition> {
        self.column_at(ColumnKind::Regular, id)
    }

    /// Find a column of any kind by name.
    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.partition_key
            .iter()
            .chain(&self.clustering_key)
            .chain(&self.static_columns)
            .chain(&self.regular_columns)
            .find(|c| c.name == name)
    }

    /// Fails with `SchemaVersionMismatch` if `other` has a different version.
    pub fn check_version(&self, other: &Schema) -> Result<()> {
        if self.version == other.version {
            Ok(())
        } else {
            Err(PartitionError::SchemaVersionMismatch {
                expected: self.version,
                found: other.version,
            })
        }
    }

    /// Map the columns of `self` onto `target` by name.
    pub fn column_mapping(&self, target: &Schema) -> Result<ColumnMapping> {
        ColumnMapping::between(self, target)
    }
}

/// Builder for [`Schema`]. Column ids are assigned per kind in insertion order.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    keyspace: String,
    table: String,
    columns: Vec<(String, ColumnType, ColumnKind)>,
    gc_grace_seconds: i64,
}

impl SchemaBuilder {
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        kind: ColumnKind,
    ) -> Self {
        self.columns.push((name.into(), column_type, kind));
        self
    }

    pub fn with_gc_grace_seconds(mut self, seconds: i64) -> Self {
        self.gc_grace_seconds = seconds;
        self
    }

    pub fn build(self) -> Schema {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.keyspace.as_bytes());
        hasher.update(self.table.as_bytes());

        let mut schema = Schema {
            keyspace: self.keyspace,
            table: self.table,
            version: SchemaVersion(0),
            partition_key: Vec::new(),
            clustering_key: Vec::new(),
            static_columns: Vec::new(),
            regular_columns: Vec::new(),
            gc_grace_seconds: self.gc_grace_seconds,
        };

        for (name, column_type, kind) in self.columns {
            hasher.update(&[kind.tag()]);
            hasher.update(name.as_bytes());
            hasher.update(format!("{:?}", column_type).as_bytes());

            let target = match kind {
                ColumnKind::PartitionKey => &mut schema.partition_key,
                ColumnKind::ClusteringKey => &mut schema.clustering_key,
                ColumnKind::Static => &mut schema.static_columns,
                ColumnKind::Regular => &mut schema.regular_columns,
            };
            target.push(ColumnDefinition {
                name,
                id: target.len() as ColumnId,
                kind,
                column_type,
            });
        }

        schema.version = SchemaVersion(hasher.finalize());
        schema
    }
}

/// Maps static and regular column ids of an old schema onto a new one.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    static_columns: Vec<Option<ColumnId>>,
    regular_columns: Vec<Option<ColumnId>>,
}

impl ColumnMapping {
    /// Build the mapping from `from` to `to`.
    ///
    /// Columns that were dropped, or whose type can no longer read the old
    /// values, map to `None`. A different clustering layout is not convertible.
    pub fn between(from: &Schema, to: &Schema) -> Result<Self> {
        let same_clustering = from.clustering_key.len() == to.clustering_key.len()
            && from
                .clustering_key
                .iter()
                .zip(&to.clustering_key)
                .all(|(a, b)| a.column_type == b.column_type);
        if !same_clustering {
            return Err(PartitionError::IncompatibleSchema(format!(
                "clustering key of {}.{} changed between versions {} and {}",
                to.keyspace, to.table, from.version, to.version
            )));
        }

        let map_kind = |kind: ColumnKind| -> Vec<Option<ColumnId>> {
            from.columns(kind)
                .iter()
                .map(|old| {
                    to.columns(kind)
                        .iter()
                        .find(|new| {
                            new.name == old.name
                                && new.is_atomic() == old.is_atomic()
                                && new.column_type.is_value_compatible_with(&old.column_type)
                        })
                        .map(|new| new.id)
                })
                .collect()
        };

        Ok(Self {
            static_columns: map_kind(ColumnKind::Static),
            regular_columns: map_kind(ColumnKind::Regular),
        })
    }

    /// New id of an old column, or `None` if its cells must be dropped.
    pub fn map(&self, kind: ColumnKind, id: ColumnId) -> Option<ColumnId> {
        let ids = match kind {
            ColumnKind::Static => &self.static_columns,
            ColumnKind::Regular => &self.regular_columns,
            _ => return None,
        };
        ids.get(id as usize).copied().flatten()
    }
}
