//! OBLIVION - Core Type Definitions
//! Defines fundamental types used across the partition engine.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Partition key type.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Cell value type. `Bytes` keeps structural copies of a partition cheap.
pub type Value = Bytes;

/// Write timestamp (microseconds since the Unix epoch).
pub type Timestamp = i64;

/// GC clock time point (seconds since the Unix epoch).
/// Used for deletion times, expiry times and the GC horizon.
pub type GcTime = i64;

/// Column identifier, scoped to a column kind (static or regular).
pub type ColumnId = u32;

/// Timestamp of a tombstone or marker that was never written.
pub const MISSING_TIMESTAMP: Timestamp = i64::MIN;

/// Current write timestamp in microseconds.
pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as Timestamp
}

/// Current GC clock time in seconds.
pub fn gc_clock_now() -> GcTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as GcTime
}

/// Big-endian encoding of an `Int32` value, as stored in keys and cells.
pub fn int32(v: i32) -> Value {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

/// Big-endian encoding of a `BigInt` value.
pub fn bigint(v: i64) -> Value {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

/// UTF-8 encoding of a `Text` value.
pub fn text(v: &str) -> Value {
    Bytes::copy_from_slice(v.as_bytes())
}
