//! The opaque value type and per-record metadata (spec §3, §9 "dynamic
//! typing of values in the source"). The engine never inspects value
//! bytes; typing is the caller's responsibility.

use crate::types::{ShardId, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// An opaque byte string. Cheap to clone: the engine passes `Value`
/// through the cache, the WAL encoder, and shard tables without copying
/// the backing buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Value(Arc<[u8]>);

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(Value(Arc::from(bytes)))
    }
}

impl Value {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Value(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value({} bytes)", self.0.len())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::new(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::new(v)
    }
}

/// Small interned-ish tag; kept as `String` since the spec does not define
/// an interning table and tag sets are expected to stay small per record.
pub type Tag = String;

/// Per-key metadata maintained alongside the value (spec §3 "Record
/// Metadata"). `access_counter` saturates at `2^63 - 1` rather than
/// wrapping so a long-lived hot key never rolls over into "cold"
/// territory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub shard_id: ShardId,
    pub insert_us: Timestamp,
    pub last_access_us: Timestamp,
    pub access_counter: u64,
    pub tags: Vec<Tag>,
}

/// `access_counter`'s ceiling: `2^63 - 1`.
const ACCESS_COUNTER_MAX: u64 = (1u64 << 63) - 1;

impl RecordMeta {
    pub fn new(shard_id: ShardId, now_us: Timestamp) -> Self {
        Self {
            shard_id,
            insert_us: now_us,
            last_access_us: now_us,
            access_counter: 0,
            tags: Vec::new(),
        }
    }

    /// Record an access: bump `last_access_us` and saturate the counter.
    pub fn touch(&mut self, now_us: Timestamp) {
        self.last_access_us = now_us;
        self.access_counter = self.access_counter.saturating_add(1).min(ACCESS_COUNTER_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_access_time_and_counter() {
        let mut meta = RecordMeta::new(3, 100);
        assert_eq!(meta.access_counter, 0);
        meta.touch(200);
        assert_eq!(meta.last_access_us, 200);
        assert_eq!(meta.access_counter, 1);
    }

    #[test]
    fn access_counter_saturates() {
        let mut meta = RecordMeta::new(0, 0);
        meta.access_counter = ACCESS_COUNTER_MAX;
        meta.touch(1);
        assert_eq!(meta.access_counter, ACCESS_COUNTER_MAX);
    }

    #[test]
    fn value_round_trips_bytes() {
        let v = Value::from("hello");
        assert_eq!(v.as_bytes(), b"hello");
        assert_eq!(v.len(), 5);
    }
}
