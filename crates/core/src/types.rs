//! Small shared value types: shard identifiers, timestamps, consistency
//! modes, and WAL operation/sequence types.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one of the `N` shards fixed at `open()`.
pub type ShardId = u32;

/// Microseconds since the Unix epoch. Monotonic only within a single
/// process run; used for ordering within a shard, not as a wall-clock
/// guarantee.
pub type Timestamp = u64;

/// Per-shard monotonic WAL sequence number.
pub type Sequence = u64;

/// Read current wall-clock time as microseconds since the Unix epoch.
pub fn now_us() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros() as u64
}

/// Per-operation durability requirement, selectable per `put` and frozen
/// per shard descriptor as a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyMode {
    /// Write returns only after the WAL flush covering its sequence
    /// completes.
    Strong,
    /// Write returns after append; background flush provides durability
    /// within `flush_interval_ms`.
    Eventual,
    /// Write returns after the in-memory insert; WAL append is queued.
    Weak,
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        ConsistencyMode::Eventual
    }
}

/// The mutation kinds recorded in the WAL (spec §3 WAL Entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Put,
    Delete,
    Link,
    Unlink,
}

/// Engine lifecycle state (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    Opening,
    Recovering,
    Ready,
    Draining,
}

impl EngineState {
    pub fn accepts_writes(self) -> bool {
        matches!(self, EngineState::Ready)
    }

    pub fn accepts_reads(self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Draining)
    }
}
