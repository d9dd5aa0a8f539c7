//! Flush policy selectable per `WalWriter::flush` call (spec §4.2).

/// When a flush should fsync the active segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    /// fsync on every append. Off by default; used by `strong` consistency
    /// writes that need a synchronous durability point.
    EveryWrite,
    /// fsync at most once per `interval_ms`, batching writes since the
    /// last sync into a single syscall.
    Interval { interval_ms: u64 },
    /// fsync once `bytes_since_sync` crosses `WAL_MAX_UNFLUSHED_BYTES`.
    OnBufferFull { max_unflushed_bytes: u64 },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::Interval { interval_ms: 10 }
    }
}
