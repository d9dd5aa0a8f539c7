//! Per-shard WAL configuration.

use super::mode::FlushPolicy;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate to a new segment once the active one exceeds this size.
    pub segment_max_bytes: u64,
    /// Appends fail with `Backpressure` once the unflushed ring exceeds
    /// this many bytes.
    pub max_unflushed_bytes: u64,
    pub flush_policy: FlushPolicy,
    /// Bound on the forward resync scan after a checksum mismatch during
    /// replay (spec's recovery-time corruption handling).
    pub max_recovery_scan_window: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 64 * 1024 * 1024,
            max_unflushed_bytes: 16 * 1024 * 1024,
            flush_policy: FlushPolicy::default(),
            max_recovery_scan_window: 1024 * 1024,
        }
    }
}

impl WalConfig {
    pub fn for_testing() -> Self {
        Self {
            segment_max_bytes: 64 * 1024,
            max_unflushed_bytes: 16 * 1024,
            flush_policy: FlushPolicy::Interval { interval_ms: 5 },
            max_recovery_scan_window: 64 * 1024,
        }
    }

    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.segment_max_bytes == 0 {
            return Err(WalConfigError::Invalid("segment_max_bytes must be > 0".into()));
        }
        if self.max_unflushed_bytes == 0 {
            return Err(WalConfigError::Invalid("max_unflushed_bytes must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WalConfigError {
    #[error("invalid wal config: {0}")]
    Invalid(String),
}
