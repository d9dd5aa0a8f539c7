//! Error taxonomy for WarpEngine.
//!
//! A single flat enum carries every error kind described in spec §7. Each
//! variant carries the structured context (shard, key, message) that the
//! "no silent partial success" contract requires callers be able to inspect.

use crate::types::ShardId;
use thiserror::Error;

/// The one error type threaded through every WarpEngine crate.
#[derive(Debug, Error)]
pub enum Error {
    /// No record exists for the requested key.
    #[error("key not found")]
    NotFound,

    /// A bounded buffer (WAL ring, scheduler queue) is full; retry after
    /// backoff.
    #[error("backpressure on shard {shard_id:?}: {message}")]
    Backpressure {
        shard_id: Option<ShardId>,
        message: String,
    },

    /// Shard table is at `max_capacity` and running in `strong` consistency
    /// mode, so eviction is disallowed.
    #[error("shard {shard_id:?} at capacity")]
    CapacityExceeded { shard_id: ShardId },

    /// Shard was marked read-only after a hot-path I/O failure.
    #[error("shard {shard_id:?} is read-only: {message}")]
    ShardReadOnly { shard_id: ShardId, message: String },

    /// Shard (or the whole engine) is draining or closed.
    #[error("shard {shard_id:?} is closed")]
    ShardClosed { shard_id: Option<ShardId> },

    /// WAL or checkpoint record failed CRC validation. Surfaced only via
    /// metrics on the recovery path; surfaced as an error on direct decode.
    #[error("corrupt record: {message}")]
    CorruptRecord { message: String },

    /// Propagated I/O failure from the WAL or checkpoint writer.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// A call arrived while the engine was still in `Recovering`.
    #[error("recovery in progress")]
    RecoveryInProgress,

    /// A caller-supplied argument failed validation (bad key length, bad
    /// config, out-of-range strength, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Value or metadata failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Errors that a caller should retry after a short backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Backpressure { .. } | Error::RecoveryInProgress
        )
    }

    pub fn shard_id(&self) -> Option<ShardId> {
        match self {
            Error::Backpressure { shard_id, .. } => *shard_id,
            Error::CapacityExceeded { shard_id } => Some(*shard_id),
            Error::ShardReadOnly { shard_id, .. } => Some(*shard_id),
            Error::ShardClosed { shard_id } => *shard_id,
            _ => None,
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
