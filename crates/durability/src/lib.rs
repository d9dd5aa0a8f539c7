//! Durable storage primitives: the per-shard write-ahead log (§4.2) and
//! the checkpoint manager (§4.3).

pub mod checkpoint;
pub mod format;
pub mod wal;

pub use format::{SegmentHeader, WalEntry, SEGMENT_FORMAT_VERSION, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC};
