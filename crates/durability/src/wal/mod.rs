//! Per-shard write-ahead log: segment-based, self-delimiting records,
//! crash-tolerant replay (spec §4.2).

pub mod config;
pub mod mode;
pub mod reader;
pub mod writer;

pub use config::{WalConfig, WalConfigError};
pub use mode::FlushPolicy;
pub use reader::{read_all, replay, read_segment, ReadStopReason, SegmentReadResult};
pub use writer::WalWriter;
