//! Engine coordination: lifecycle state machine, background maintenance,
//! and the on-disk manifests that tie the storage, durability, cache, and
//! graph crates into one data root.

pub mod coordinator;
pub mod entropy;
pub mod manifest;
pub mod metrics;
pub mod recovery;
pub mod scheduler;

pub use coordinator::{
    DeleteOutcome, Engine, GetOutcome, PutOptions, PutOutcome, QuantumGetOptions, QuantumGetOutcome, ShardTarget,
};
pub use entropy::{EntropyMonitor, EntropySample};
pub use manifest::{EngineManifest, ENGINE_FORMAT_VERSION};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scheduler::{BackgroundScheduler, SchedulerStats, TaskPriority, Ticker, TickerContext};

pub use warp_core::config::EngineConfig;
pub use warp_core::{ConsistencyMode, Error, Key, Limits, Result, ShardId, Timestamp, Value};
