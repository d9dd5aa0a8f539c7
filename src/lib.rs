//! WarpEngine: an embedded, single-node key-value storage engine with
//! sharding, entanglement-linked reads, wormhole-routed cache warming, and
//! an entropy-driven load monitor.
//!
//! This crate re-exports the public surface assembled by `warp-engine` and
//! its dependency crates. Everything an embedder needs — `Engine::open`,
//! the option/outcome types for each call, and the shared configuration
//! and error types — is reachable from the crate root.

pub use warp_engine::{
    ConsistencyMode, DeleteOutcome, Engine, EngineConfig, Error, GetOutcome, Key, Limits, MetricsSnapshot,
    PutOptions, PutOutcome, QuantumGetOptions, QuantumGetOutcome, Result, ShardId, ShardTarget, Timestamp, Value,
};
