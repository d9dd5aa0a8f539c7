//! Multi-tier cache (spec §4.8).

pub mod tiers;

pub use tiers::{Cache, Tier, CACHE_STRIPES, L0_MAX_ENTRY};
