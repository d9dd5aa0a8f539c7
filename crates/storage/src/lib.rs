//! Shard-local storage: the Shard Store (§4.4) and the Router (§4.5).

pub mod router;
pub mod sharded;

pub use router::{hash64, RelatedKeySource, Router, ShardDescriptor};
pub use sharded::ShardStore;
