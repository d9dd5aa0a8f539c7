//! Entanglement Index (§4.6) and Wormhole Graph (§4.7): the two advisory
//! relationship structures layered on top of storage. Neither holds
//! values — only keys and shard ids, per spec §3 "Ownership".

pub mod entanglement;
pub mod wormhole;

pub use entanglement::{EntanglementIndex, EntanglementPattern, Link};
pub use wormhole::{WormholeEdge, WormholeGraph};
