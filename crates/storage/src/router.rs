//! Router (spec §4.5): deterministic key → shard mapping plus shard
//! descriptors.
//!
//! `locate_candidates` needs to consult the Entanglement Index for related
//! keys, but the Entanglement Index is built on top of storage (it stores
//! keys and shard ids, nothing storage-specific). To keep the dependency
//! direction leaves-first, `Router` depends only on the
//! [`RelatedKeySource`] trait; `warp-graph`'s `EntanglementIndex`
//! implements it, and the engine coordinator wires the two together.

use warp_core::types::ShardId;
use warp_core::Key;
use xxhash_rust::xxh3::xxh3_64;

/// Consistency mode a shard defaults new writes to, absent an explicit
/// per-call override (spec §3 Shard Descriptor).
pub use warp_core::types::ConsistencyMode;

/// Static, per-shard configuration fixed at `open()`.
#[derive(Debug, Clone)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub max_capacity: usize,
    pub consistency_mode: ConsistencyMode,
    pub routing_weight: f64,
}

/// Implemented by the Entanglement Index; lets the Router ask "which
/// shards hold keys related to this one" without a hard dependency on the
/// graph crate.
pub trait RelatedKeySource {
    fn related_shards(&self, key: &Key, router: &Router) -> Vec<ShardId>;
}

/// Deterministic, restart-stable key → shard mapping.
#[derive(Debug, Clone)]
pub struct Router {
    descriptors: Vec<ShardDescriptor>,
}

impl Router {
    pub fn new(descriptors: Vec<ShardDescriptor>) -> Self {
        assert!(!descriptors.is_empty(), "router requires at least one shard");
        Self { descriptors }
    }

    pub fn num_shards(&self) -> u32 {
        self.descriptors.len() as u32
    }

    pub fn descriptor(&self, shard_id: ShardId) -> Option<&ShardDescriptor> {
        self.descriptors.get(shard_id as usize)
    }

    pub fn descriptors(&self) -> &[ShardDescriptor] {
        &self.descriptors
    }

    /// Primary shard for `key`: `hash64(key) mod N`.
    pub fn shard_of(&self, key: &Key) -> ShardId {
        (hash64(key.as_bytes()) % self.num_shards() as u64) as ShardId
    }

    /// Primary shard plus the shards owning keys entangled with `key`,
    /// used by `quantum_get` to fan out parallel fetches.
    pub fn locate_candidates(&self, key: &Key, related: &dyn RelatedKeySource) -> Vec<ShardId> {
        let primary = self.shard_of(key);
        let mut candidates = vec![primary];
        for shard in related.related_shards(key, self) {
            if !candidates.contains(&shard) {
                candidates.push(shard);
            }
        }
        candidates
    }
}

/// xxh3-64, the non-cryptographic hash the reference codebase standardizes
/// on for this purpose.
pub fn hash64(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(n: u32) -> Vec<ShardDescriptor> {
        (0..n)
            .map(|id| ShardDescriptor {
                shard_id: id,
                max_capacity: 1024,
                consistency_mode: ConsistencyMode::Eventual,
                routing_weight: 1.0,
            })
            .collect()
    }

    #[test]
    fn routing_is_deterministic() {
        let router = Router::new(descriptors(4));
        let key = Key::from("alpha");
        assert_eq!(router.shard_of(&key), router.shard_of(&key));
    }

    #[test]
    fn routing_stays_in_range() {
        let router = Router::new(descriptors(4));
        for i in 0..1000 {
            let key = Key::from(format!("key-{i}").as_str());
            assert!(router.shard_of(&key) < 4);
        }
    }

    struct NoRelations;
    impl RelatedKeySource for NoRelations {
        fn related_shards(&self, _key: &Key, _router: &Router) -> Vec<ShardId> {
            Vec::new()
        }
    }

    #[test]
    fn locate_candidates_includes_primary_when_no_relations() {
        let router = Router::new(descriptors(4));
        let key = Key::from("alpha");
        let candidates = router.locate_candidates(&key, &NoRelations);
        assert_eq!(candidates, vec![router.shard_of(&key)]);
    }
}
