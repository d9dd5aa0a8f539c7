//! Wormhole Graph (spec §4.7): a purely advisory, weighted directed graph
//! over shard ids, learned from observed read cooccurrence and used to
//! suggest single-hop prefetch targets. Never persisted in the WAL —
//! losing it only degrades prefetch quality, never durability.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use warp_core::types::{now_us, ShardId, Timestamp};
use warp_core::Error;

pub const W_MAX: f64 = 10.0;
pub const W_MIN: f64 = 0.01;
pub const LEARNING_RATE: f64 = 1.0;
pub const WORMHOLE_DECAY: f64 = 0.99;
pub const PREFETCH_THRESHOLD: f64 = 0.5;
pub const DEFAULT_PREFETCH_K: usize = 3;

const SNAPSHOT_MAGIC: &[u8; 4] = b"WHG1";

/// One directed edge `from_shard -> to_shard` (spec §3 "Wormhole Edge").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WormholeEdge {
    pub from_shard: ShardId,
    pub to_shard: ShardId,
    pub weight: f64,
    pub hit_count: u64,
    pub last_used_us: Timestamp,
}

/// Read-mostly shard-to-shard routing graph, rebuilt from cooccurrence
/// events if its on-disk snapshot is lost.
pub struct WormholeGraph {
    edges: RwLock<FxHashMap<(ShardId, ShardId), WormholeEdge>>,
}

impl Default for WormholeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WormholeGraph {
    pub fn new() -> Self {
        Self {
            edges: RwLock::new(FxHashMap::default()),
        }
    }

    /// Record that a request reading `from_shard` was followed by reads of
    /// `to_shards` (spec §4.10 step 4, fed from `quantum_get`).
    pub fn record_cooccurrence(&self, from_shard: ShardId, to_shards: &[ShardId]) {
        if to_shards.is_empty() {
            return;
        }
        let now = now_us();
        let mut edges = self.edges.write();
        for &to_shard in to_shards {
            if to_shard == from_shard {
                continue;
            }
            let edge = edges.entry((from_shard, to_shard)).or_insert(WormholeEdge {
                from_shard,
                to_shard,
                weight: 0.0,
                hit_count: 0,
                last_used_us: now,
            });
            edge.weight = (edge.weight + LEARNING_RATE).min(W_MAX);
            edge.hit_count += 1;
            edge.last_used_us = now;
        }
    }

    /// Top-`k` shards reachable from `from_shard` by weight descending,
    /// only returned if the strongest candidate clears
    /// `PREFETCH_THRESHOLD`; otherwise prefetch is not worth the I/O.
    pub fn suggest_prefetch(&self, from_shard: ShardId) -> Vec<ShardId> {
        self.suggest_prefetch_k(from_shard, DEFAULT_PREFETCH_K)
    }

    pub fn suggest_prefetch_k(&self, from_shard: ShardId, k: usize) -> Vec<ShardId> {
        let edges = self.edges.read();
        let mut candidates: Vec<&WormholeEdge> = edges
            .values()
            .filter(|e| e.from_shard == from_shard)
            .collect();
        candidates.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap());
        if candidates.first().map(|e| e.weight).unwrap_or(0.0) < PREFETCH_THRESHOLD {
            return Vec::new();
        }
        candidates.into_iter().take(k).map(|e| e.to_shard).collect()
    }

    /// Single-hop advisory route for visualization/metrics only — never a
    /// transport. Multi-hop routing is explicitly out of scope (spec §9).
    pub fn route_hint(&self, from_shard: ShardId, to_shard: ShardId) -> Vec<ShardId> {
        if from_shard == to_shard {
            vec![from_shard]
        } else {
            vec![from_shard, to_shard]
        }
    }

    /// Multiplicative decay run on each scheduler tick; edges below
    /// `W_MIN` are garbage collected (spec invariant 6).
    pub fn decay_tick(&self) {
        let mut edges = self.edges.write();
        edges.retain(|_, edge| {
            edge.weight *= WORMHOLE_DECAY;
            edge.weight >= W_MIN
        });
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().len()
    }

    pub fn edges_snapshot(&self) -> Vec<WormholeEdge> {
        self.edges.read().values().copied().collect()
    }

    /// Write the compact binary snapshot described in spec §6
    /// (`wormholes/graph.bin`), on the scheduler's
    /// `WORMHOLE_SNAPSHOT_INTERVAL_S` cadence.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let edges = self.edges_snapshot();
        let mut buf = Vec::with_capacity(4 + 4 + edges.len() * 28);
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.write_u32::<LittleEndian>(edges.len() as u32)?;
        for edge in &edges {
            buf.write_u32::<LittleEndian>(edge.from_shard)?;
            buf.write_u32::<LittleEndian>(edge.to_shard)?;
            buf.write_f64::<LittleEndian>(edge.weight)?;
            buf.write_u64::<LittleEndian>(edge.hit_count)?;
            buf.write_u64::<LittleEndian>(edge.last_used_us)?;
        }

        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Load a previously saved snapshot. A missing or corrupt file is not
    /// an error — the graph simply starts empty and re-learns from
    /// cooccurrence (spec §4.7 "Loss of this file degrades performance
    /// only").
    pub fn load(path: &Path) -> Self {
        let graph = Self::new();
        let Ok(bytes) = fs::read(path) else {
            return graph;
        };
        if let Err(e) = graph.load_bytes(&bytes) {
            tracing::warn!(target: "warp::wormhole", error = %e, "wormhole snapshot unreadable, starting empty");
            graph.edges.write().clear();
        }
        graph
    }

    fn load_bytes(&self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() < 8 || &bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(Error::CorruptRecord {
                message: "bad wormhole snapshot magic".into(),
            });
        }
        let mut cursor = Cursor::new(&bytes[4..]);
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut edges = FxHashMap::default();
        for _ in 0..count {
            let from_shard = cursor.read_u32::<LittleEndian>()?;
            let to_shard = cursor.read_u32::<LittleEndian>()?;
            let weight = cursor.read_f64::<LittleEndian>()?;
            let hit_count = cursor.read_u64::<LittleEndian>()?;
            let last_used_us = cursor.read_u64::<LittleEndian>()?;
            edges.insert(
                (from_shard, to_shard),
                WormholeEdge {
                    from_shard,
                    to_shard,
                    weight,
                    hit_count,
                    last_used_us,
                },
            );
        }
        *self.edges.write() = edges;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cooccurrence_builds_weight_toward_threshold() {
        let graph = WormholeGraph::new();
        assert!(graph.suggest_prefetch(0).is_empty());
        for _ in 0..1 {
            graph.record_cooccurrence(0, &[1]);
        }
        // one observation alone (weight 1.0) already clears 0.5 threshold
        assert_eq!(graph.suggest_prefetch(0), vec![1]);
    }

    #[test]
    fn self_loop_is_never_recorded() {
        let graph = WormholeGraph::new();
        graph.record_cooccurrence(0, &[0]);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn decay_eventually_garbage_collects_cold_edges() {
        let graph = WormholeGraph::new();
        graph.record_cooccurrence(0, &[1]);
        for _ in 0..2000 {
            graph.decay_tick();
        }
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn route_hint_is_single_hop() {
        let graph = WormholeGraph::new();
        assert_eq!(graph.route_hint(2, 2), vec![2]);
        assert_eq!(graph.route_hint(2, 5), vec![2, 5]);
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.bin");
        let graph = WormholeGraph::new();
        graph.record_cooccurrence(0, &[1, 2]);
        graph.save(&path).unwrap();

        let loaded = WormholeGraph::load(&path);
        assert_eq!(loaded.edge_count(), 2);
    }

    #[test]
    fn missing_snapshot_loads_empty_without_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.bin");
        let loaded = WormholeGraph::load(&path);
        assert_eq!(loaded.edge_count(), 0);
    }

    #[test]
    fn weight_saturates_at_w_max() {
        let graph = WormholeGraph::new();
        for _ in 0..100 {
            graph.record_cooccurrence(0, &[1]);
        }
        let edges = graph.edges_snapshot();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].weight <= W_MAX);
    }
}
