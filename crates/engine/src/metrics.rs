//! Metrics registry (spec §4.10 `metrics()`, §5 "the only globally-visible
//! mutable state is the engine lifecycle flag and the metrics registry
//! (both atomic)"). Counters use `Relaxed` ordering per spec §9's guidance
//! on "ultra-fast atomic counters" — nothing here gates visibility of
//! other state, it is purely observational.

use std::sync::atomic::{AtomicU64, Ordering};
use warp_core::types::EngineState;

/// Live counters updated from the hot path and background workers.
#[derive(Default)]
pub struct MetricsRegistry {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    not_found: AtomicU64,
    quantum_gets: AtomicU64,
    quantum_get_misses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    corrupt_tail_count: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoints_failed: AtomicU64,
    low_entropy_events: AtomicU64,
    high_skew_events: AtomicU64,
    entropy_bits: AtomicU64,
    skew_bits: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self, found: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if !found {
            self.not_found.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quantum_get(&self, misses: u64) {
        self.quantum_gets.fetch_add(1, Ordering::Relaxed);
        self.quantum_get_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_tail(&self) {
        self.corrupt_tail_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_written(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failed(&self) {
        self.checkpoints_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entropy_sample(&self, entropy: f64, skew: f64, low_entropy: bool, high_skew: bool) {
        self.entropy_bits.store(entropy.to_bits(), Ordering::Relaxed);
        self.skew_bits.store(skew.to_bits(), Ordering::Relaxed);
        if low_entropy {
            self.low_entropy_events.fetch_add(1, Ordering::Relaxed);
        }
        if high_skew {
            self.high_skew_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, state: EngineState, per_shard_table_len: Vec<usize>, entanglement_link_count: usize, wormhole_edge_count: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            state,
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            quantum_gets: self.quantum_gets.load(Ordering::Relaxed),
            quantum_get_misses: self.quantum_get_misses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            corrupt_tail_count: self.corrupt_tail_count.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoints_failed: self.checkpoints_failed.load(Ordering::Relaxed),
            low_entropy_events: self.low_entropy_events.load(Ordering::Relaxed),
            high_skew_events: self.high_skew_events.load(Ordering::Relaxed),
            entropy: f64::from_bits(self.entropy_bits.load(Ordering::Relaxed)),
            skew: f64::from_bits(self.skew_bits.load(Ordering::Relaxed)),
            per_shard_table_len,
            entanglement_link_count,
            wormhole_edge_count,
        }
    }
}

/// Point-in-time snapshot returned by `Engine::metrics()`.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub state: EngineState,
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub not_found: u64,
    pub quantum_gets: u64,
    pub quantum_get_misses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub corrupt_tail_count: u64,
    pub checkpoints_written: u64,
    pub checkpoints_failed: u64,
    pub low_entropy_events: u64,
    pub high_skew_events: u64,
    pub entropy: f64,
    pub skew: f64,
    pub per_shard_table_len: Vec<usize>,
    pub entanglement_link_count: usize,
    pub wormhole_edge_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.record_put();
        metrics.record_get(true);
        metrics.record_get(false);
        let snap = metrics.snapshot(EngineState::Ready, vec![], 0, 0);
        assert_eq!(snap.puts, 1);
        assert_eq!(snap.gets, 2);
        assert_eq!(snap.not_found, 1);
    }

    #[test]
    fn entropy_sample_records_events() {
        let metrics = MetricsRegistry::new();
        metrics.record_entropy_sample(0.1, 5.0, true, true);
        let snap = metrics.snapshot(EngineState::Ready, vec![], 0, 0);
        assert_eq!(snap.low_entropy_events, 1);
        assert_eq!(snap.high_skew_events, 1);
        assert!((snap.entropy - 0.1).abs() < 1e-9);
    }
}
