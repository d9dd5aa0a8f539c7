//! Entropy/Load Monitor (spec §4.9): per-tick Shannon entropy and skew over
//! per-shard operation counts, used only to emit advisory events — it never
//! moves keys between shards at runtime (re-sharding is explicitly an
//! offline procedure per spec).

use std::sync::atomic::{AtomicU64, Ordering};
use warp_core::types::ShardId;

pub const ENTROPY_INTERVAL_MS: u64 = 1000;

/// Below this entropy, shard load is suspiciously concentrated on a few
/// shards; not a spec-fixed constant (spec names `H_LOW` without a default
/// value), chosen here as this implementation's tuning default (see
/// DESIGN.md).
pub const H_LOW: f64 = 1.0;
/// Above this `max_load / mean_load` ratio, load is skewed enough to
/// warrant an advisory (same status as `H_LOW` above).
pub const SKEW_HIGH: f64 = 2.0;

/// One tick's computed load distribution.
#[derive(Debug, Clone)]
pub struct EntropySample {
    pub entropy: f64,
    pub skew: f64,
    pub per_shard_ops: Vec<u64>,
    pub low_entropy: bool,
    pub high_skew: bool,
}

/// Tracks per-shard operation counts between ticks and computes the
/// distribution metrics on demand.
pub struct EntropyMonitor {
    shard_ops: Vec<AtomicU64>,
}

impl EntropyMonitor {
    pub fn new(num_shards: u32) -> Self {
        let mut shard_ops = Vec::with_capacity(num_shards as usize);
        shard_ops.resize_with(num_shards as usize, || AtomicU64::new(0));
        Self { shard_ops }
    }

    /// Record one operation against `shard_id`, called from the hot path
    /// on every `put`/`get`/`delete`/`quantum_get` fetch.
    pub fn record_op(&self, shard_id: ShardId) {
        self.shard_ops[shard_id as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Compute Shannon entropy and skew over ops observed since the last
    /// tick, then reset the per-shard counters for the next interval.
    pub fn tick(&self) -> EntropySample {
        let per_shard_ops: Vec<u64> = self.shard_ops.iter().map(|c| c.swap(0, Ordering::Relaxed)).collect();
        let total: u64 = per_shard_ops.iter().sum();

        let entropy = if total == 0 {
            0.0
        } else {
            -per_shard_ops
                .iter()
                .filter(|&&ops| ops > 0)
                .map(|&ops| {
                    let p = ops as f64 / total as f64;
                    p * p.log2()
                })
                .sum::<f64>()
        };

        let num_shards = per_shard_ops.len().max(1) as f64;
        let mean_load = total as f64 / num_shards;
        let max_load = per_shard_ops.iter().copied().max().unwrap_or(0) as f64;
        let skew = if mean_load > 0.0 { max_load / mean_load } else { 0.0 };

        let low_entropy = total > 0 && entropy < H_LOW;
        let high_skew = skew > SKEW_HIGH;
        if low_entropy {
            tracing::warn!(target: "warp::entropy", entropy, h_low = H_LOW, "shard load entropy below threshold");
        }
        if high_skew {
            tracing::warn!(target: "warp::entropy", skew, skew_high = SKEW_HIGH, "shard load skew above threshold");
        }

        EntropySample {
            entropy,
            skew,
            per_shard_ops,
            low_entropy,
            high_skew,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_load_has_max_entropy() {
        let monitor = EntropyMonitor::new(4);
        for shard in 0..4 {
            for _ in 0..100 {
                monitor.record_op(shard);
            }
        }
        let sample = monitor.tick();
        assert!((sample.entropy - 2.0).abs() < 1e-9); // log2(4) == 2
        assert!((sample.skew - 1.0).abs() < 1e-9);
        assert!(!sample.low_entropy);
        assert!(!sample.high_skew);
    }

    #[test]
    fn all_load_on_one_shard_is_zero_entropy_and_flagged() {
        let monitor = EntropyMonitor::new(4);
        for _ in 0..100 {
            monitor.record_op(0);
        }
        let sample = monitor.tick();
        assert_eq!(sample.entropy, 0.0);
        assert!(sample.low_entropy);
        assert!(sample.high_skew);
    }

    #[test]
    fn tick_resets_counts() {
        let monitor = EntropyMonitor::new(2);
        monitor.record_op(0);
        monitor.tick();
        let sample = monitor.tick();
        assert_eq!(sample.per_shard_ops, vec![0, 0]);
    }

    #[test]
    fn no_ops_yields_zero_entropy_without_flagging_low() {
        let monitor = EntropyMonitor::new(3);
        let sample = monitor.tick();
        assert_eq!(sample.entropy, 0.0);
        assert!(!sample.low_entropy);
    }
}
