//! Cache Tiers (spec §4.8): four tiers L0 (hottest) .. L3 (coldest), each
//! independently capacity-bounded and sharded into `CACHE_STRIPES`
//! per-stripe locks to avoid a single global lock on the hot path — the
//! same "partition + lock" shape the reference codebase's sharded store
//! uses, applied to cache entries instead of table rows.
//!
//! The spec fixes `L0_MAX_ENTRY` (4 KiB) and `COMPRESS_THRESHOLD` (1 KiB)
//! explicitly but leaves promote/demote thresholds and per-tier decay
//! constants as open tuning knobs; the defaults below are this
//! implementation's choice (see DESIGN.md), not a literal spec value.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use warp_core::types::{now_us, Timestamp};
use warp_core::{Key, Value};
use xxhash_rust::xxh3::xxh3_64;

pub const CACHE_STRIPES: usize = 64;
pub const L0_MAX_ENTRY: usize = 4 * 1024;
pub const DEMOTE_THRESHOLD: f64 = 0.05;
pub const PROMOTE_THRESHOLD: f64 = 2.0;

/// One of the four cache tiers, fastest (L0) to slowest (L3) decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(clippy::upper_case_acronyms)]
pub enum Tier {
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

const TIERS: [Tier; 4] = [Tier::L0, Tier::L1, Tier::L2, Tier::L3];

impl Tier {
    fn index(self) -> usize {
        self as usize
    }

    fn above(self) -> Option<Tier> {
        match self {
            Tier::L0 => None,
            Tier::L1 => Some(Tier::L0),
            Tier::L2 => Some(Tier::L1),
            Tier::L3 => Some(Tier::L2),
        }
    }

    fn below(self) -> Option<Tier> {
        match self {
            Tier::L0 => Some(Tier::L1),
            Tier::L1 => Some(Tier::L2),
            Tier::L2 => Some(Tier::L3),
            Tier::L3 => None,
        }
    }

    /// Decay time constant; increases from L0 to L3 so colder tiers retain
    /// score longer before a given gap since last access erodes it.
    fn tau_us(self) -> f64 {
        match self {
            Tier::L0 => 1_000_000.0,
            Tier::L1 => 10_000_000.0,
            Tier::L2 => 60_000_000.0,
            Tier::L3 => 300_000_000.0,
        }
    }

    fn may_compress(self) -> bool {
        matches!(self, Tier::L2 | Tier::L3)
    }
}

struct CacheEntry {
    value: Value,
    compressed: bool,
    insert_us: Timestamp,
    last_access_us: Timestamp,
    hit_count: u64,
}

impl CacheEntry {
    /// `S(e) = hit_count * exp(-(now - last_access_us) / tau)`.
    fn score(&self, now: Timestamp, tau_us: f64) -> f64 {
        let age = (now.saturating_sub(self.last_access_us)) as f64;
        self.hit_count as f64 * (-age / tau_us).exp()
    }
}

struct Stripe {
    entries: RwLock<FxHashMap<Key, CacheEntry>>,
}

impl Default for Stripe {
    fn default() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }
}

struct TierStore {
    tier: Tier,
    stripes: Vec<Stripe>,
    capacity_bytes: usize,
}

impl TierStore {
    fn new(tier: Tier, capacity_bytes: usize) -> Self {
        let mut stripes = Vec::with_capacity(CACHE_STRIPES);
        stripes.resize_with(CACHE_STRIPES, Stripe::default);
        Self {
            tier,
            stripes,
            capacity_bytes,
        }
    }

    fn stripe_for(&self, key: &Key) -> &Stripe {
        let idx = (xxh3_64(key.as_bytes()) as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    fn approx_size_bytes(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.entries.read().values().map(|e| e.value.len()).sum::<usize>())
            .sum()
    }

    fn is_full(&self, incoming_bytes: usize) -> bool {
        self.approx_size_bytes() + incoming_bytes > self.capacity_bytes
    }

    fn evict_lowest_score(&self, now: Timestamp) -> Option<(Key, CacheEntry)> {
        let tau = self.tier.tau_us();
        let mut best: Option<(usize, Key, f64)> = None;
        for (idx, stripe) in self.stripes.iter().enumerate() {
            let guard = stripe.entries.read();
            if let Some((k, e)) = guard.iter().min_by(|(_, a), (_, b)| {
                a.score(now, tau).partial_cmp(&b.score(now, tau)).unwrap()
            }) {
                let s = e.score(now, tau);
                if best.as_ref().map(|(_, _, bs)| s < *bs).unwrap_or(true) {
                    best = Some((idx, k.clone(), s));
                }
            }
        }
        let (idx, key, _) = best?;
        let entry = self.stripes[idx].entries.write().remove(&key)?;
        Some((key, entry))
    }

    fn insert_raw(&self, key: Key, entry: CacheEntry) {
        self.stripe_for(&key).entries.write().insert(key, entry);
    }

    fn get(&self, key: &Key) -> Option<(Value, f64, bool)> {
        let stripe = self.stripe_for(key);
        let mut guard = stripe.entries.write();
        let entry = guard.get_mut(key)?;
        entry.last_access_us = now_us();
        entry.hit_count = entry.hit_count.saturating_add(1);
        let score = entry.score(entry.last_access_us, self.tier.tau_us());
        let was_top = matches!(self.tier, Tier::L0);
        Some((decompress_if_needed(entry), score, was_top))
    }

    fn remove(&self, key: &Key) -> Option<CacheEntry> {
        self.stripe_for(key).entries.write().remove(key)
    }
}

fn decompress_if_needed(entry: &CacheEntry) -> Value {
    if entry.compressed {
        match zstd::decode_all(entry.value.as_bytes()) {
            Ok(bytes) => Value::new(bytes),
            Err(_) => entry.value.clone(),
        }
    } else {
        entry.value.clone()
    }
}

/// The four-tier write-through cache.
pub struct Cache {
    tiers: [TierStore; 4],
    compress_threshold: usize,
}

impl Cache {
    pub fn new(tier_capacity_bytes: [usize; 4], compress_threshold: usize) -> Self {
        Self {
            tiers: [
                TierStore::new(Tier::L0, tier_capacity_bytes[0]),
                TierStore::new(Tier::L1, tier_capacity_bytes[1]),
                TierStore::new(Tier::L2, tier_capacity_bytes[2]),
                TierStore::new(Tier::L3, tier_capacity_bytes[3]),
            ],
            compress_threshold,
        }
    }

    /// Write-through insert: lands in L0 if small enough, else L1.
    /// Invalidates the key everywhere else first so stale tier copies
    /// never linger (spec invariant 3).
    pub fn put(&self, key: Key, value: Value) {
        self.invalidate(&key);
        let target = if value.len() < L0_MAX_ENTRY { Tier::L0 } else { Tier::L1 };
        self.insert_into(target, key, value);
    }

    fn insert_into(&self, tier: Tier, key: Key, value: Value) {
        let now = now_us();
        let store = &self.tiers[tier.index()];
        let incoming_bytes = value.len();

        if store.is_full(incoming_bytes) {
            if let Some((evicted_key, evicted_entry)) = store.evict_lowest_score(now) {
                let score = evicted_entry.score(now, tier.tau_us());
                if score > DEMOTE_THRESHOLD {
                    if let Some(lower) = tier.below() {
                        let value = decompress_if_needed(&evicted_entry);
                        tracing::trace!(target: "warp::cache", tier = ?tier, "demoting entry to lower tier");
                        self.insert_into(lower, evicted_key, value);
                    }
                } else {
                    tracing::trace!(target: "warp::cache", tier = ?tier, "dropping cold entry under eviction pressure");
                }
            }
        }

        let (stored_value, compressed) = if tier.may_compress() && value.len() >= self.compress_threshold {
            match zstd::encode_all(value.as_bytes(), 1) {
                Ok(bytes) => (Value::new(bytes), true),
                Err(_) => (value, false),
            }
        } else {
            (value, false)
        };

        store.insert_raw(
            key,
            CacheEntry {
                value: stored_value,
                compressed,
                insert_us: now,
                last_access_us: now,
                hit_count: 1,
            },
        );
    }

    /// Look up a key, checking L0 through L3 in order. On a hit below L0,
    /// the entry may be promoted one tier if its score clears the
    /// tier-above's promote threshold.
    pub fn get(&self, key: &Key) -> Option<Value> {
        for tier in TIERS {
            let store = &self.tiers[tier.index()];
            if let Some((value, score, _)) = store.get(key) {
                if let Some(above) = tier.above() {
                    if score > PROMOTE_THRESHOLD {
                        if let Some(entry) = store.remove(key) {
                            tracing::trace!(target: "warp::cache", from = ?tier, to = ?above, "promoting hot entry");
                            self.insert_into(above, key.clone(), decompress_if_needed(&entry));
                        }
                    }
                }
                return Some(value);
            }
        }
        None
    }

    /// Remove a key from every tier (mandatory on `delete`, spec §4.8).
    pub fn invalidate(&self, key: &Key) {
        for tier in TIERS {
            self.tiers[tier.index()].remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> Cache {
        Cache::new([1024, 1024, 1024, 1024], 64)
    }

    #[test]
    fn put_then_get_hits() {
        let cache = small_cache();
        cache.put(Key::from("a"), Value::from("hello"));
        assert_eq!(cache.get(&Key::from("a")), Some(Value::from("hello")));
    }

    #[test]
    fn invalidate_removes_from_all_tiers() {
        let cache = small_cache();
        cache.put(Key::from("a"), Value::from("hello"));
        cache.invalidate(&Key::from("a"));
        assert!(cache.get(&Key::from("a")).is_none());
    }

    #[test]
    fn large_value_lands_outside_l0() {
        let cache = small_cache();
        let big = Value::new(vec![b'x'; L0_MAX_ENTRY + 1]);
        cache.put(Key::from("big"), big.clone());
        assert_eq!(cache.get(&Key::from("big")), Some(big));
    }

    #[test]
    fn compressible_value_round_trips_through_l2() {
        let cache = small_cache();
        let value = Value::new(vec![b'y'; 200]);
        cache.insert_into(Tier::L2, Key::from("k"), value.clone());
        assert_eq!(cache.get(&Key::from("k")), Some(value));
    }
}
