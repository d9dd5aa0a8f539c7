//! Entanglement Index (spec §4.6): `from_key -> set of (to_key, strength)`
//! with O(1) average insert/lookup, sharded by hash of `from_key` into
//! `INDEX_STRIPES` independent maps — the same partition-plus-lock shape
//! `warp-cache`'s tier stripes use, applied to relationship edges instead
//! of cached values.
//!
//! The index itself holds only keys and shard ids (spec §3 Ownership); it
//! never touches value bytes. Durability is not this module's job: the
//! WAL write for `link`/`unlink` goes through the `from` key's shard
//! (`warp_storage::ShardStore::append_link`/`append_unlink`), and
//! recovery replays those WAL entries back through [`EntanglementIndex::apply_wal_entry`].

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use warp_core::types::{now_us, Timestamp, WalOp};
use warp_core::Key;
use warp_durability::WalEntry;
use warp_storage::{RelatedKeySource, Router};

pub const INDEX_STRIPES: usize = 32;
pub const LINK_FLOOR: f32 = 0.05;
pub const MAX_NEIGHBORS: usize = 32;
pub const REINFORCEMENT: f32 = 0.05;
pub const DECAY: f32 = 0.995;

/// A directed, weighted edge from one key to another (spec §3
/// "Entanglement Link").
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub to: Key,
    pub strength: f32,
    pub last_reinforced_us: Timestamp,
}

/// Auto-linking rule applied at insert time (spec §3 "Entanglement
/// Pattern"). `target_glob_template` and `trigger_glob` each carry at
/// most one `*` wildcard; the substring the wildcard captures in
/// `trigger_glob` is substituted into the matching `*` in the template.
#[derive(Debug, Clone)]
pub struct EntanglementPattern {
    pub trigger_glob: String,
    pub target_glob_template: String,
    pub default_strength: f32,
}

impl EntanglementPattern {
    /// If `key` matches `trigger_glob`, return the `to_key` produced by
    /// substituting the captured wildcard span into `target_glob_template`.
    fn apply(&self, key: &str) -> Option<String> {
        let captured = capture(&self.trigger_glob, key)?;
        Some(substitute(&self.target_glob_template, captured.as_deref()))
    }
}

/// Match `pattern` (at most one `*`) against `text`, returning the
/// substring the wildcard captured (or `None` if the pattern has no
/// wildcard and matched exactly).
fn capture<'a>(pattern: &str, text: &'a str) -> Option<Option<&'a str>> {
    match pattern.find('*') {
        None => (pattern == text).then_some(None),
        Some(star) => {
            let prefix = &pattern[..star];
            let suffix = &pattern[star + 1..];
            if text.len() < prefix.len() + suffix.len() {
                return None;
            }
            if !text.starts_with(prefix) || !text.ends_with(suffix) {
                return None;
            }
            Some(Some(&text[prefix.len()..text.len() - suffix.len()]))
        }
    }
}

fn substitute(template: &str, captured: Option<&str>) -> String {
    match (template.find('*'), captured) {
        (Some(star), Some(captured)) => {
            format!("{}{}{}", &template[..star], captured, &template[star + 1..])
        }
        _ => template.to_string(),
    }
}

struct Stripe {
    edges: RwLock<FxHashMap<Key, Vec<Link>>>,
}

impl Default for Stripe {
    fn default() -> Self {
        Self {
            edges: RwLock::new(FxHashMap::default()),
        }
    }
}

/// Sharded `from_key -> [Link]` index plus the pattern list applied at
/// insert time.
pub struct EntanglementIndex {
    stripes: Vec<Stripe>,
    patterns: RwLock<Vec<EntanglementPattern>>,
}

impl Default for EntanglementIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EntanglementIndex {
    pub fn new() -> Self {
        let mut stripes = Vec::with_capacity(INDEX_STRIPES);
        stripes.resize_with(INDEX_STRIPES, Stripe::default);
        Self {
            stripes,
            patterns: RwLock::new(Vec::new()),
        }
    }

    pub fn with_patterns(patterns: Vec<EntanglementPattern>) -> Self {
        let index = Self::new();
        *index.patterns.write() = patterns;
        index
    }

    pub fn add_pattern(&self, pattern: EntanglementPattern) {
        self.patterns.write().push(pattern);
    }

    fn stripe_for(&self, key: &Key) -> &Stripe {
        let idx = (warp_storage::hash64(key.as_bytes()) as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    /// Insert or strengthen the edge `from -> to`. Existing edges are
    /// reinforced rather than overwritten: `new = min(1, max(old, new) +
    /// REINFORCEMENT)` (spec §4.6, confirmed choice among the two
    /// documented behaviors — see DESIGN.md).
    pub fn link(&self, from: &Key, to: &Key, strength: f32) -> f32 {
        let now = now_us();
        let stripe = self.stripe_for(from);
        let mut guard = stripe.edges.write();
        let links = guard.entry(from.clone()).or_default();
        if let Some(existing) = links.iter_mut().find(|l| &l.to == to) {
            existing.strength = (existing.strength.max(strength) + REINFORCEMENT).min(1.0);
            existing.last_reinforced_us = now;
            existing.strength
        } else {
            let new_strength = strength.clamp(0.0, 1.0);
            links.push(Link {
                to: to.clone(),
                strength: new_strength,
                last_reinforced_us: now,
            });
            new_strength
        }
    }

    pub fn unlink(&self, from: &Key, to: &Key) {
        let stripe = self.stripe_for(from);
        let mut guard = stripe.edges.write();
        if let Some(links) = guard.get_mut(from) {
            links.retain(|l| &l.to != to);
            if links.is_empty() {
                guard.remove(from);
            }
        }
    }

    /// Neighbors above `LINK_FLOOR`, strength descending, capped at
    /// `MAX_NEIGHBORS`. `exists` lazily prunes dangling links (spec
    /// invariant 4): any neighbor for which `exists(to_key)` is false is
    /// dropped from the index as a side effect of this read, not just
    /// filtered from the result.
    pub fn neighbors(&self, key: &Key, exists: impl Fn(&Key) -> bool) -> Vec<(Key, f32)> {
        let stripe = self.stripe_for(key);
        let mut guard = stripe.edges.write();
        let Some(links) = guard.get_mut(key) else {
            return Vec::new();
        };
        links.retain(|l| exists(&l.to));
        if links.is_empty() {
            guard.remove(key);
            return Vec::new();
        }
        let mut result: Vec<(Key, f32)> = links
            .iter()
            .filter(|l| l.strength >= LINK_FLOOR)
            .map(|l| (l.to.clone(), l.strength))
            .collect();
        result.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        result.truncate(MAX_NEIGHBORS);
        result
    }

    /// Evaluate configured patterns against a freshly inserted key,
    /// creating links for any trigger that matches (spec §4.6
    /// `apply_patterns`). Returns the links created so the caller can
    /// persist them through the shard WAL.
    pub fn apply_patterns(&self, new_key: &Key) -> Vec<(Key, Key, f32)> {
        let new_key_str = match std::str::from_utf8(new_key.as_bytes()) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let patterns = self.patterns.read();
        let mut created = Vec::new();
        for pattern in patterns.iter() {
            if let Some(target) = pattern.apply(new_key_str) {
                let to_key = Key::from(target.as_str());
                if to_key == *new_key {
                    continue;
                }
                let applied = self.link(new_key, &to_key, pattern.default_strength);
                created.push((new_key.clone(), to_key, applied));
            }
        }
        created
    }

    /// Apply a `link`/`unlink` WAL entry during recovery, rebuilding the
    /// in-memory index from the durable log (spec §4.6 "Durability").
    pub fn apply_wal_entry(&self, entry: &WalEntry) {
        let from = entry.key();
        match entry.op {
            WalOp::Link => {
                if let (Some(to_bytes), Some(strength)) = (&entry.link_target, entry.link_strength) {
                    let to = Key::new(to_bytes.clone());
                    // Recovery replays the exact recorded strength rather than
                    // re-running reinforcement, so replaying the same WAL
                    // twice converges to the same state (spec testable
                    // property 3: idempotent recovery).
                    self.set_exact(&from, &to, strength, entry.timestamp_us);
                }
            }
            WalOp::Unlink => {
                if let Some(to_bytes) = &entry.link_target {
                    self.unlink(&from, &Key::new(to_bytes.clone()));
                }
            }
            _ => {}
        }
    }

    fn set_exact(&self, from: &Key, to: &Key, strength: f32, last_reinforced_us: Timestamp) {
        let stripe = self.stripe_for(from);
        let mut guard = stripe.edges.write();
        let links = guard.entry(from.clone()).or_default();
        if let Some(existing) = links.iter_mut().find(|l| l.to == *to) {
            existing.strength = strength;
            existing.last_reinforced_us = last_reinforced_us;
        } else {
            links.push(Link {
                to: to.clone(),
                strength,
                last_reinforced_us,
            });
        }
    }

    /// Multiplicative decay on every entropy tick (spec §4.6): strengths
    /// shrink toward zero; edges that fall below `LINK_FLOOR` are dropped.
    pub fn decay_tick(&self) {
        for stripe in &self.stripes {
            let mut guard = stripe.edges.write();
            guard.retain(|_, links| {
                links.retain_mut(|l| {
                    l.strength *= DECAY;
                    l.strength >= LINK_FLOOR
                });
                !links.is_empty()
            });
        }
    }

    pub fn link_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.edges.read().values().map(Vec::len).sum::<usize>())
            .sum()
    }
}

/// Lets `warp_storage::Router::locate_candidates` ask "which shards hold
/// keys entangled with this one" without a hard dependency on this crate.
impl RelatedKeySource for EntanglementIndex {
    fn related_shards(&self, key: &Key, router: &Router) -> Vec<warp_core::types::ShardId> {
        let neighbors = self.neighbors(key, |_| true);
        let mut shards = Vec::new();
        for (to_key, _) in neighbors {
            let shard = router.shard_of(&to_key);
            if !shards.contains(&shard) {
                shards.push(shard);
            }
        }
        shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_then_neighbors_round_trips() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.8);
        let neighbors = index.neighbors(&Key::from("a"), |_| true);
        assert_eq!(neighbors, vec![(Key::from("b"), 0.8)]);
    }

    #[test]
    fn repeated_link_reinforces_via_max_plus_reinforcement() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.5);
        let strength = index.link(&Key::from("a"), &Key::from("b"), 0.3);
        assert!((strength - 0.55).abs() < 1e-6);
    }

    #[test]
    fn reinforcement_saturates_at_one() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.99);
        let strength = index.link(&Key::from("a"), &Key::from("b"), 0.99);
        assert!(strength <= 1.0);
    }

    #[test]
    fn unlink_removes_edge() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.5);
        index.unlink(&Key::from("a"), &Key::from("b"));
        assert!(index.neighbors(&Key::from("a"), |_| true).is_empty());
    }

    #[test]
    fn dangling_links_are_pruned_lazily_on_read() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.5);
        let neighbors = index.neighbors(&Key::from("a"), |k| k != &Key::from("b"));
        assert!(neighbors.is_empty());
        assert_eq!(index.link_count(), 0);
    }

    #[test]
    fn below_floor_links_are_excluded() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.01);
        assert!(index.neighbors(&Key::from("a"), |_| true).is_empty());
    }

    #[test]
    fn neighbors_sorted_descending_and_capped() {
        let index = EntanglementIndex::new();
        for i in 0..40u32 {
            let strength = 0.1 + (i as f32) * 0.01;
            index.link(&Key::from("a"), &Key::from(format!("k{i}").as_str()), strength);
        }
        let neighbors = index.neighbors(&Key::from("a"), |_| true);
        assert_eq!(neighbors.len(), MAX_NEIGHBORS);
        for pair in neighbors.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn decay_tick_shrinks_and_eventually_drops() {
        let index = EntanglementIndex::new();
        index.link(&Key::from("a"), &Key::from("b"), 0.06);
        for _ in 0..200 {
            index.decay_tick();
        }
        assert!(index.neighbors(&Key::from("a"), |_| true).is_empty());
    }

    #[test]
    fn pattern_with_wildcard_creates_link() {
        let index = EntanglementIndex::with_patterns(vec![EntanglementPattern {
            trigger_glob: "user:*".to_string(),
            target_glob_template: "profile:*".to_string(),
            default_strength: 0.6,
        }]);
        let created = index.apply_patterns(&Key::from("user:42"));
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1, Key::from("profile:42"));
        let neighbors = index.neighbors(&Key::from("user:42"), |_| true);
        assert_eq!(neighbors, vec![(Key::from("profile:42"), 0.6)]);
    }

    #[test]
    fn pattern_not_matching_trigger_is_noop() {
        let index = EntanglementIndex::with_patterns(vec![EntanglementPattern {
            trigger_glob: "order:*".to_string(),
            target_glob_template: "invoice:*".to_string(),
            default_strength: 0.5,
        }]);
        assert!(index.apply_patterns(&Key::from("user:42")).is_empty());
    }

    #[test]
    fn pattern_never_self_links() {
        let index = EntanglementIndex::with_patterns(vec![EntanglementPattern {
            trigger_glob: "*".to_string(),
            target_glob_template: "*".to_string(),
            default_strength: 0.5,
        }]);
        assert!(index.apply_patterns(&Key::from("x")).is_empty());
    }
}
