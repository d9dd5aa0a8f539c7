//! Shard Store (spec §4.4): per-shard in-memory table with metadata,
//! capacity-based admission control, and a consistency-mode-aware write
//! path through the shard's own WAL writer.
//!
//! Grounded on the reference codebase's `ShardedStore` (one independent
//! partition per key, `FxHashMap` for O(1) lookup plus a `BTreeSet` for
//! ordered iteration used by checkpointing). That type shards by a
//! dynamically-created `BranchId` in a `DashMap`; WarpEngine's shard count
//! is fixed at `open()`, so partitions are a plain `Vec` indexed by
//! `ShardId`, each behind its own `parking_lot::RwLock` for the "shared
//! reader lock / exclusive short writer critical section" discipline spec
//! §5 calls for, rather than one lock-free map shared across all shards.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use warp_core::types::{now_us, ConsistencyMode, Sequence, ShardId, Timestamp};
use warp_core::value::RecordMeta;
use warp_core::{Error, Key, Value};
use warp_durability::wal::{WalConfig, WalWriter};

struct Shard {
    table: FxHashMap<Key, (Value, RecordMeta)>,
    order: BTreeSet<Key>,
    wal: WalWriter,
    max_capacity: usize,
    consistency_mode: ConsistencyMode,
    read_only: bool,
    ops_total: u64,
}

impl Shard {
    fn open(shard_id: ShardId, wal_dir: PathBuf, max_capacity: usize, consistency_mode: ConsistencyMode, wal_config: WalConfig) -> Result<Self, Error> {
        let wal = WalWriter::open(wal_dir, shard_id, wal_config)?;
        Ok(Self {
            table: FxHashMap::default(),
            order: BTreeSet::new(),
            wal,
            max_capacity,
            consistency_mode,
            read_only: false,
            ops_total: 0,
        })
    }

    fn evict_coldest(&mut self) -> Option<Key> {
        let coldest = self
            .table
            .iter()
            .min_by_key(|(_, (_, meta))| (meta.last_access_us, meta.access_counter))
            .map(|(k, _)| k.clone())?;
        self.table.remove(&coldest);
        self.order.remove(&coldest);
        Some(coldest)
    }
}

/// Owns every shard's table, order index, and WAL writer.
pub struct ShardStore {
    shards: Vec<RwLock<Shard>>,
}

impl ShardStore {
    /// Open one shard per descriptor, each with its own WAL directory
    /// `<wal_root>/<shard_id>/`.
    pub fn open(
        wal_root: impl AsRef<Path>,
        shard_count: u32,
        max_capacity: usize,
        consistency_mode: ConsistencyMode,
        wal_config: WalConfig,
    ) -> Result<Self, Error> {
        let wal_root = wal_root.as_ref();
        let mut shards = Vec::with_capacity(shard_count as usize);
        for shard_id in 0..shard_count {
            let dir = wal_root.join(shard_id.to_string()).join("wal");
            let shard = Shard::open(shard_id, dir, max_capacity, consistency_mode, wal_config.clone())?;
            shards.push(RwLock::new(shard));
        }
        Ok(Self { shards })
    }

    fn shard(&self, shard_id: ShardId) -> &RwLock<Shard> {
        &self.shards[shard_id as usize]
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Insert or replace `key`'s value. Evicts the coldest entry if the
    /// shard is at capacity (rejecting instead, with `CapacityExceeded`,
    /// when the shard's consistency mode is `strong`).
    pub fn put(&self, shard_id: ShardId, key: Key, value: Value, tags: Vec<String>) -> Result<RecordMeta, Error> {
        let mut shard = self.shard(shard_id).write();
        if shard.read_only {
            return Err(Error::ShardReadOnly {
                shard_id,
                message: "shard is read-only".into(),
            });
        }

        let now = now_us();
        if !shard.table.contains_key(&key) && shard.table.len() >= shard.max_capacity {
            if shard.consistency_mode == ConsistencyMode::Strong {
                return Err(Error::CapacityExceeded { shard_id });
            }
            if let Some(evicted) = shard.evict_coldest() {
                shard.wal.append_delete(now, &evicted)?;
                tracing::debug!(target: "warp::shard", shard_id, "evicted coldest entry under capacity pressure");
            }
        }

        let meta = match shard.table.get(&key) {
            Some((_, existing)) => {
                let mut m = existing.clone();
                m.touch(now);
                m.tags = tags;
                m
            }
            None => {
                let mut m = RecordMeta::new(shard_id, now);
                m.tags = tags;
                m
            }
        };

        shard.wal.append_put(now, &key, &value)?;
        if shard.consistency_mode == ConsistencyMode::Strong {
            shard.wal.flush()?;
        }

        shard.order.insert(key.clone());
        shard.table.insert(key, (value, meta.clone()));
        shard.ops_total += 1;
        Ok(meta)
    }

    /// Look up a key; touches access metadata but never writes to the
    /// WAL (access stats are reconstructible approximately, so losing a
    /// touch on crash is acceptable).
    pub fn get(&self, shard_id: ShardId, key: &Key) -> Option<(Value, RecordMeta)> {
        let mut shard = self.shard(shard_id).write();
        let now = now_us();
        let entry = shard.table.get_mut(key)?;
        entry.1.touch(now);
        Some((entry.0.clone(), entry.1.clone()))
    }

    /// Check existence without touching access metadata (used for lazy
    /// dangling-link pruning, which should not count as an access).
    pub fn contains(&self, shard_id: ShardId, key: &Key) -> bool {
        self.shard(shard_id).read().table.contains_key(key)
    }

    /// Remove a key, emitting a tombstone WAL entry. Returns `false` if the
    /// key did not exist.
    pub fn delete(&self, shard_id: ShardId, key: &Key) -> Result<bool, Error> {
        let mut shard = self.shard(shard_id).write();
        if shard.read_only {
            return Err(Error::ShardReadOnly {
                shard_id,
                message: "shard is read-only".into(),
            });
        }
        if !shard.table.contains_key(key) {
            return Ok(false);
        }
        let now = now_us();
        shard.wal.append_delete(now, key)?;
        if shard.consistency_mode == ConsistencyMode::Strong {
            shard.wal.flush()?;
        }
        shard.table.remove(key);
        shard.order.remove(key);
        shard.ops_total += 1;
        Ok(true)
    }

    /// Restore a record during WAL replay / checkpoint load without
    /// re-emitting a WAL entry.
    pub fn restore(&self, shard_id: ShardId, key: Key, value: Value, meta: RecordMeta) {
        let mut shard = self.shard(shard_id).write();
        shard.order.insert(key.clone());
        shard.table.insert(key, (value, meta));
    }

    pub fn remove_silently(&self, shard_id: ShardId, key: &Key) {
        let mut shard = self.shard(shard_id).write();
        shard.table.remove(key);
        shard.order.remove(key);
    }

    /// Snapshot every entry currently in the shard for checkpointing.
    /// `Value` is an `Arc<[u8]>`, so this is O(n) pointer clones, not O(n)
    /// byte copies — a stop-the-world snapshot is cheap enough here that a
    /// separate copy-on-write path is not worth the added complexity (see
    /// DESIGN.md).
    pub fn snapshot_entries(&self, shard_id: ShardId) -> Vec<(Key, Value, RecordMeta)> {
        let shard = self.shard(shard_id).read();
        shard
            .order
            .iter()
            .filter_map(|k| shard.table.get(k).map(|(v, m)| (k.clone(), v.clone(), m.clone())))
            .collect()
    }

    pub fn len(&self, shard_id: ShardId) -> usize {
        self.shard(shard_id).read().table.len()
    }

    /// Cumulative put/delete count for this shard, used by the Checkpoint
    /// Manager's `CHECKPOINT_OPS` trigger condition (spec §4.3).
    pub fn ops_total(&self, shard_id: ShardId) -> u64 {
        self.shard(shard_id).read().ops_total
    }

    /// Cumulative WAL bytes written for this shard, used by the Checkpoint
    /// Manager's `CHECKPOINT_WAL_BYTES` trigger condition (spec §4.3).
    pub fn wal_bytes_written(&self, shard_id: ShardId) -> u64 {
        self.shard(shard_id).read().wal.total_bytes_written()
    }

    /// Sequence of the most recently written WAL entry for this shard, or
    /// 0 if nothing has been written yet. Recorded as a checkpoint's
    /// `last_included_sequence` at the instant [`ShardStore::snapshot_entries`]
    /// is taken for that shard.
    pub fn last_sequence(&self, shard_id: ShardId) -> Sequence {
        self.shard(shard_id).read().wal.peek_next_sequence().saturating_sub(1)
    }

    pub fn is_read_only(&self, shard_id: ShardId) -> bool {
        self.shard(shard_id).read().read_only
    }

    pub fn mark_read_only(&self, shard_id: ShardId) {
        self.shard(shard_id).write().read_only = true;
        tracing::error!(target: "warp::shard", shard_id, "shard marked read-only after io error");
    }

    pub fn flush(&self, shard_id: ShardId) -> Result<(), Error> {
        self.shard(shard_id).write().wal.flush()
    }

    pub fn flush_all(&self) -> Result<(), Error> {
        for shard_id in 0..self.shard_count() {
            self.flush(shard_id)?;
        }
        Ok(())
    }

    pub fn maybe_interval_flush(&self, shard_id: ShardId) -> Result<bool, Error> {
        self.shard(shard_id).write().wal.maybe_interval_flush()
    }

    pub fn rotate(&self, shard_id: ShardId) -> Result<(), Error> {
        self.shard(shard_id).write().wal.rotate()
    }

    pub fn truncate_through(&self, shard_id: ShardId, sequence: Timestamp) -> Result<(), Error> {
        self.shard(shard_id).write().wal.truncate_through(sequence)
    }

    /// Append a durable `link` entry through the `from` key's shard WAL
    /// (spec §4.6: entanglement mutations are durable via the shard WAL of
    /// the `from` key, not a separate log).
    pub fn append_link(&self, shard_id: ShardId, from: &Key, to: &Key, strength: f32) -> Result<(), Error> {
        let mut shard = self.shard(shard_id).write();
        if shard.read_only {
            return Err(Error::ShardReadOnly {
                shard_id,
                message: "shard is read-only".into(),
            });
        }
        shard.wal.append_link(now_us(), from, to, strength)?;
        Ok(())
    }

    /// Fix up the shard's WAL sequence counter after a recovery replay has
    /// determined the true last-written sequence (see
    /// `WalWriter::resume_from`). Called once per shard, after checkpoint
    /// load and WAL replay, before the shard accepts new writes.
    pub fn resume_wal_sequence(&self, shard_id: ShardId, last_written_sequence: Option<Sequence>) {
        self.shard(shard_id).write().wal.resume_from(last_written_sequence);
    }

    pub fn append_unlink(&self, shard_id: ShardId, from: &Key, to: &Key) -> Result<(), Error> {
        let mut shard = self.shard(shard_id).write();
        if shard.read_only {
            return Err(Error::ShardReadOnly {
                shard_id,
                message: "shard is read-only".into(),
            });
        }
        shard.wal.append_unlink(now_us(), from, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path, n: u32, cap: usize, mode: ConsistencyMode) -> ShardStore {
        ShardStore::open(dir, n, cap, mode, WalConfig::for_testing()).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, 100, ConsistencyMode::Eventual);
        store.put(0, Key::from("a"), Value::from("1"), vec![]).unwrap();
        let (v, _) = store.get(0, &Key::from("a")).unwrap();
        assert_eq!(v, Value::from("1"));
    }

    #[test]
    fn delete_removes_and_reports_previous_presence() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, 100, ConsistencyMode::Eventual);
        store.put(0, Key::from("a"), Value::from("1"), vec![]).unwrap();
        assert!(store.delete(0, &Key::from("a")).unwrap());
        assert!(store.get(0, &Key::from("a")).is_none());
        assert!(!store.delete(0, &Key::from("a")).unwrap());
    }

    #[test]
    fn capacity_eviction_drops_coldest_entry() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, 3, ConsistencyMode::Eventual);
        store.put(0, Key::from("a"), Value::from("1"), vec![]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.put(0, Key::from("b"), Value::from("2"), vec![]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.put(0, Key::from("c"), Value::from("3"), vec![]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.put(0, Key::from("d"), Value::from("4"), vec![]).unwrap();
        assert!(store.get(0, &Key::from("a")).is_none());
        assert_eq!(store.len(0), 3);
    }

    #[test]
    fn strong_mode_rejects_instead_of_evicting() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, 1, ConsistencyMode::Strong);
        store.put(0, Key::from("a"), Value::from("1"), vec![]).unwrap();
        let err = store.put(0, Key::from("b"), Value::from("2"), vec![]).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }
}
